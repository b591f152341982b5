//! Loading and lookup of per-model rule tables
//!
//! Every model owns a cache namespace of lookup-key to score entries,
//! reloaded wholesale from an hourly CSV drop. The first CSV column is the
//! composed lookup key; remaining columns are ignored. The stored score is a
//! function of the model's type tag, not of the file contents.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

use dte_config::score_for_model_type;

use crate::cache::{CacheValue, LocalCacheRegistry, CACHE_KEY_MODEL_RESULT_FILE_IDENTIFIER};
use crate::config_loader::ModelConfigurationHandler;
use crate::metrics::{
    EvaluatorMetrics, RESULT_FILE_FAILED, RESULT_FILE_REFRESHED, RESULT_FILE_SKIPPED,
};
use crate::store::{bucket_from_prefix, read_local_file, ObjectStore};
use crate::time::Clock;
use crate::transform::ModelFeature;

pub const KEY_DELIMITER: &str = "|";

/// Score and the composed key used to retrieve it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResult {
    pub value: f32,
    pub key: String,
}

/// Concatenation of all transformed feature values, across features in
/// order, joined by `|`. A feature that produced no values contributes
/// nothing.
pub fn build_key(features: &[ModelFeature]) -> String {
    features
        .iter()
        .flat_map(|feature| feature.values.iter())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(KEY_DELIMITER)
}

pub struct ModelResultHandler {
    ssp_identifier: String,
    folder_prefix: String,
    store: Arc<dyn ObjectStore>,
    model_configuration: Arc<ModelConfigurationHandler>,
    cache: Arc<LocalCacheRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EvaluatorMetrics>,
}

impl ModelResultHandler {
    pub fn new(
        ssp_identifier: impl Into<String>,
        folder_prefix: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        model_configuration: Arc<ModelConfigurationHandler>,
        cache: Arc<LocalCacheRegistry>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EvaluatorMetrics>,
    ) -> Self {
        ModelResultHandler {
            ssp_identifier: ssp_identifier.into(),
            folder_prefix: folder_prefix.into(),
            store,
            model_configuration,
            cache,
            clock,
            metrics,
        }
    }

    /// Path of a model's result file in the current hourly partition:
    /// `<ssp>/<YYYY-MM-DD>/<HH>/<model-identifier>.csv`, UTC.
    pub fn result_file_name(&self, model_identifier: &str) -> String {
        let now = self.clock.now_utc();
        format!(
            "{}/{}/{}/{model_identifier}.csv",
            self.ssp_identifier,
            now.format("%Y-%m-%d"),
            now.format("%H"),
        )
    }

    /// Walk every model in the current configuration and reload the rule
    /// table of each model whose source file changed. Fetch failures skip
    /// the affected model; a read failure after a successful fetch aborts
    /// the cycle.
    pub async fn load(&self) -> Result<()> {
        let model_configuration = self
            .model_configuration
            .provide()
            .context("fail to provide model configuration")?;

        let mut put_item_counter = 0u64;
        let mut put_item_total_size = 0u64;

        for (model_identifier, definition) in
            &model_configuration.model_definition_by_identifier
        {
            let file_name = self.result_file_name(model_identifier);
            let model_result_value =
                score_for_model_type(&definition.model_type).unwrap_or_else(|| {
                    info!(
                        model = %model_identifier,
                        model_type = %definition.model_type,
                        "model type has no score mapping, defaulting to low value"
                    );
                    0.0
                });

            let contents = if let Some(bucket) = bucket_from_prefix(&self.folder_prefix) {
                let fetched = match self.store.fetch(bucket, &file_name).await {
                    Ok(fetched) => fetched,
                    Err(error) => {
                        error!(file = %file_name, %error, "error fetching model result file");
                        self.metrics
                            .result_files_total
                            .with_label_values(&[RESULT_FILE_FAILED])
                            .inc();
                        continue;
                    }
                };
                if !self
                    .cache
                    .should_refresh(CACHE_KEY_MODEL_RESULT_FILE_IDENTIFIER, fetched.fingerprint())
                {
                    info!(file = %file_name, "skipping refresh, source unchanged");
                    self.metrics
                        .result_files_total
                        .with_label_values(&[RESULT_FILE_SKIPPED])
                        .inc();
                    continue;
                }
                fetched.into_bytes().await.context("error getting data")?
            } else {
                let file_path = Path::new(&self.folder_prefix).join(&file_name);
                let mut file = match File::open(&file_path) {
                    Ok(file) => file,
                    Err(error) => {
                        error!(file = %file_path.display(), %error, "error opening model result file");
                        self.metrics
                            .result_files_total
                            .with_label_values(&[RESULT_FILE_FAILED])
                            .inc();
                        continue;
                    }
                };
                if !self
                    .cache
                    .should_refresh_local(CACHE_KEY_MODEL_RESULT_FILE_IDENTIFIER, &file)
                {
                    info!(file = %file_path.display(), "skipping refresh, source unchanged");
                    self.metrics
                        .result_files_total
                        .with_label_values(&[RESULT_FILE_SKIPPED])
                        .inc();
                    continue;
                }
                read_local_file(&mut file).context("error getting data")?
            };

            // New drop detected: drop the whole table, then reinsert. A
            // reader racing the reload sees an empty namespace and falls
            // back to its caller-supplied default.
            self.cache.clear(model_identifier);
            self.metrics
                .result_files_total
                .with_label_values(&[RESULT_FILE_REFRESHED])
                .inc();

            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(contents.as_slice());
            for record in reader.records() {
                let record = match record {
                    Ok(record) => record,
                    Err(error) => {
                        error!(file = %file_name, %error, "error reading record");
                        continue;
                    }
                };
                let Some(key) = record.get(0) else {
                    continue;
                };
                self.cache
                    .put(model_identifier, key, CacheValue::Score(model_result_value));
                put_item_counter += 1;
                put_item_total_size += key.len() as u64;
            }
        }

        self.metrics.result_rows_loaded_total.inc_by(put_item_counter);
        info!(
            rows = put_item_counter,
            key_bytes = put_item_total_size,
            "model result load complete"
        );
        Ok(())
    }

    /// Look up a model's score for the composed feature key. A missing entry
    /// yields the caller-supplied default; a present entry of the wrong type
    /// is an error.
    pub fn provide(
        &self,
        model_identifier: &str,
        features: &[ModelFeature],
        default_value: f32,
    ) -> Result<ModelResult> {
        let key = build_key(features);
        debug!(model = %model_identifier, key = %key, "providing model result");
        match self.cache.get(model_identifier, &key) {
            None => {
                info!(
                    model = %model_identifier,
                    key = %key,
                    default = f64::from(default_value),
                    "no entry for key, returning default"
                );
                Ok(ModelResult {
                    value: default_value,
                    key,
                })
            }
            Some(CacheValue::Score(value)) => Ok(ModelResult { value, key }),
            Some(_) => bail!(
                "invalid model result type for identifier [{model_identifier}] and key [{key}]: expected score"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCacheRegistry;
    use crate::config_loader::ConfigurationLoader;
    use crate::store::InMemoryObjectStore;
    use crate::time::FixedClock;
    use chrono::{TimeZone, Utc};
    use prometheus::Registry;

    const MODEL_CONFIG: &str = r#"{
        "modelDefinitionByIdentifier": {
            "adsp_low-value_v2": {
                "identifier": "adsp_low-value_v2",
                "type": "LowValue",
                "features": [{"name": "country", "fields": ["$.device.geo.country"], "transformation": []}]
            }
        }
    }"#;

    struct Fixture {
        store: Arc<InMemoryObjectStore>,
        cache: Arc<LocalCacheRegistry>,
        handler: ModelResultHandler,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/model/config.json",
            "config-etag-1",
            MODEL_CONFIG,
        );
        let cache = Arc::new(LocalCacheRegistry::new());
        let model_configuration = Arc::new(ModelConfigurationHandler::new(
            ConfigurationLoader::new("s3://test-bucket", "ssp-1", store.clone(), cache.clone()),
        ));
        model_configuration.load().await.unwrap();

        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 8, 2, 7, 15, 0).unwrap());
        let metrics = Arc::new(EvaluatorMetrics::new(&Registry::new()).unwrap());
        let handler = ModelResultHandler::new(
            "ssp-1",
            "s3://test-bucket",
            store.clone(),
            model_configuration,
            cache.clone(),
            Arc::new(clock),
            metrics,
        );
        Fixture {
            store,
            cache,
            handler,
        }
    }

    fn features(values: &[&str]) -> Vec<ModelFeature> {
        vec![ModelFeature {
            name: "country".to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }]
    }

    #[test]
    fn key_joins_values_across_features() {
        let features = vec![
            ModelFeature {
                name: "country".to_string(),
                values: vec!["US".to_string()],
            },
            ModelFeature {
                name: "empty".to_string(),
                values: vec![],
            },
            ModelFeature {
                name: "size".to_string(),
                values: vec!["300x250".to_string(), "728x90".to_string()],
            },
        ];
        assert_eq!(build_key(&features), "US|300x250|728x90");
    }

    #[tokio::test]
    async fn load_installs_rows_in_hourly_partition() {
        let f = fixture().await;
        f.store.insert(
            "test-bucket",
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv",
            "rows-etag-1",
            "US,0.013\nDE,0.021\n",
        );

        f.handler.load().await.unwrap();

        let result = f
            .handler
            .provide("adsp_low-value_v2", &features(&["US"]), 1.0)
            .unwrap();
        assert_eq!(result.value, 0.0);
        assert_eq!(result.key, "US");
    }

    #[tokio::test]
    async fn miss_returns_caller_default() {
        let f = fixture().await;
        f.store.insert(
            "test-bucket",
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv",
            "rows-etag-1",
            "US,0.013\n",
        );
        f.handler.load().await.unwrap();

        let result = f
            .handler
            .provide("adsp_low-value_v2", &features(&["JP"]), 1.0)
            .unwrap();
        assert_eq!(result.value, 1.0);
        assert_eq!(result.key, "JP");
    }

    #[tokio::test]
    async fn unchanged_fingerprint_skips_reload() {
        let f = fixture().await;
        f.store.insert(
            "test-bucket",
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv",
            "rows-etag-1",
            "US,0.013\n",
        );
        f.handler.load().await.unwrap();

        // Drop a poison row behind the same fingerprint; a skipped reload
        // must leave the installed table untouched.
        f.store.insert(
            "test-bucket",
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv",
            "rows-etag-1",
            "POISON,9.9\n",
        );
        f.handler.load().await.unwrap();
        assert_eq!(
            f.handler
                .provide("adsp_low-value_v2", &features(&["US"]), 1.0)
                .unwrap()
                .value,
            0.0
        );
    }

    #[tokio::test]
    async fn changed_fingerprint_clears_namespace_before_insert() {
        let f = fixture().await;
        f.store.insert(
            "test-bucket",
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv",
            "rows-etag-1",
            "US,0.013\n",
        );
        f.handler.load().await.unwrap();

        f.store.insert(
            "test-bucket",
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv",
            "rows-etag-2",
            "DE,0.021\n",
        );
        f.handler.load().await.unwrap();

        // Old rows are gone, new rows present.
        assert_eq!(
            f.handler
                .provide("adsp_low-value_v2", &features(&["US"]), 1.0)
                .unwrap()
                .value,
            1.0
        );
        assert_eq!(
            f.handler
                .provide("adsp_low-value_v2", &features(&["DE"]), 1.0)
                .unwrap()
                .value,
            0.0
        );
    }

    #[tokio::test]
    async fn missing_result_file_skips_model_without_failing() {
        let f = fixture().await;
        assert!(f.handler.load().await.is_ok());
    }

    #[tokio::test]
    async fn type_mismatch_is_an_error() {
        let f = fixture().await;
        f.cache.put(
            "adsp_low-value_v2",
            "US",
            CacheValue::Text("not a score".to_string()),
        );
        assert!(f
            .handler
            .provide("adsp_low-value_v2", &features(&["US"]), 1.0)
            .is_err());
    }

    #[tokio::test]
    async fn result_file_name_uses_utc_hour_bucket() {
        let f = fixture().await;
        assert_eq!(
            f.handler.result_file_name("adsp_low-value_v2"),
            "ssp-1/2026-08-02/07/adsp_low-value_v2.csv"
        );
    }
}
