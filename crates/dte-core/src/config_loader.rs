//! Fingerprint-aware loading of model and experiment configuration files
//!
//! One generic loader covers both configuration types; the per-type facts
//! (file path segment, fingerprint key, cache data key, cache value wrapper)
//! live in the `ConfigKind` impls. A load is a no-op when the source
//! fingerprint matches the one seen last, so unchanged files are parsed at
//! most once.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use dte_config::{ExperimentConfiguration, ModelConfiguration};

use crate::allocator::TrafficAllocation;
use crate::cache::{
    CacheValue, LocalCacheRegistry, CACHE_KEY_EXPERIMENT,
    CACHE_KEY_EXPERIMENT_CONFIGURATION_FILE_IDENTIFIER, CACHE_KEY_MODEL,
    CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, CACHE_NAME_CONFIGURATION,
};
use crate::store::{bucket_from_prefix, read_local_file, ObjectStore};

/// Per-type constants and cache-value conversions for a configuration file.
pub trait ConfigKind: DeserializeOwned + Send + Sync + 'static {
    /// Path segment in `<ssp>/configuration/<FILE_TYPE>/config.json`.
    const FILE_TYPE: &'static str;
    const FINGERPRINT_KEY: &'static str;
    const DATA_KEY: &'static str;

    fn into_cache_value(self) -> CacheValue;
    fn from_cache_value(value: &CacheValue) -> Option<Arc<Self>>;
}

impl ConfigKind for ModelConfiguration {
    const FILE_TYPE: &'static str = "model";
    const FINGERPRINT_KEY: &'static str = CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER;
    const DATA_KEY: &'static str = CACHE_KEY_MODEL;

    fn into_cache_value(self) -> CacheValue {
        CacheValue::ModelConfig(Arc::new(self))
    }

    fn from_cache_value(value: &CacheValue) -> Option<Arc<Self>> {
        match value {
            CacheValue::ModelConfig(config) => Some(config.clone()),
            _ => None,
        }
    }
}

impl ConfigKind for ExperimentConfiguration {
    const FILE_TYPE: &'static str = "experiment";
    const FINGERPRINT_KEY: &'static str = CACHE_KEY_EXPERIMENT_CONFIGURATION_FILE_IDENTIFIER;
    const DATA_KEY: &'static str = CACHE_KEY_EXPERIMENT;

    fn into_cache_value(self) -> CacheValue {
        CacheValue::ExperimentConfig(Arc::new(self))
    }

    fn from_cache_value(value: &CacheValue) -> Option<Arc<Self>> {
        match value {
            CacheValue::ExperimentConfig(config) => Some(config.clone()),
            _ => None,
        }
    }
}

pub struct ConfigurationLoader<T: ConfigKind> {
    folder_prefix: String,
    ssp_identifier: String,
    store: Arc<dyn ObjectStore>,
    cache: Arc<LocalCacheRegistry>,
    _config: PhantomData<fn() -> T>,
}

impl<T: ConfigKind> ConfigurationLoader<T> {
    pub fn new(
        folder_prefix: impl Into<String>,
        ssp_identifier: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        cache: Arc<LocalCacheRegistry>,
    ) -> Self {
        ConfigurationLoader {
            folder_prefix: folder_prefix.into(),
            ssp_identifier: ssp_identifier.into(),
            store,
            cache,
            _config: PhantomData,
        }
    }

    fn configuration_file_name(&self) -> String {
        format!(
            "{}/configuration/{}/config.json",
            self.ssp_identifier,
            T::FILE_TYPE
        )
    }

    /// Fetch, fingerprint-check, parse and install the configuration.
    /// Returns `Ok(true)` when a new configuration was installed and
    /// `Ok(false)` when the source is unchanged.
    pub async fn load(&self) -> Result<bool> {
        let file_name = self.configuration_file_name();

        let json_data = if let Some(bucket) = bucket_from_prefix(&self.folder_prefix) {
            let fetched = self
                .store
                .fetch(bucket, &file_name)
                .await
                .context("error fetching object")?;
            if !self.cache.should_refresh(T::FINGERPRINT_KEY, fetched.fingerprint()) {
                info!(file = %file_name, "skipping refresh, source unchanged");
                return Ok(false);
            }
            fetched.into_bytes().await.context("error getting data")?
        } else {
            let file_path = Path::new(&self.folder_prefix).join(&file_name);
            let mut file = File::open(&file_path)
                .with_context(|| format!("error opening file {}", file_path.display()))?;
            if !self.cache.should_refresh_local(T::FINGERPRINT_KEY, &file) {
                info!(file = %file_path.display(), "skipping refresh, source unchanged");
                return Ok(false);
            }
            read_local_file(&mut file).context("error getting data")?
        };

        let config: T = serde_json::from_slice(&json_data)
            .with_context(|| format!("error parsing {} configuration JSON", T::FILE_TYPE))?;
        debug!(file = %file_name, bytes = json_data.len(), "configuration parsed");

        // Configurations never expire; they are only ever replaced.
        self.cache.put_with_ttl(
            CACHE_NAME_CONFIGURATION,
            T::DATA_KEY,
            config.into_cache_value(),
            0,
        );
        Ok(true)
    }

    /// Read the installed configuration back from the cache.
    pub fn provide(&self) -> Result<Arc<T>> {
        let value = self
            .cache
            .get(CACHE_NAME_CONFIGURATION, T::DATA_KEY)
            .ok_or_else(|| {
                anyhow!(
                    "error getting config from local cache [{CACHE_NAME_CONFIGURATION}] with key [{}]",
                    T::DATA_KEY
                )
            })?;
        T::from_cache_value(&value)
            .ok_or_else(|| anyhow!("retrieved config is not of type [{}]", T::FILE_TYPE))
    }
}

/// Handler for the model configuration file.
pub struct ModelConfigurationHandler {
    loader: ConfigurationLoader<ModelConfiguration>,
}

impl ModelConfigurationHandler {
    pub fn new(loader: ConfigurationLoader<ModelConfiguration>) -> Self {
        ModelConfigurationHandler { loader }
    }

    pub async fn load(&self) -> Result<bool> {
        self.loader.load().await
    }

    pub fn provide(&self) -> Result<Arc<ModelConfiguration>> {
        self.loader.provide()
    }

    /// Union of every field path referenced by any feature of any model,
    /// deduplicated. Order is unspecified.
    pub fn all_unique_feature_fields(&self) -> Result<Vec<String>> {
        let config = self
            .loader
            .provide()
            .context("error getting model configuration for feature fields")?;

        let mut unique_fields = std::collections::HashSet::new();
        for definition in config.model_definition_by_identifier.values() {
            for feature in &definition.features {
                for field in &feature.fields {
                    unique_fields.insert(field.clone());
                }
            }
        }
        Ok(unique_fields.into_iter().collect())
    }
}

/// Handler for the experiment configuration file. A successful install is
/// chained into the traffic allocator; a clean fingerprint hit leaves the
/// allocator untouched.
pub struct ExperimentConfigurationHandler {
    loader: ConfigurationLoader<ExperimentConfiguration>,
    traffic_allocator: Arc<dyn TrafficAllocation>,
}

impl ExperimentConfigurationHandler {
    pub fn new(
        loader: ConfigurationLoader<ExperimentConfiguration>,
        traffic_allocator: Arc<dyn TrafficAllocation>,
    ) -> Self {
        ExperimentConfigurationHandler {
            loader,
            traffic_allocator,
        }
    }

    pub async fn load(&self) -> Result<bool> {
        let installed = self
            .loader
            .load()
            .await
            .context("failed to load experiment configuration")?;
        if !installed {
            return Ok(false);
        }

        let config = self
            .loader
            .provide()
            .context("failed to provide experiment configuration")?;
        self.traffic_allocator
            .update_configuration(config)
            .context("failed to update traffic allocator configuration")?;
        Ok(true)
    }

    pub fn provide(&self) -> Result<Arc<ExperimentConfiguration>> {
        self.loader.provide()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TrafficAllocator;
    use crate::store::InMemoryObjectStore;

    const MODEL_CONFIG: &str = r#"{
        "modelDefinitionByIdentifier": {
            "adsp_low-value_v2": {
                "identifier": "adsp_low-value_v2",
                "type": "LowValue",
                "featureExtractorType": "JsonExtractor",
                "features": [
                    {"name": "country", "fields": ["$.device.geo.country"], "transformation": []},
                    {"name": "app", "fields": ["$.app.bundle", "$.device.geo.country"], "transformation": []}
                ]
            }
        }
    }"#;

    const EXPERIMENT_CONFIG: &str = r#"{
        "experimentDefinitionByName": {
            "exp": {
                "name": "exp",
                "type": "soft-filter",
                "treatments": [{"treatmentCode": "T", "weight": 100}]
            }
        },
        "modelToExperiment": {"adsp_low-value_v2": "exp"}
    }"#;

    fn model_loader(
        store: Arc<InMemoryObjectStore>,
        cache: Arc<LocalCacheRegistry>,
    ) -> ConfigurationLoader<ModelConfiguration> {
        ConfigurationLoader::new("s3://test-bucket", "ssp-1", store, cache)
    }

    #[tokio::test]
    async fn load_installs_then_skips_on_unchanged_fingerprint() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/model/config.json",
            "etag-1",
            MODEL_CONFIG,
        );
        let cache = Arc::new(LocalCacheRegistry::new());
        let loader = model_loader(store.clone(), cache.clone());

        assert!(loader.load().await.unwrap());
        assert!(!loader.load().await.unwrap());

        let provided = loader.provide().unwrap();
        assert!(provided
            .model_definition_by_identifier
            .contains_key("adsp_low-value_v2"));

        // A changed fingerprint reinstalls.
        store.insert(
            "test-bucket",
            "ssp-1/configuration/model/config.json",
            "etag-2",
            MODEL_CONFIG,
        );
        assert!(loader.load().await.unwrap());
    }

    #[tokio::test]
    async fn provide_identity_is_stable_across_clean_loads() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/model/config.json",
            "etag-1",
            MODEL_CONFIG,
        );
        let loader = model_loader(store, Arc::new(LocalCacheRegistry::new()));

        loader.load().await.unwrap();
        let first = loader.provide().unwrap();
        loader.load().await.unwrap();
        let second = loader.provide().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn malformed_json_is_an_error_and_installs_nothing() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/model/config.json",
            "etag-1",
            "{not json",
        );
        let loader = model_loader(store, Arc::new(LocalCacheRegistry::new()));

        assert!(loader.load().await.is_err());
        assert!(loader.provide().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_is_an_error() {
        let store = Arc::new(InMemoryObjectStore::new());
        let loader = model_loader(store, Arc::new(LocalCacheRegistry::new()));
        assert!(loader.load().await.is_err());
    }

    #[tokio::test]
    async fn local_mode_load_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("ssp-1/configuration/model");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.json"), MODEL_CONFIG).unwrap();

        let loader: ConfigurationLoader<ModelConfiguration> = ConfigurationLoader::new(
            dir.path().to_str().unwrap(),
            "ssp-1",
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(LocalCacheRegistry::new()),
        );

        assert!(loader.load().await.unwrap());
        assert!(!loader.load().await.unwrap());
        assert!(loader.provide().is_ok());
    }

    #[tokio::test]
    async fn missing_local_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader: ConfigurationLoader<ModelConfiguration> = ConfigurationLoader::new(
            dir.path().to_str().unwrap(),
            "ssp-1",
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(LocalCacheRegistry::new()),
        );
        assert!(loader.load().await.is_err());
    }

    #[tokio::test]
    async fn unique_feature_fields_are_deduplicated() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/model/config.json",
            "etag-1",
            MODEL_CONFIG,
        );
        let cache = Arc::new(LocalCacheRegistry::new());
        let handler = ModelConfigurationHandler::new(model_loader(store, cache));
        handler.load().await.unwrap();

        let mut fields = handler.all_unique_feature_fields().unwrap();
        fields.sort();
        assert_eq!(fields, vec!["$.app.bundle", "$.device.geo.country"]);
    }

    #[tokio::test]
    async fn experiment_load_updates_allocator_only_on_install() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/experiment/config.json",
            "etag-1",
            EXPERIMENT_CONFIG,
        );
        let cache = Arc::new(LocalCacheRegistry::new());
        let allocator = Arc::new(TrafficAllocator::with_seed(3));
        let handler = ExperimentConfigurationHandler::new(
            ConfigurationLoader::new("s3://test-bucket", "ssp-1", store, cache),
            allocator.clone(),
        );

        assert!(handler.load().await.unwrap());
        let snapshot = allocator.allocation_snapshot();
        assert_eq!(snapshot.treatment_code("exp"), "T");

        // Second load is a clean hit and leaves the allocator untouched.
        assert!(!handler.load().await.unwrap());
    }

    #[tokio::test]
    async fn experiment_load_surfaces_weight_violation() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert(
            "test-bucket",
            "ssp-1/configuration/experiment/config.json",
            "etag-1",
            r#"{
                "experimentDefinitionByName": {
                    "exp": {"name": "exp", "type": "soft-filter",
                            "treatments": [{"treatmentCode": "A", "weight": 60},
                                           {"treatmentCode": "B", "weight": 60}]}
                },
                "modelToExperiment": {}
            }"#,
        );
        let handler = ExperimentConfigurationHandler::new(
            ConfigurationLoader::new(
                "s3://test-bucket",
                "ssp-1",
                store,
                Arc::new(LocalCacheRegistry::new()),
            ),
            Arc::new(TrafficAllocator::with_seed(3)),
        );

        let error = handler.load().await.unwrap_err();
        assert!(format!("{error:#}").contains("total weight must be 100"));
    }
}
