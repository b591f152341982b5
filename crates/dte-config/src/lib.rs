//! DTE Config - configuration data model for the demand traffic evaluator
//!
//! Mirrors the JSON layout of the model and experiment configuration files
//! published alongside the hourly model result drops. Field names on the wire
//! are camelCase; unknown fields are ignored so configuration producers can
//! roll forward without breaking older library versions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Treatment code that keeps the filter active. Any other code is control.
pub const TREATMENT_GROUP_T: &str = "T";

/// The only experiment type currently dispatched by the request evaluator.
pub const EXPERIMENT_TYPE_SOFT_FILTER: &str = "soft-filter";

/// Model type tags with a defined score mapping.
pub const MODEL_TYPE_LOW_VALUE: &str = "LowValue";
pub const MODEL_TYPE_HIGH_VALUE: &str = "HighValue";

/// The only feature extractor currently supported; json paths in the model
/// configuration describe where feature values live in the OpenRTB request.
pub const FEATURE_EXTRACTOR_JSON: &str = "JsonExtractor";

/// Score assigned to every row of a model result file, keyed by the model's
/// type tag. Unknown tags are not an error; callers fall back to the low
/// value score (0.0).
pub fn score_for_model_type(model_type: &str) -> Option<f32> {
    match model_type {
        MODEL_TYPE_LOW_VALUE => Some(0.0),
        MODEL_TYPE_HIGH_VALUE => Some(1.0),
        _ => None,
    }
}

/// All model configurations, from `<ssp>/configuration/model/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfiguration {
    #[serde(default)]
    pub model_definition_by_identifier: HashMap<String, Arc<ModelDefinition>>,
}

/// A single model definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefinition {
    /// Unique identifier for the model, `<dsp>_<name>_<version>`.
    pub identifier: String,

    /// Name of the signal, without version information.
    #[serde(default)]
    pub name: String,

    /// Name of the DSP sharing this signal.
    #[serde(default)]
    pub dsp: String,

    /// Version of the signal.
    #[serde(default)]
    pub version: String,

    /// Type of the model. Decides the score stored for every result row.
    #[serde(rename = "type", default)]
    pub model_type: String,

    /// How feature extraction is defined. Currently only "JsonExtractor".
    #[serde(default)]
    pub feature_extractor_type: String,

    /// Ordered list of features and how to extract and transform each one.
    #[serde(default)]
    pub features: Vec<FeatureConfiguration>,
}

/// Extraction and transformation recipe for one feature of one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConfiguration {
    #[serde(default)]
    pub name: String,

    /// Ordered json paths in the OpenRTB request to pull values from,
    /// e.g. `$.device.geo.country` or `$.imp[0].banner.w`.
    #[serde(default)]
    pub fields: Vec<String>,

    /// Ordered transformer names applied to the extracted values.
    #[serde(rename = "transformation", default)]
    pub transformations: Vec<String>,

    /// Lookup table for the `ApplyMappings` transformer.
    #[serde(default)]
    pub mapping: HashMap<String, String>,

    /// Fallback used by `ApplyMappings` when a value has no mapping entry.
    #[serde(default)]
    pub mapping_default_value: String,
}

/// All experiment configurations, from
/// `<ssp>/configuration/experiment/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfiguration {
    #[serde(rename = "type", default)]
    pub config_type: String,

    #[serde(default)]
    pub experiment_definition_by_name: HashMap<String, ExperimentDefinition>,

    /// Many models map to one experiment.
    #[serde(default)]
    pub model_to_experiment: HashMap<String, String>,
}

/// A single experiment definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentDefinition {
    pub name: String,

    /// Experiment type. Currently only "soft-filter" is dispatched.
    #[serde(rename = "type", default)]
    pub experiment_type: String,

    /// Ordered treatments; order defines the cumulative allocation buckets.
    #[serde(default)]
    pub treatments: Vec<Treatment>,

    /// Experiment start, UTC epoch milliseconds. Informational only.
    #[serde(rename = "startTimeUTC", default)]
    pub start_time_utc: i64,

    /// Experiment end, UTC epoch milliseconds. Informational only.
    #[serde(rename = "endTimeUTC", default)]
    pub end_time_utc: i64,
}

/// One traffic arm of an experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Treatment {
    pub treatment_code: String,

    /// Probability (in percent) that a request lands in this arm. Weights of
    /// an experiment must sum to exactly 100.
    pub weight: u32,
}

/// Host-supplied settings for one evaluator instance. A process is
/// homogeneous: every configuration and result file resolves against the
/// same folder prefix.
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    /// Identifier of the integrating SSP; first path segment of every file.
    pub ssp_identifier: String,

    /// Either `s3://<bucket-name>` or a local filesystem path.
    pub folder_prefix: String,

    /// Object store region, used when the prefix is an `s3://` bucket.
    pub region: String,

    /// Period between refresh attempts for every loading task.
    pub refresh_interval_ms: u64,
}

impl EvaluatorSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ssp_identifier.is_empty() {
            anyhow::bail!("ssp_identifier cannot be empty");
        }
        if self.folder_prefix.is_empty() {
            anyhow::bail!("folder_prefix cannot be empty");
        }
        if self.refresh_interval_ms == 0 {
            anyhow::bail!("refresh_interval_ms must be greater than 0");
        }
        Ok(())
    }
}
