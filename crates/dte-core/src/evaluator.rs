//! Rule-based evaluation of one model against one request
//!
//! A rules-based model takes the features extracted from the OpenRTB request,
//! runs each feature's transformer chain, and composes a string tuple used to
//! fetch the precomputed value metric for the request.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use dte_config::ModelDefinition;

use crate::model_result::{ModelResult, ModelResultHandler};
use crate::transform::{transform_feature, ModelFeature};

/// Score assumed for a request with no matching rule entry. Unknown traffic
/// is treated as high value and let through.
pub const HIGH_VALUE_DEFAULT_SCORE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvaluationStatus {
    Success,
    Error,
    Timeout,
}

pub struct ModelEvaluatorInput<'a> {
    pub model_definition: Arc<ModelDefinition>,
    pub field_value_map: &'a HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ModelEvaluatorOutput {
    pub status: ModelEvaluationStatus,
    pub model_result: ModelResult,
    pub model_definition: Arc<ModelDefinition>,
    pub model_features: Vec<ModelFeature>,
}

/// Evaluates a bid request using one specific model.
pub trait ModelEvaluator: Send + Sync {
    fn evaluate(&self, input: ModelEvaluatorInput<'_>) -> Result<ModelEvaluatorOutput>;
}

pub struct RuleBasedModelEvaluator {
    model_results: Arc<ModelResultHandler>,
}

impl RuleBasedModelEvaluator {
    pub fn new(model_results: Arc<ModelResultHandler>) -> Self {
        RuleBasedModelEvaluator { model_results }
    }

    /// Collect each feature's field values in declared order and run its
    /// transformer chain. Every field a feature names must be present in the
    /// map, even when its value is the empty string.
    fn resolve_features(
        &self,
        definition: &ModelDefinition,
        field_value_map: &HashMap<String, String>,
    ) -> Result<Vec<ModelFeature>> {
        let mut features = Vec::with_capacity(definition.features.len());
        for configuration in &definition.features {
            let mut values = Vec::with_capacity(configuration.fields.len());
            for field in &configuration.fields {
                let value = field_value_map.get(field).ok_or_else(|| {
                    anyhow::anyhow!("field [{field}] does not exist in the value map")
                })?;
                values.push(value.clone());
            }
            let transformed = transform_feature(configuration, values).with_context(|| {
                format!("error transforming feature [{}]", configuration.name)
            })?;
            features.push(ModelFeature {
                name: configuration.name.clone(),
                values: transformed,
            });
        }
        Ok(features)
    }
}

impl ModelEvaluator for RuleBasedModelEvaluator {
    fn evaluate(&self, input: ModelEvaluatorInput<'_>) -> Result<ModelEvaluatorOutput> {
        let definition = input.model_definition;
        let features = self
            .resolve_features(&definition, input.field_value_map)
            .context("error getting model features")?;
        debug!(model = %definition.identifier, ?features, "resolved model features");

        let model_result = self
            .model_results
            .provide(&definition.identifier, &features, HIGH_VALUE_DEFAULT_SCORE)
            .context("error getting model result")?;

        Ok(ModelEvaluatorOutput {
            status: ModelEvaluationStatus::Success,
            model_result,
            model_definition: definition,
            model_features: features,
        })
    }
}
