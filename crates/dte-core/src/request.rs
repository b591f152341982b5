//! Request-level evaluation and response assembly
//!
//! The single public entry point on the hot path. Everything past the input
//! check runs under a panic guard: a bad configuration, a poisoned lock or
//! any other uncaught failure collapses to the default response, never to an
//! error surfaced to the caller. The default response means "let the request
//! through, do not bias learning".

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use dte_config::{ModelDefinition, EXPERIMENT_TYPE_SOFT_FILTER};

use crate::allocator::{AllocationSnapshot, TrafficAllocation};
use crate::config_loader::ModelConfigurationHandler;
use crate::evaluator::{ModelEvaluationStatus, ModelEvaluator, ModelEvaluatorInput, ModelEvaluatorOutput};
use crate::extract::{extract_fields, top_up_fields, EXTERNAL_FIELD_REQUEST_ID};
use crate::metrics::{EvaluatorMetrics, OUTCOME_DEFAULT, OUTCOME_SCORED};

pub const EXTENSION_KEYWORD_DECISION: &str = "decision";
pub const EXTENSION_KEYWORD_LEARNING: &str = "learning";
pub const EXTENSION_KEYWORD_AMAZON_TEST: &str = "amazontest";

/// Filter recommendation assumed when nothing can be evaluated.
pub const DEFAULT_FILTER_RECOMMENDATION: f32 = 1.0;

/// Learning value of the default response: report the treatment arm.
pub const DEFAULT_LEARNING: i8 = 0;

/// Input to the request evaluator. At least one of the raw request and the
/// pre-extracted map must be populated; when both are, the raw request wins.
#[derive(Debug, Clone, Default)]
pub struct BidRequestEvaluatorInput {
    /// Raw OpenRTB request, in JSON format.
    pub open_rtb_request: String,

    /// Abridged OpenRTB request: field path in dot notation to the string
    /// form of the field's value.
    pub open_rtb_request_map: HashMap<String, String>,
}

/// Output of the request evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct BidRequestEvaluatorOutput {
    pub response: Response,
}

/// Filter recommendation plus the extension blobs the SSP forwards
/// downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Evaluation of signals for each slot (imp object) of the bid request.
    /// Currently always exactly one slot.
    pub slots: Vec<Slot>,

    /// JSON blob for the ext field of the root request object. Reports
    /// whether the request was assigned to treatment (learning=0) or control
    /// (learning=1).
    pub ext: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    /// Recommended filter decision, 0.0 (no chance of a downstream bid) to
    /// 1.0 (highest probability of a bid).
    pub filter_decision: f32,

    /// JSON blob for the ext field of the imp object, carrying the raw
    /// decision taken internally.
    pub ext: String,
}

/// Overall recommendation after aggregating the per-model outputs.
#[derive(Debug, Clone)]
pub struct AggregatedModelEvaluationResult {
    pub experiment_name: String,
    pub experiment_type: String,
    pub treatment_code: String,
    pub treatment_code_int: i8,
    pub score: f32,
    pub score_with_treatment: f32,
    pub aggregation_type: String,
}

/// Bookkeeping for one evaluation, accumulated for logging only.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    pub request_id: String,
    pub open_rtb_request_id: String,
    pub errors: Vec<String>,
    pub debug_messages: Vec<String>,
}

impl EvaluationContext {
    pub fn new(request_id: String) -> Self {
        EvaluationContext {
            request_id,
            ..Default::default()
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_debug(&mut self, message: impl Into<String>) {
        self.debug_messages.push(message.into());
    }
}

fn build_extension(key: &str, value: Value) -> String {
    let mut dsp = serde_json::Map::new();
    dsp.insert(key.to_string(), value);
    let mut root = serde_json::Map::new();
    root.insert(EXTENSION_KEYWORD_AMAZON_TEST.to_string(), Value::Object(dsp));
    Value::Object(root).to_string()
}

fn score_value(score: f32) -> Value {
    Value::from(f64::from(score))
}

/// The response returned whenever evaluation cannot produce a scored one.
pub fn default_response() -> Response {
    Response {
        slots: vec![Slot {
            filter_decision: DEFAULT_FILTER_RECOMMENDATION,
            ext: build_extension(
                EXTENSION_KEYWORD_DECISION,
                score_value(DEFAULT_FILTER_RECOMMENDATION),
            ),
        }],
        ext: build_extension(EXTENSION_KEYWORD_LEARNING, Value::from(DEFAULT_LEARNING)),
    }
}

/// Provides a filter recommendation for OpenRTB requests based on the
/// models and experiments in the current configuration.
pub struct RequestEvaluator {
    ssp_identifier: String,
    traffic_allocator: Arc<dyn TrafficAllocation>,
    model_evaluator: Arc<dyn ModelEvaluator>,
    model_configuration: Arc<ModelConfigurationHandler>,
    metrics: Arc<EvaluatorMetrics>,
}

impl RequestEvaluator {
    pub fn new(
        ssp_identifier: impl Into<String>,
        traffic_allocator: Arc<dyn TrafficAllocation>,
        model_evaluator: Arc<dyn ModelEvaluator>,
        model_configuration: Arc<ModelConfigurationHandler>,
        metrics: Arc<EvaluatorMetrics>,
    ) -> Self {
        RequestEvaluator {
            ssp_identifier: ssp_identifier.into(),
            traffic_allocator,
            model_evaluator,
            model_configuration,
            metrics,
        }
    }

    /// Evaluate one bid request. Never fails: every error edge collapses to
    /// the default response.
    pub fn evaluate(&self, input: Option<&BidRequestEvaluatorInput>) -> BidRequestEvaluatorOutput {
        let request_id = Uuid::new_v4().to_string();

        let Some(input) = input else {
            info!(%request_id, "request input is null, returning default response");
            return self.default_output();
        };

        let result = catch_unwind(AssertUnwindSafe(|| self.evaluate_guarded(&request_id, input)));
        match result {
            Ok(output) => output,
            Err(_) => {
                error!(%request_id, "panic while evaluating the request, returning default response");
                self.default_output()
            }
        }
    }

    fn default_output(&self) -> BidRequestEvaluatorOutput {
        self.metrics
            .evaluations_total
            .with_label_values(&[OUTCOME_DEFAULT])
            .inc();
        BidRequestEvaluatorOutput {
            response: default_response(),
        }
    }

    fn evaluate_guarded(
        &self,
        request_id: &str,
        input: &BidRequestEvaluatorInput,
    ) -> BidRequestEvaluatorOutput {
        let mut context = EvaluationContext::new(request_id.to_string());

        let snapshot = self.traffic_allocator.allocation_snapshot();
        debug!(ssp = %self.ssp_identifier, %request_id, arrangement = ?snapshot.experiment_arrangement(), "drew allocation snapshot");

        let field_value_map = match self.resolve_field_values(&mut context, input) {
            Ok(Some(map)) => map,
            Ok(None) => {
                info!(%request_id, "no valid OpenRTB request string or map provided, returning default response");
                return self.default_output();
            }
            Err(error) => {
                error!(%request_id, error = %format!("{error:#}"), "failed to resolve request fields, returning default response");
                context.add_error(format!("{error:#}"));
                return self.default_output();
            }
        };

        self.setup_open_rtb_request_id(&mut context, &field_value_map);

        let model_definitions = match self.model_definitions(&snapshot) {
            Ok(definitions) => definitions,
            Err(error) => {
                error!(%request_id, error = %format!("{error:#}"), "failed to get model definitions, returning default response");
                return self.default_output();
            }
        };

        let mut model_evaluator_outputs = Vec::with_capacity(model_definitions.len());
        for definition in model_definitions {
            let identifier = definition.identifier.clone();
            match self.model_evaluator.evaluate(ModelEvaluatorInput {
                model_definition: definition,
                field_value_map: &field_value_map,
            }) {
                Ok(output) => model_evaluator_outputs.push(output),
                Err(error) => {
                    error!(%request_id, model = %identifier, error = %format!("{error:#}"), "error while evaluating the model");
                }
            }
        }

        if model_evaluator_outputs.is_empty() {
            error!(%request_id, "no model evaluator outputs, returning default response");
            return self.default_output();
        }

        let aggregated = match aggregate_on_max(&snapshot, &model_evaluator_outputs) {
            Ok(aggregated) => aggregated,
            Err(error) => {
                error!(%request_id, error = %format!("{error:#}"), "failed to aggregate model evaluation results, returning default response");
                return self.default_output();
            }
        };
        debug!(
            %request_id,
            open_rtb_request_id = %context.open_rtb_request_id,
            score = f64::from(aggregated.score),
            treatment = %aggregated.treatment_code,
            "request scored"
        );

        self.metrics
            .evaluations_total
            .with_label_values(&[OUTCOME_SCORED])
            .inc();
        BidRequestEvaluatorOutput {
            response: build_response(&aggregated),
        }
    }

    /// Field values for every unique feature field plus the request id
    /// path. `Ok(None)` means neither input mode was populated.
    fn resolve_field_values(
        &self,
        context: &mut EvaluationContext,
        input: &BidRequestEvaluatorInput,
    ) -> Result<Option<HashMap<String, String>>> {
        if input.open_rtb_request.is_empty() && input.open_rtb_request_map.is_empty() {
            return Ok(None);
        }

        let mut fields = self
            .model_configuration
            .all_unique_feature_fields()
            .context("fail to get unique feature fields")?;
        fields.push(EXTERNAL_FIELD_REQUEST_ID.to_string());

        if !input.open_rtb_request.is_empty() {
            debug!("using raw OpenRTB request string");
            let map = extract_fields(&input.open_rtb_request, &fields)
                .context("fail to parse openRtbRequest")?;
            Ok(Some(map))
        } else {
            debug!("using pre-extracted OpenRTB request map");
            context.add_debug("request parsed from pre-extracted field map");
            Ok(Some(top_up_fields(&input.open_rtb_request_map, &fields)))
        }
    }

    fn setup_open_rtb_request_id(
        &self,
        context: &mut EvaluationContext,
        field_value_map: &HashMap<String, String>,
    ) {
        context.open_rtb_request_id = match field_value_map.get(EXTERNAL_FIELD_REQUEST_ID) {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                context.add_debug("no id found in the OpenRTB request, using generated id");
                "unknown".to_string()
            }
        };
    }

    /// Definition of every model registered in the snapshot's experiments.
    /// A model registered without a definition fails the whole lookup.
    fn model_definitions(
        &self,
        snapshot: &AllocationSnapshot,
    ) -> Result<Vec<Arc<ModelDefinition>>> {
        let model_configuration = self
            .model_configuration
            .provide()
            .context("error while providing model configuration")?;

        snapshot
            .model_identifiers()
            .into_iter()
            .map(|model| {
                model_configuration
                    .model_definition_by_identifier
                    .get(&model)
                    .cloned()
                    .ok_or_else(|| {
                        anyhow!(
                            "error while finding the definition of model [{model}] registered in the experiment"
                        )
                    })
            })
            .collect()
    }
}

/// Take the maximum score over the successful outputs of the soft-filter
/// experiment's models, then lift it by the treatment code so control
/// traffic always passes through unfiltered.
fn aggregate_on_max(
    snapshot: &AllocationSnapshot,
    outputs: &[ModelEvaluatorOutput],
) -> Result<AggregatedModelEvaluationResult> {
    let experiment = snapshot
        .experiment_definition_by_type(EXPERIMENT_TYPE_SOFT_FILTER)
        .context("error while aggregating model evaluation results on max")?;
    let experiment_name = experiment.name.clone();
    let experiment_type = experiment.experiment_type.clone();

    let models_in_experiment = snapshot
        .models_by_experiment()
        .get(&experiment_name)
        .ok_or_else(|| anyhow!("no models in the experiment [{experiment_name}]"))?;

    let max_score = outputs
        .iter()
        .filter(|output| {
            output.status == ModelEvaluationStatus::Success
                && models_in_experiment.contains(&output.model_definition.identifier)
        })
        .map(|output| output.model_result.value)
        .fold(None::<f32>, |max, value| {
            Some(max.map_or(value, |m| m.max(value)))
        })
        .ok_or_else(|| {
            anyhow!("no models have been evaluated for the experiment [{experiment_name}]")
        })?;

    let treatment_code = snapshot.treatment_code(&experiment_name).to_string();
    let treatment_code_int = snapshot.treatment_code_int(&experiment_name);
    let score_with_treatment = max_score.max(f32::from(treatment_code_int));

    Ok(AggregatedModelEvaluationResult {
        experiment_name,
        experiment_type,
        treatment_code,
        treatment_code_int,
        score: max_score,
        score_with_treatment,
        aggregation_type: "max".to_string(),
    })
}

fn build_response(aggregated: &AggregatedModelEvaluationResult) -> Response {
    Response {
        slots: vec![Slot {
            filter_decision: aggregated.score_with_treatment,
            ext: build_extension(EXTENSION_KEYWORD_DECISION, score_value(aggregated.score)),
        }],
        ext: build_extension(
            EXTENSION_KEYWORD_LEARNING,
            Value::from(aggregated.treatment_code_int),
        ),
    }
}
