//! Root assembler for one evaluator instance
//!
//! Builds the full object graph once: cache, object store, configuration
//! handlers, traffic allocator, evaluators and the staged initializer. The
//! host keeps the returned instance for the lifetime of the process and
//! shares it by reference; there is no hidden global state.

use anyhow::{Context, Result};
use prometheus::Registry;
use std::sync::Arc;

use dte_config::EvaluatorSettings;

use crate::allocator::{TrafficAllocation, TrafficAllocator};
use crate::cache::LocalCacheRegistry;
use crate::config_loader::{
    ConfigurationLoader, ExperimentConfigurationHandler, ModelConfigurationHandler,
};
use crate::evaluator::{ModelEvaluator, RuleBasedModelEvaluator};
use crate::metrics::EvaluatorMetrics;
use crate::model_result::ModelResultHandler;
use crate::request::{BidRequestEvaluatorInput, BidRequestEvaluatorOutput, RequestEvaluator};
use crate::scheduler::{Initializer, InitializerTask, Task};
use crate::store::{HttpObjectStore, ObjectStore};
use crate::tasks::{
    ExperimentConfigurationLoadTask, ModelConfigurationLoadTask, ModelResultLoadTask,
};
use crate::time::{Clock, SystemClock};

const TASK_MAXIMUM_ATTEMPTS: u32 = 5;
const TASK_MIN_DELAY_MS: u64 = 1000;
const TASK_MAX_DELAY_MS: u64 = 10_000;
const INIT_OVERALL_TIMEOUT_MS: u64 = 600_000;

/// One evaluator instance: the request-evaluation entry point plus the
/// refresh machinery keeping its caches current.
pub struct DemandTrafficEvaluator {
    request_evaluator: Arc<RequestEvaluator>,
    initializer: Initializer,
    tasks: Vec<Arc<dyn Task>>,
    metrics_registry: Registry,
}

impl DemandTrafficEvaluator {
    /// Assemble an instance against the default HTTPS object store and the
    /// system clock.
    pub fn new(settings: EvaluatorSettings) -> Result<Self> {
        let store = Arc::new(HttpObjectStore::new(settings.region.clone()));
        Self::with_parts(settings, store, Arc::new(SystemClock))
    }

    /// Assemble an instance with an injected object store and clock. Tests
    /// pin the clock and swap in an in-memory store; hosts with their own
    /// signed object store client inject it here.
    pub fn with_parts(
        settings: EvaluatorSettings,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate().context("invalid evaluator settings")?;

        let cache = Arc::new(LocalCacheRegistry::new());
        let metrics_registry = Registry::new();
        let metrics = Arc::new(EvaluatorMetrics::new(&metrics_registry)?);

        // The allocator is created empty; the experiment configuration
        // handler pushes updates into it as loads install new versions.
        let traffic_allocator: Arc<dyn TrafficAllocation> = Arc::new(TrafficAllocator::new());

        let model_configuration = Arc::new(ModelConfigurationHandler::new(
            ConfigurationLoader::new(
                settings.folder_prefix.clone(),
                settings.ssp_identifier.clone(),
                store.clone(),
                cache.clone(),
            ),
        ));
        let experiment_configuration = Arc::new(ExperimentConfigurationHandler::new(
            ConfigurationLoader::new(
                settings.folder_prefix.clone(),
                settings.ssp_identifier.clone(),
                store.clone(),
                cache.clone(),
            ),
            traffic_allocator.clone(),
        ));
        let model_results = Arc::new(ModelResultHandler::new(
            settings.ssp_identifier.clone(),
            settings.folder_prefix.clone(),
            store,
            model_configuration.clone(),
            cache,
            clock,
            metrics.clone(),
        ));

        let model_evaluator: Arc<dyn ModelEvaluator> =
            Arc::new(RuleBasedModelEvaluator::new(model_results.clone()));
        let request_evaluator = Arc::new(RequestEvaluator::new(
            settings.ssp_identifier.clone(),
            traffic_allocator,
            model_evaluator,
            model_configuration.clone(),
            metrics,
        ));

        let model_configuration_task: Arc<dyn Task> = Arc::new(ModelConfigurationLoadTask::new(
            model_configuration,
            settings.refresh_interval_ms,
        ));
        let experiment_configuration_task: Arc<dyn Task> = Arc::new(
            ExperimentConfigurationLoadTask::new(
                experiment_configuration,
                settings.refresh_interval_ms,
            ),
        );
        let model_result_task: Arc<dyn Task> = Arc::new(ModelResultLoadTask::new(
            model_results,
            settings.refresh_interval_ms,
        ));

        let stage_one_tasks = vec![
            initializer_task(ModelConfigurationLoadTask::NAME, model_configuration_task.clone()),
            initializer_task(
                ExperimentConfigurationLoadTask::NAME,
                experiment_configuration_task.clone(),
            ),
        ];
        let stage_two_tasks = vec![initializer_task(
            ModelResultLoadTask::NAME,
            model_result_task.clone(),
        )];
        let initializer =
            Initializer::new(stage_one_tasks, stage_two_tasks, INIT_OVERALL_TIMEOUT_MS);

        Ok(DemandTrafficEvaluator {
            request_evaluator,
            initializer,
            tasks: vec![
                model_configuration_task,
                experiment_configuration_task,
                model_result_task,
            ],
            metrics_registry,
        })
    }

    /// Run the staged initialization: configuration loads first, model
    /// results after. Each successful task keeps refreshing periodically.
    /// Returns the failures of tasks that exhausted their retries.
    pub async fn init(&self) -> Vec<anyhow::Error> {
        self.initializer.init().await
    }

    /// Evaluate one bid request on the hot path. Never fails and never
    /// blocks on I/O.
    pub fn evaluate(&self, input: Option<&BidRequestEvaluatorInput>) -> BidRequestEvaluatorOutput {
        self.request_evaluator.evaluate(input)
    }

    /// Stop every periodic refresh task.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.stop();
        }
    }

    /// Registry holding the instance's counters, for hosts that scrape.
    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics_registry
    }
}

fn initializer_task(name: &str, task: Arc<dyn Task>) -> InitializerTask {
    InitializerTask {
        name: name.to_string(),
        task,
        maximum_attempts: TASK_MAXIMUM_ATTEMPTS,
        min_delay_before_attempt_ms: TASK_MIN_DELAY_MS,
        max_delay_before_attempt_ms: TASK_MAX_DELAY_MS,
    }
}
