//! DTE Core - filter recommendations for OpenRTB bid requests
//!
//! Embedded library answering, for each inbound bid request, the probability
//! that the downstream DSP will respond with a bid. The request path is
//! synchronous and allocation-light; background tasks keep the model and
//! experiment configuration caches coherent with an object store or local
//! directory.

pub mod allocator;
pub mod cache;
pub mod config_loader;
pub mod evaluator;
pub mod extract;
pub mod factory;
pub mod metrics;
pub mod model_result;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod time;
pub mod transform;

pub use allocator::{AllocationSnapshot, TrafficAllocation, TrafficAllocator};
pub use cache::{CacheValue, LocalCacheRegistry};
pub use config_loader::{
    ConfigurationLoader, ExperimentConfigurationHandler, ModelConfigurationHandler,
};
pub use evaluator::{
    ModelEvaluationStatus, ModelEvaluator, ModelEvaluatorInput, ModelEvaluatorOutput,
    RuleBasedModelEvaluator, HIGH_VALUE_DEFAULT_SCORE,
};
pub use factory::DemandTrafficEvaluator;
pub use metrics::EvaluatorMetrics;
pub use model_result::{ModelResult, ModelResultHandler};
pub use request::{
    default_response, BidRequestEvaluatorInput, BidRequestEvaluatorOutput, RequestEvaluator,
    Response, Slot,
};
pub use scheduler::{Initializer, InitializerTask, Task};
pub use store::{FetchedObject, HttpObjectStore, InMemoryObjectStore, ObjectStore};
pub use tasks::{
    ExperimentConfigurationLoadTask, ModelConfigurationLoadTask, ModelResultLoadTask,
};
pub use time::{Clock, FixedClock, SystemClock};
pub use transform::ModelFeature;

pub use dte_config::{
    EvaluatorSettings, ExperimentConfiguration, ExperimentDefinition, FeatureConfiguration,
    ModelConfiguration, ModelDefinition, Treatment,
};
