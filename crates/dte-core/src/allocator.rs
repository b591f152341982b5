//! Weighted random assignment of requests to experiment treatment arms
//!
//! The allocator keeps the latest experiment configuration next to a
//! precomputed cumulative-weight threshold vector per experiment. Updates
//! replace both atomically behind one writer lock; the request path takes a
//! shared read and draws from a lock-free xorshift generator, so drawing an
//! arrangement never blocks on another reader.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

use dte_config::{ExperimentConfiguration, ExperimentDefinition, Treatment, TREATMENT_GROUP_T};

/// Seam between the allocator and its consumers. The experiment
/// configuration loader pushes updates in; the request evaluator pulls a
/// per-request snapshot out.
pub trait TrafficAllocation: Send + Sync {
    /// Validates and publishes a new experiment configuration. On a weight
    /// violation the previous configuration stays in effect.
    fn update_configuration(&self, configuration: Arc<ExperimentConfiguration>) -> Result<()>;

    /// Draws one treatment per configured experiment and bundles the result
    /// with the configuration it was drawn from.
    fn allocation_snapshot(&self) -> AllocationSnapshot;
}

struct AllocatorState {
    configuration: Arc<ExperimentConfiguration>,
    thresholds: HashMap<String, Vec<u32>>,
}

pub struct TrafficAllocator {
    state: RwLock<AllocatorState>,
    seed: AtomicU64,
}

impl TrafficAllocator {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::with_seed(now.as_nanos() as u64)
    }

    /// Construct with a fixed seed for deterministic draws in tests.
    pub fn with_seed(seed: u64) -> Self {
        TrafficAllocator {
            state: RwLock::new(AllocatorState {
                configuration: Arc::new(ExperimentConfiguration::default()),
                thresholds: HashMap::new(),
            }),
            // xorshift state must be nonzero
            seed: AtomicU64::new(seed.max(1)),
        }
    }

    fn draw_treatment_code(
        &self,
        thresholds: &[u32],
        treatments: &[Treatment],
    ) -> Result<String> {
        if thresholds.is_empty() || treatments.is_empty() {
            bail!("no treatments configured");
        }
        let r = self.rand() % 100;
        let mut i = 0;
        let mut j = thresholds.len() - 1;
        while i < j {
            let h = i + (j - i) / 2;
            if r >= thresholds[h] {
                i = h + 1;
            } else {
                j = h;
            }
        }
        Ok(treatments[i].treatment_code.clone())
    }

    /// xorshift64+ over a single atomic word. Not cryptographic; it only has
    /// to be non-blocking and close to uniform modulo 100.
    pub fn rand(&self) -> u32 {
        loop {
            let old = self.seed.load(Ordering::Relaxed);
            let mut x = old;
            x ^= x << 21;
            x ^= x >> 35;
            x ^= x << 4;
            if self
                .seed
                .compare_exchange_weak(old, x, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return x as u32;
            }
        }
    }
}

impl TrafficAllocation for TrafficAllocator {
    fn update_configuration(&self, configuration: Arc<ExperimentConfiguration>) -> Result<()> {
        debug!(
            experiments = configuration.experiment_definition_by_name.len(),
            "updating experiment configuration"
        );
        let mut thresholds = HashMap::new();
        for (experiment_name, definition) in &configuration.experiment_definition_by_name {
            let total_weight: u32 = definition.treatments.iter().map(|t| t.weight).sum();
            if total_weight != 100 {
                bail!(
                    "total weight must be 100, got {total_weight} for experiment {experiment_name}"
                );
            }

            let mut cumulative_weight = 0;
            let experiment_thresholds = definition
                .treatments
                .iter()
                .map(|treatment| {
                    cumulative_weight += treatment.weight;
                    cumulative_weight
                })
                .collect();
            thresholds.insert(experiment_name.clone(), experiment_thresholds);
        }

        let mut state = self.state.write().unwrap();
        *state = AllocatorState {
            configuration,
            thresholds,
        };
        Ok(())
    }

    fn allocation_snapshot(&self) -> AllocationSnapshot {
        let state = self.state.read().unwrap();
        let mut experiment_arrangement = HashMap::new();
        for (experiment_name, definition) in &state.configuration.experiment_definition_by_name {
            let Some(thresholds) = state.thresholds.get(experiment_name) else {
                error!(experiment = %experiment_name, "no thresholds found for experiment");
                continue;
            };
            match self.draw_treatment_code(thresholds, &definition.treatments) {
                Ok(treatment_code) => {
                    experiment_arrangement.insert(experiment_name.clone(), treatment_code);
                }
                Err(error) => {
                    error!(experiment = %experiment_name, %error, "failed to draw treatment code");
                }
            }
        }
        AllocationSnapshot::new(experiment_arrangement, state.configuration.clone())
    }
}

impl Default for TrafficAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request view of the experiment arrangement. Read-only after
/// construction; it shares the configuration it was drawn from by reference,
/// so a snapshot outliving a configuration update stays internally
/// consistent.
#[derive(Debug, Clone)]
pub struct AllocationSnapshot {
    experiment_arrangement: HashMap<String, String>,
    configuration: Arc<ExperimentConfiguration>,
    models_by_experiment: HashMap<String, Vec<String>>,
}

impl AllocationSnapshot {
    pub fn new(
        experiment_arrangement: HashMap<String, String>,
        configuration: Arc<ExperimentConfiguration>,
    ) -> Self {
        let mut models_by_experiment: HashMap<String, Vec<String>> = HashMap::new();
        for (model, experiment) in &configuration.model_to_experiment {
            models_by_experiment
                .entry(experiment.clone())
                .or_default()
                .push(model.clone());
        }
        AllocationSnapshot {
            experiment_arrangement,
            configuration,
            models_by_experiment,
        }
    }

    /// All model identifiers registered in the model-to-experiment map.
    pub fn model_identifiers(&self) -> Vec<String> {
        self.configuration.model_to_experiment.keys().cloned().collect()
    }

    pub fn experiment_arrangement(&self) -> &HashMap<String, String> {
        &self.experiment_arrangement
    }

    /// Treatment code drawn for an experiment, or the empty string.
    pub fn treatment_code(&self, experiment_name: &str) -> &str {
        self.experiment_arrangement
            .get(experiment_name)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// 0 for the treatment arm ("T"), 1 otherwise, including when the
    /// experiment is absent from the arrangement.
    pub fn treatment_code_int(&self, experiment_name: &str) -> i8 {
        if self.treatment_code(experiment_name) == TREATMENT_GROUP_T {
            0
        } else {
            1
        }
    }

    pub fn experiment_definition(&self, experiment_name: &str) -> Option<&ExperimentDefinition> {
        self.configuration
            .experiment_definition_by_name
            .get(experiment_name)
    }

    pub fn experiment_definition_by_model(&self, model: &str) -> Option<&ExperimentDefinition> {
        let experiment_name = self.configuration.model_to_experiment.get(model)?;
        self.experiment_definition(experiment_name)
    }

    /// First definition whose type tag matches, in unspecified map order.
    pub fn experiment_definition_by_type(
        &self,
        experiment_type: &str,
    ) -> Result<&ExperimentDefinition> {
        self.configuration
            .experiment_definition_by_name
            .values()
            .find(|definition| definition.experiment_type == experiment_type)
            .ok_or_else(|| {
                anyhow::anyhow!("experiment definition with type [{experiment_type}] not found")
            })
    }

    pub fn models_by_experiment(&self) -> &HashMap<String, Vec<String>> {
        &self.models_by_experiment
    }
}
