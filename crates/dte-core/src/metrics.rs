//! Process-local prometheus counters
//!
//! Collectors are registered on the registry handed in by the assembler so
//! the host decides whether and how to expose them. Nothing here is on the
//! hot path beyond an atomic increment.

use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub const OUTCOME_SCORED: &str = "scored";
pub const OUTCOME_DEFAULT: &str = "default";

pub const RESULT_FILE_REFRESHED: &str = "refreshed";
pub const RESULT_FILE_SKIPPED: &str = "skipped";
pub const RESULT_FILE_FAILED: &str = "failed";

pub struct EvaluatorMetrics {
    /// Request evaluations by outcome ("scored" or "default").
    pub evaluations_total: IntCounterVec,

    /// Model result file refresh decisions by outcome.
    pub result_files_total: IntCounterVec,

    /// Rule rows installed into model caches across all reloads.
    pub result_rows_loaded_total: IntCounter,
}

impl EvaluatorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let evaluations_total = IntCounterVec::new(
            Opts::new("dte_evaluations_total", "Request evaluations by outcome"),
            &["outcome"],
        )?;
        let result_files_total = IntCounterVec::new(
            Opts::new(
                "dte_result_files_total",
                "Model result file refresh decisions by outcome",
            ),
            &["outcome"],
        )?;
        let result_rows_loaded_total = IntCounter::new(
            "dte_result_rows_loaded_total",
            "Rule rows installed into model caches",
        )?;

        registry.register(Box::new(evaluations_total.clone()))?;
        registry.register(Box::new(result_files_total.clone()))?;
        registry.register(Box::new(result_rows_loaded_total.clone()))?;

        Ok(EvaluatorMetrics {
            evaluations_total,
            result_files_total,
            result_rows_loaded_total,
        })
    }
}
