//! Staged task initialization with bounded retries
//!
//! Stage-one tasks run in parallel, each retried with exponential backoff
//! clipped to its configured maximum. Stage two starts only after every
//! stage-one task has reported success or exhausted its attempts, or the
//! stage timed out. Initialization never panics; failures are collected and
//! returned to the caller.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info};

/// A repeatable task meant to run periodically after a successful first run.
#[async_trait::async_trait]
pub trait Task: Send + Sync {
    /// First execution. On success the task arms its own periodic schedule.
    async fn run(&self) -> Result<()>;

    /// One execution of the task logic.
    async fn execute_task(&self) -> Result<()>;

    /// Stop the periodic schedule, if armed.
    fn stop(&self);
}

/// One task plus its retry policy.
#[derive(Clone)]
pub struct InitializerTask {
    pub name: String,
    pub task: Arc<dyn Task>,
    pub maximum_attempts: u32,
    pub min_delay_before_attempt_ms: u64,
    pub max_delay_before_attempt_ms: u64,
}

/// Overall configuration of the scheduled tasks to initialize.
pub struct Initializer {
    stage_one_tasks: Vec<InitializerTask>,
    stage_two_tasks: Vec<InitializerTask>,
    overall_timeout_ms: u64,
}

impl Initializer {
    pub fn new(
        stage_one_tasks: Vec<InitializerTask>,
        stage_two_tasks: Vec<InitializerTask>,
        overall_timeout_ms: u64,
    ) -> Self {
        Initializer {
            stage_one_tasks,
            stage_two_tasks,
            overall_timeout_ms,
        }
    }

    /// Run both stages to completion and return every collected failure.
    pub async fn init(&self) -> Vec<anyhow::Error> {
        let mut failures = Vec::new();
        if self.stage_one_tasks.is_empty() {
            info!("no initialization tasks defined");
            return failures;
        }

        self.execute_stage(&self.stage_one_tasks, "StageOne", &mut failures)
            .await;
        if !self.stage_two_tasks.is_empty() {
            self.execute_stage(&self.stage_two_tasks, "StageTwo", &mut failures)
                .await;
        }

        for failure in &failures {
            error!(error = %format!("{failure:#}"), "initialization failed");
        }
        failures
    }

    async fn execute_stage(
        &self,
        tasks: &[InitializerTask],
        stage_name: &str,
        failures: &mut Vec<anyhow::Error>,
    ) {
        info!(stage = stage_name, tasks = tasks.len(), "starting initialization stage");
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.overall_timeout_ms);

        let (result_tx, mut result_rx) = mpsc::channel(tasks.len());
        for task in tasks {
            tokio::spawn(submit_task(task.clone(), started, result_tx.clone()));
        }
        drop(result_tx);

        let mut executed_task_count = 0;
        while executed_task_count < tasks.len() {
            match tokio::time::timeout_at(deadline.into(), result_rx.recv()).await {
                Ok(Some(result)) => {
                    if let Err(failure) = result {
                        failures.push(failure);
                    }
                    executed_task_count += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    failures.push(anyhow!(
                        "{stage_name} timed out after {executed_task_count} tasks and {} ms",
                        started.elapsed().as_millis()
                    ));
                    return;
                }
            }
        }
        info!(
            stage = stage_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage initialization completed"
        );
    }
}

async fn submit_task(task: InitializerTask, started: Instant, results: mpsc::Sender<Result<()>>) {
    let mut attempt_count = 0u32;
    let mut delay_ms = 0u64;
    let mut last_error: Option<anyhow::Error> = None;
    loop {
        attempt_count += 1;
        if attempt_count > task.maximum_attempts {
            let reason = last_error
                .map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "unknown".to_string());
            let _ = results
                .send(Err(anyhow!(
                    "number of retries exceeded maximum attempts [{}] for task {} due to error: {reason}",
                    task.maximum_attempts,
                    task.name
                )))
                .await;
            return;
        }

        delay_ms = calculate_delay(
            attempt_count,
            delay_ms,
            task.min_delay_before_attempt_ms,
            task.max_delay_before_attempt_ms,
        );
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match task.task.run().await {
            Ok(()) => {
                info!(
                    task = %task.name,
                    attempts = attempt_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                );
                let _ = results.send(Ok(())).await;
                return;
            }
            Err(error) => {
                error!(task = %task.name, attempt = attempt_count, error = %format!("{error:#}"), "task attempt failed");
                last_error = Some(error);
            }
        }
    }
}

/// Delay before a given attempt: the first attempt runs immediately, the
/// second after the minimum delay, and each later one doubles the previous
/// delay up to the maximum.
fn calculate_delay(
    times_already_attempted: u32,
    current_delay_ms: u64,
    min_delay_ms: u64,
    max_delay_ms: u64,
) -> u64 {
    match times_already_attempted {
        1 => 0,
        2 => min_delay_ms,
        _ => (2 * current_delay_ms).min(max_delay_ms),
    }
}
