//! Periodic loading tasks for configurations and model results
//!
//! Each task runs once during initialization and then arms a ticker with a
//! random start offset so a fleet of instances does not hit the object store
//! in lockstep. A tick that fires while the previous execution is still in
//! flight is skipped; a panic inside an execution kills only that task's
//! ticker.

use anyhow::{Context, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::config_loader::{ExperimentConfigurationHandler, ModelConfigurationHandler};
use crate::model_result::ModelResultHandler;
use crate::scheduler::Task;

/// Upper bound of the random start offset applied to every ticker.
const START_JITTER_MS: u64 = 1000;

/// Delay before the model result task's first execution, giving the
/// configuration loaders time to populate their caches.
const MODEL_RESULT_INITIAL_SLEEP: Duration = Duration::from_millis(250);

/// Ticker plumbing shared by the concrete tasks.
struct PeriodicSchedule {
    task_name: &'static str,
    refresh_interval_ms: u64,
    stop_tx: watch::Sender<bool>,
}

impl PeriodicSchedule {
    fn new(task_name: &'static str, refresh_interval_ms: u64) -> Self {
        let (stop_tx, _) = watch::channel(false);
        PeriodicSchedule {
            task_name,
            refresh_interval_ms,
            stop_tx,
        }
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Spawn the ticker loop around an execution closure.
    fn arm<F, Fut>(&self, execute: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let initial_delay =
            Duration::from_millis(rand::thread_rng().gen_range(0..START_JITTER_MS));
        info!(
            task = self.task_name,
            interval_ms = self.refresh_interval_ms,
            initial_delay_ms = initial_delay.as_millis() as u64,
            "scheduling periodic task"
        );

        let task_name = self.task_name;
        let interval_ms = self.refresh_interval_ms;
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately; the
            // initial execution already happened in run(), so consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = execute().await {
                            error!(task = task_name, error = %format!("{e:#}"), "error in periodic task");
                        }
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        });
    }
}

/// Periodically fetches the model configuration file.
pub struct ModelConfigurationLoadTask {
    handler: Arc<ModelConfigurationHandler>,
    schedule: PeriodicSchedule,
}

impl ModelConfigurationLoadTask {
    pub const NAME: &'static str = "ModelConfigurationLoadTask";

    pub fn new(handler: Arc<ModelConfigurationHandler>, refresh_interval_ms: u64) -> Self {
        ModelConfigurationLoadTask {
            handler,
            schedule: PeriodicSchedule::new(Self::NAME, refresh_interval_ms),
        }
    }
}

#[async_trait::async_trait]
impl Task for ModelConfigurationLoadTask {
    async fn run(&self) -> Result<()> {
        info!(task = Self::NAME, "running");
        self.execute_task().await?;
        let handler = self.handler.clone();
        self.schedule.arm(move || {
            let handler = handler.clone();
            async move {
                handler
                    .load()
                    .await
                    .map(|_| ())
                    .context("error loading model configuration")
            }
        });
        Ok(())
    }

    async fn execute_task(&self) -> Result<()> {
        self.handler
            .load()
            .await
            .map(|_| ())
            .context("error loading model configuration")
    }

    fn stop(&self) {
        self.schedule.stop();
    }
}

/// Periodically fetches the experiment configuration file.
pub struct ExperimentConfigurationLoadTask {
    handler: Arc<ExperimentConfigurationHandler>,
    schedule: PeriodicSchedule,
}

impl ExperimentConfigurationLoadTask {
    pub const NAME: &'static str = "ExperimentConfigurationLoadTask";

    pub fn new(handler: Arc<ExperimentConfigurationHandler>, refresh_interval_ms: u64) -> Self {
        ExperimentConfigurationLoadTask {
            handler,
            schedule: PeriodicSchedule::new(Self::NAME, refresh_interval_ms),
        }
    }
}

#[async_trait::async_trait]
impl Task for ExperimentConfigurationLoadTask {
    async fn run(&self) -> Result<()> {
        info!(task = Self::NAME, "running");
        self.execute_task().await?;
        let handler = self.handler.clone();
        self.schedule.arm(move || {
            let handler = handler.clone();
            async move {
                handler
                    .load()
                    .await
                    .map(|_| ())
                    .context("error loading experiment configuration")
            }
        });
        Ok(())
    }

    async fn execute_task(&self) -> Result<()> {
        self.handler
            .load()
            .await
            .map(|_| ())
            .context("error loading experiment configuration")
    }

    fn stop(&self) {
        self.schedule.stop();
    }
}

/// Periodically fetches the model result files of every configured model.
pub struct ModelResultLoadTask {
    handler: Arc<ModelResultHandler>,
    schedule: PeriodicSchedule,
}

impl ModelResultLoadTask {
    pub const NAME: &'static str = "ModelResultLoadTask";

    pub fn new(handler: Arc<ModelResultHandler>, refresh_interval_ms: u64) -> Self {
        ModelResultLoadTask {
            handler,
            schedule: PeriodicSchedule::new(Self::NAME, refresh_interval_ms),
        }
    }
}

#[async_trait::async_trait]
impl Task for ModelResultLoadTask {
    async fn run(&self) -> Result<()> {
        info!(task = Self::NAME, "running");

        // The configuration tasks of the previous stage have finished, but
        // give their cache writes a moment to settle before the first read.
        tokio::time::sleep(MODEL_RESULT_INITIAL_SLEEP).await;

        self.execute_task().await?;
        let handler = self.handler.clone();
        self.schedule.arm(move || {
            let handler = handler.clone();
            async move {
                handler.load().await.context("error loading model result")
            }
        });
        Ok(())
    }

    async fn execute_task(&self) -> Result<()> {
        self.handler.load().await.context("error loading model result")
    }

    fn stop(&self) {
        self.schedule.stop();
    }
}
