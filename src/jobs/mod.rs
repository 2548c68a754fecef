//! Cron-scheduled job execution, optionally arbitrated across
//! instances.
//!
//! Jobs are registered with a cron expression and a factory; every
//! execution runs a fresh executor from the factory. Distributed jobs
//! coordinate through the shared cache and message bus so that at most
//! one instance runs a given tick.

mod runner;
mod state;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::Notify;

pub use runner::{JobRunner, JobRunnerOptions, JobSnapshot};
pub use state::{JobRunResult, JobState, JobStateChanged, JOB_HISTORY_LIMIT};

use crate::cancellation::CancelToken;
use crate::error::{PlinthError, PlinthResult};

/// A job executor. One instance is created per execution.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run the job. The token fires when the runner is stopping.
    async fn run(&self, cancellation: &CancelToken) -> PlinthResult<()>;
}

/// Produces a fresh executor per execution, giving each run its own
/// dependency scope.
pub trait JobFactory: Send + Sync {
    /// Create an executor for one run.
    fn create(&self) -> Arc<dyn Job>;
}

impl<F> JobFactory for F
where
    F: Fn() -> Arc<dyn Job> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Job> {
        self()
    }
}

/// Registration options for one job.
#[derive(Clone)]
pub struct JobOptions {
    /// Unique job name
    pub name: String,
    /// Cron expression (5- or 6-field)
    pub cron_expression: String,
    /// Time zone occurrences are computed in
    pub time_zone: Tz,
    /// Whether the job may run
    pub enabled: bool,
    /// Whether the schedule is arbitrated across instances
    pub distributed: bool,
    /// Executor factory
    pub factory: Arc<dyn JobFactory>,
}

impl JobOptions {
    /// Options for an enabled, non-distributed UTC job.
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        factory: Arc<dyn JobFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            time_zone: chrono_tz::UTC,
            enabled: true,
            distributed: false,
            factory,
        }
    }

    /// Compute occurrences in the given time zone.
    pub fn with_time_zone(mut self, time_zone: Tz) -> Self {
        self.time_zone = time_zone;
        self
    }

    /// Enable or disable the job.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Arbitrate the schedule across instances.
    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }
}

/// Parse a cron expression, accepting the standard 5-field form by
/// normalizing it with a seconds field (the scheduler's resolution
/// floor is one minute regardless).
pub fn parse_cron(expression: &str) -> PlinthResult<Schedule> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| PlinthError::Parse(format!("invalid cron expression '{}': {}", expression, e)))
}

enum GatePosition {
    Pending,
    Ready,
    Failed(String),
}

/// Signal that host startup actions finished.
///
/// The job runner waits on this gate before scheduling anything and
/// aborts startup if the gate fails.
pub struct StartupGate {
    position: Mutex<GatePosition>,
    notify: Notify,
}

impl StartupGate {
    /// A gate that has not completed yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            position: Mutex::new(GatePosition::Pending),
            notify: Notify::new(),
        })
    }

    /// A gate that is already open; for embedders with no startup
    /// actions.
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            position: Mutex::new(GatePosition::Ready),
            notify: Notify::new(),
        })
    }

    /// Mark startup as complete.
    pub fn set_ready(&self) {
        *self.position.lock() = GatePosition::Ready;
        self.notify.notify_waiters();
    }

    /// Mark startup as failed; waiters observe an error.
    pub fn set_failed(&self, reason: impl Into<String>) {
        *self.position.lock() = GatePosition::Failed(reason.into());
        self.notify.notify_waiters();
    }

    /// Wait for the gate to resolve.
    pub async fn wait(&self, cancellation: &CancelToken) -> PlinthResult<()> {
        loop {
            // Created before the state check so a resolution between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            {
                let position = self.position.lock();
                match &*position {
                    GatePosition::Ready => return Ok(()),
                    GatePosition::Failed(reason) => {
                        return Err(PlinthError::Internal(format!(
                            "startup actions failed: {}",
                            reason
                        )))
                    }
                    GatePosition::Pending => {}
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancellation.cancelled() => return Err(PlinthError::Cancelled),
            }
        }
    }
}
