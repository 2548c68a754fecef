//! Replicated job state and run history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounded run history length, most-recent-first.
pub const JOB_HISTORY_LIMIT: usize = 10;

/// Outcome of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunResult {
    /// When the execution started
    pub date: DateTime<Utc>,
    /// The tick this run was scheduled for; epoch for manual runs
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Whether the run was triggered by `run_now`
    pub manual: bool,
    /// Whether the executor returned success
    pub success: bool,
    /// Wall-clock execution time
    pub duration: Duration,
    /// Executor error, when `success` is false
    pub error_message: Option<String>,
}

/// The replicated portion of a job's state.
///
/// Stored under `jobs:{name}:state` and mirrored across instances via
/// [`JobStateChanged`] messages; `next_run` travels separately under
/// `jobs:{name}:next_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Effective cron expression
    pub cron_expression: String,
    /// Whether the job may run
    pub enabled: bool,
    /// Whether an execution is in flight
    pub running: bool,
    /// Start of the most recent run
    pub last_run: Option<DateTime<Utc>>,
    /// Completion instant of the most recent successful run
    pub last_success: Option<DateTime<Utc>>,
    /// Duration of the most recent run
    pub last_duration: Option<Duration>,
    /// Error of the most recent run, if it failed
    pub last_error: Option<String>,
    /// Bounded run history, most recent first
    pub history: VecDeque<JobRunResult>,
}

impl JobState {
    /// Initial state for a registered job.
    pub fn new(cron_expression: impl Into<String>, enabled: bool) -> Self {
        Self {
            cron_expression: cron_expression.into(),
            enabled,
            running: false,
            last_run: None,
            last_success: None,
            last_duration: None,
            last_error: None,
            history: VecDeque::new(),
        }
    }

    /// Record a completed run, updating the bounded history.
    pub fn record_run(&mut self, result: JobRunResult) {
        self.last_duration = Some(result.duration);
        if result.success {
            self.last_success = Some(result.date + chrono::Duration::from_std(result.duration).unwrap_or_else(|_| chrono::Duration::zero()));
            self.last_error = None;
        } else {
            self.last_error = result.error_message.clone();
        }
        self.history.push_front(result);
        self.history.truncate(JOB_HISTORY_LIMIT);
    }
}

/// Change notification published whenever a distributed job's state is
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateChanged {
    /// Originating runner instance
    pub id: Uuid,
    /// Job name
    pub job_name: String,
    /// Effective cron expression
    pub cron: String,
    /// Whether the job may run
    pub enabled: bool,
    /// Whether an execution is in flight at the origin
    pub running: bool,
    /// Start of the most recent run
    pub last_run: Option<DateTime<Utc>>,
    /// Completion of the most recent successful run
    pub last_success: Option<DateTime<Utc>>,
    /// Bounded run history
    pub history: VecDeque<JobRunResult>,
    /// Why the state was published
    pub reason: String,
}

impl JobStateChanged {
    /// Build a notification from the current state.
    pub fn from_state(
        id: Uuid,
        job_name: &str,
        state: &JobState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id,
            job_name: job_name.to_string(),
            cron: state.cron_expression.clone(),
            enabled: state.enabled,
            running: state.running,
            last_run: state.last_run,
            last_success: state.last_success,
            history: state.history.clone(),
            reason: reason.into(),
        }
    }

    /// Apply the notification onto a local state copy, verbatim.
    pub fn apply_to(&self, state: &mut JobState) {
        state.cron_expression = self.cron.clone();
        state.enabled = self.enabled;
        state.running = self.running;
        state.last_run = self.last_run;
        state.last_success = self.last_success;
        state.history = self.history.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(success: bool, at: DateTime<Utc>) -> JobRunResult {
        JobRunResult {
            date: at,
            scheduled_time: Some(at),
            manual: false,
            success,
            duration: Duration::from_millis(20),
            error_message: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_history_is_bounded_most_recent_first() {
        let mut state = JobState::new("*/5 * * * *", true);
        let base = Utc::now();
        for i in 0..15 {
            state.record_run(run(true, base + chrono::Duration::minutes(i)));
        }
        assert_eq!(state.history.len(), JOB_HISTORY_LIMIT);
        assert_eq!(
            state.history.front().unwrap().date,
            base + chrono::Duration::minutes(14)
        );
    }

    #[test]
    fn test_record_run_tracks_success_and_error() {
        let mut state = JobState::new("*/5 * * * *", true);
        let at = Utc::now();
        state.record_run(run(false, at));
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(state.last_success.is_none());
        state.record_run(run(true, at));
        assert!(state.last_error.is_none());
        assert!(state.last_success.is_some());
    }

    #[test]
    fn test_apply_round_trip_is_idempotent() {
        let mut state = JobState::new("*/5 * * * *", true);
        state.record_run(run(true, Utc::now()));
        let message =
            JobStateChanged::from_state(Uuid::new_v4(), "job", &state, "state");
        let mut mirror = JobState::new("* * * * *", false);
        message.apply_to(&mut mirror);
        let before = mirror.clone();
        message.apply_to(&mut mirror);
        assert_eq!(mirror, before);
        assert_eq!(mirror.cron_expression, "*/5 * * * *");
    }
}
