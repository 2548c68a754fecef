//! The scheduled job runner.
//!
//! Drives registered jobs off wall-clock minute ticks. Distributed jobs
//! claim two locks before running: a slot lock (`{name}:{minute}`) so at
//! most one instance runs a given tick, and a run lock (`{name}`) so no
//! two executions of the same job overlap. Replicated state lives in
//! the shared cache under `jobs:{name}:state` / `jobs:{name}:next_run`
//! and every write is paired with a [`JobStateChanged`] broadcast.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::state::{JobRunResult, JobState, JobStateChanged};
use super::{parse_cron, JobOptions, StartupGate};
use crate::cache::CacheClient;
use crate::cancellation::CancelToken;
use crate::error::{PlinthError, PlinthResult};
use crate::lock::{LockHandle, LockProvider};
use crate::messaging::{MessageBus, MessageBusExt, Subscription};
use crate::time::{SystemClock, TimeSource};
use crate::value::Value;

/// Options for [`JobRunner`].
#[derive(Clone)]
pub struct JobRunnerOptions {
    /// Shared cache for replicated state and lock storage.
    pub cache: Arc<dyn CacheClient>,
    /// Shared bus for state-change notifications.
    pub bus: Arc<dyn MessageBus>,
    /// Lock provider for leader arbitration.
    pub locks: Arc<dyn LockProvider>,
    /// Time source for ticks and occurrence computation.
    pub time: Arc<dyn TimeSource>,
    /// Startup gate awaited before scheduling begins.
    pub gate: Arc<StartupGate>,
    /// Lease of the per-tick slot lock.
    pub slot_lease: Duration,
    /// Lease of the per-job run lock.
    pub run_lease: Duration,
}

impl JobRunnerOptions {
    /// Options with the default leases (1 h slot, 15 min run), system
    /// clock, and an already-open startup gate.
    pub fn new(
        cache: Arc<dyn CacheClient>,
        bus: Arc<dyn MessageBus>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            cache,
            bus,
            locks,
            time: Arc::new(SystemClock),
            gate: StartupGate::ready(),
            slot_lease: Duration::from_secs(60 * 60),
            run_lease: Duration::from_secs(15 * 60),
        }
    }

    /// Substitute the time source.
    pub fn with_time(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Wait on this gate before scheduling.
    pub fn with_gate(mut self, gate: Arc<StartupGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Override the slot and run lock leases.
    pub fn with_leases(mut self, slot_lease: Duration, run_lease: Duration) -> Self {
        self.slot_lease = slot_lease;
        self.run_lease = run_lease;
        self
    }
}

/// Read-only view of a job's current state.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Job name
    pub name: String,
    /// Effective cron expression
    pub cron_expression: String,
    /// Whether the job may run
    pub enabled: bool,
    /// Whether an execution is in flight locally
    pub running: bool,
    /// Start of the most recent run
    pub last_run: Option<DateTime<Utc>>,
    /// Completion of the most recent successful run
    pub last_success: Option<DateTime<Utc>>,
    /// Duration of the most recent run
    pub last_duration: Option<Duration>,
    /// Error of the most recent run, if any
    pub last_error: Option<String>,
    /// Next planned occurrence
    pub next_run: Option<DateTime<Utc>>,
    /// Bounded run history
    pub history: VecDeque<JobRunResult>,
}

struct JobInstance {
    options: JobOptions,
    schedule: Mutex<Option<Schedule>>,
    state: Mutex<JobState>,
    next_run: Mutex<Option<DateTime<Utc>>>,
    skip_update: AtomicBool,
    run_lock: tokio::sync::Mutex<Option<LockHandle>>,
}

fn state_key(name: &str) -> String {
    format!("jobs:{}:state", name)
}

fn next_run_key(name: &str) -> String {
    format!("jobs:{}:next_run", name)
}

fn decode_state(value: &Value) -> Option<JobState> {
    value
        .as_str()
        .and_then(|json| serde_json::from_str(json).ok())
}

/// Next occurrence for a job.
///
/// Starts from `last_run` (or one minute ago when the job never ran).
/// An occurrence more than an hour stale is skipped in favor of the
/// next future one; a mildly stale occurrence is caught up unless the
/// next future occurrence is at most ten minutes away.
fn compute_next_run(inst: &JobInstance, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (enabled, last_run) = {
        let state = inst.state.lock();
        (state.enabled, state.last_run)
    };
    if !enabled {
        return None;
    }
    let schedule = inst.schedule.lock().clone()?;
    let tz = inst.options.time_zone;
    let last = last_run.unwrap_or(now - chrono::Duration::minutes(1));
    let candidate = schedule
        .after(&last.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc));
    let future = schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc));
    match candidate {
        None => None,
        Some(c) if c <= now => {
            if c < now - chrono::Duration::hours(1) {
                future
            } else {
                match future {
                    Some(f) if f <= now + chrono::Duration::minutes(10) => Some(f),
                    _ => Some(c),
                }
            }
        }
        candidate => candidate,
    }
}

/// Cron-driven, optionally distributed job scheduler.
pub struct JobRunner {
    id: Uuid,
    weak: std::sync::Weak<JobRunner>,
    opts: JobRunnerOptions,
    jobs: DashMap<String, Arc<JobInstance>>,
    cancellation: CancelToken,
    subscription: Mutex<Option<Subscription>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobRunner {
    /// Create a runner with a fresh instance id.
    pub fn new(opts: JobRunnerOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: Uuid::new_v4(),
            weak: weak.clone(),
            opts,
            jobs: DashMap::new(),
            cancellation: CancelToken::new(),
            subscription: Mutex::new(None),
            loop_task: Mutex::new(None),
        })
    }

    /// This runner's instance id (the origin id on published state).
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register a job. A malformed cron expression logs a warning and
    /// leaves the job disabled (`next_run` stays empty).
    pub fn register(&self, options: JobOptions) {
        let schedule = match parse_cron(&options.cron_expression) {
            Ok(schedule) => Some(schedule),
            Err(error) => {
                warn!(job = %options.name, %error, "cron parse failure; job disabled");
                None
            }
        };
        let state = JobState::new(&options.cron_expression, options.enabled);
        let name = options.name.clone();
        let instance = Arc::new(JobInstance {
            options,
            schedule: Mutex::new(schedule),
            state: Mutex::new(state),
            next_run: Mutex::new(None),
            skip_update: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(None),
        });
        let now = self.opts.time.utc_now();
        *instance.next_run.lock() = compute_next_run(&instance, now);
        self.jobs.insert(name, instance);
    }

    /// Start the runner: wait for the startup gate, subscribe to state
    /// changes, seed distributed state, and begin minute-aligned ticks.
    pub async fn start(&self) -> PlinthResult<()> {
        self.opts.gate.wait(&self.cancellation).await?;

        let weak = self.weak.clone();
        let subscription = self
            .opts
            .bus
            .subscribe::<JobStateChanged, _>(move |message| {
                if let Some(runner) = weak.upgrade() {
                    runner.apply_remote(&message);
                }
            });
        *self.subscription.lock() = Some(subscription);

        let instances: Vec<Arc<JobInstance>> =
            self.jobs.iter().map(|e| e.value().clone()).collect();
        for instance in instances {
            if instance.options.distributed {
                self.seed_distributed_state(&instance).await?;
            }
        }

        let runner = self
            .weak
            .upgrade()
            .ok_or_else(|| PlinthError::Internal("runner dropped during start".to_string()))?;
        let handle = tokio::spawn(async move {
            loop {
                if runner.cancellation.is_cancelled() {
                    break;
                }
                if runner.sleep_until_next_minute().await.is_err() {
                    break;
                }
                if let Err(error) = runner.tick().await {
                    warn!(%error, "scheduler tick failed");
                }
            }
            trace!("scheduler loop exited");
        });
        *self.loop_task.lock() = Some(handle);
        info!(id = %self.id, jobs = self.jobs.len(), "job runner started");
        Ok(())
    }

    /// Process one tick: adopt shared next-run stamps and start every
    /// job that is due. The background loop calls this every minute;
    /// it is public so embedders and tests can drive the runner
    /// deterministically.
    pub async fn tick(&self) -> PlinthResult<()> {
        let now = self.opts.time.utc_now();
        let instances: Vec<Arc<JobInstance>> =
            self.jobs.iter().map(|e| e.value().clone()).collect();
        for instance in instances {
            if self.cancellation.is_cancelled() {
                break;
            }
            let name = instance.options.name.clone();
            let enabled = { instance.state.lock().enabled };
            if !enabled || instance.schedule.lock().is_none() {
                continue;
            }

            if instance.options.distributed {
                match self.opts.cache.get(&next_run_key(&name)).await {
                    Ok(Some(value)) => {
                        if let Some(stamp) = value.as_time() {
                            *instance.next_run.lock() = Some(stamp);
                        }
                    }
                    Ok(None) => {}
                    Err(error) => warn!(job = %name, %error, "failed to read shared next-run"),
                }
            }

            let next = {
                let mut next_run = instance.next_run.lock();
                match *next_run {
                    Some(next) => Some(next),
                    None => {
                        *next_run = compute_next_run(&instance, now);
                        *next_run
                    }
                }
            };
            let Some(next) = next else { continue };
            let running = { instance.state.lock().running };
            if next <= now && !running {
                if let Err(error) = self.start_job(&instance, next, false).await {
                    warn!(job = %name, %error, "failed to start job");
                }
            }
        }
        Ok(())
    }

    /// Run a job immediately, bypassing `next_run`. The run is recorded
    /// as manual with the epoch as its scheduled time and serializes
    /// with the scheduler through a fixed slot key.
    pub async fn run_now(&self, name: &str) -> PlinthResult<()> {
        let instance = self
            .jobs
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlinthError::NotFound(name.to_string()))?;
        self.start_job(&instance, DateTime::UNIX_EPOCH, true).await
    }

    /// Stop the runner: cancel the loop, release held run locks, and
    /// publish a final state for any job that was marked running.
    pub async fn stop(&self) {
        info!(id = %self.id, "stopping job runner");
        self.cancellation.cancel();
        let handle = self.loop_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let instances: Vec<Arc<JobInstance>> =
            self.jobs.iter().map(|e| e.value().clone()).collect();
        for instance in instances {
            let was_running = {
                let mut state = instance.state.lock();
                let running = state.running;
                state.running = false;
                running
            };
            if let Some(run_lock) = instance.run_lock.lock().await.take() {
                if let Err(error) = run_lock.release().await {
                    warn!(job = %instance.options.name, %error, "failed to release run lock");
                }
            }
            if was_running {
                if let Err(error) = self.publish_state(&instance, "state").await {
                    warn!(job = %instance.options.name, %error, "failed to publish final state");
                }
            }
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }

    /// Read-only view of one job.
    pub fn snapshot(&self, name: &str) -> Option<JobSnapshot> {
        let instance = self.jobs.get(name)?.value().clone();
        let state = instance.state.lock().clone();
        let next_run = *instance.next_run.lock();
        Some(JobSnapshot {
            name: instance.options.name.clone(),
            cron_expression: state.cron_expression,
            enabled: state.enabled,
            running: state.running,
            last_run: state.last_run,
            last_success: state.last_success,
            last_duration: state.last_duration,
            last_error: state.last_error,
            next_run,
            history: state.history,
        })
    }

    async fn sleep_until_next_minute(&self) -> PlinthResult<()> {
        let now = self.opts.time.utc_now();
        let next_minute = (now.timestamp().div_euclid(60) + 1) * 60;
        let wait = Duration::from_secs((next_minute - now.timestamp()) as u64)
            .saturating_sub(Duration::from_nanos(now.timestamp_subsec_nanos() as u64));
        self.opts.time.sleep(wait, &self.cancellation).await
    }

    async fn seed_distributed_state(&self, instance: &Arc<JobInstance>) -> PlinthResult<()> {
        let name = instance.options.name.clone();
        match self.opts.cache.get(&state_key(&name)).await? {
            Some(value) => {
                let Some(stored) = decode_state(&value) else {
                    warn!(job = %name, "stored job state is unreadable; overwriting");
                    return self.publish_state(instance, "state").await;
                };
                if stored.cron_expression != instance.options.cron_expression {
                    // Local configuration wins; announce the change.
                    info!(
                        job = %name,
                        stored = %stored.cron_expression,
                        local = %instance.options.cron_expression,
                        "stored cron differs from configuration"
                    );
                    {
                        let mut state = instance.state.lock();
                        state.last_run = stored.last_run;
                        state.last_success = stored.last_success;
                        state.history = stored.history;
                        state.cron_expression = instance.options.cron_expression.clone();
                    }
                    let now = self.opts.time.utc_now();
                    *instance.next_run.lock() = compute_next_run(instance, now);
                    self.write_next_run(instance).await?;
                    self.publish_state(instance, "cron-changed").await?;
                } else {
                    instance.skip_update.store(true, Ordering::SeqCst);
                    {
                        let mut state = instance.state.lock();
                        state.last_run = stored.last_run;
                        state.last_success = stored.last_success;
                        state.history = stored.history;
                        state.running = stored.running;
                    }
                    let now = self.opts.time.utc_now();
                    *instance.next_run.lock() = compute_next_run(instance, now);
                    instance.skip_update.store(false, Ordering::SeqCst);
                }
            }
            None => {
                self.write_next_run(instance).await?;
                self.publish_state(instance, "state").await?;
            }
        }
        Ok(())
    }

    fn apply_remote(&self, message: &JobStateChanged) {
        if message.id == self.id {
            return;
        }
        let Some(instance) = self
            .jobs
            .get(&message.job_name)
            .map(|e| e.value().clone())
        else {
            return;
        };
        instance.skip_update.store(true, Ordering::SeqCst);
        let cron_changed = {
            let mut state = instance.state.lock();
            let changed = state.cron_expression != message.cron;
            message.apply_to(&mut state);
            changed
        };
        if cron_changed {
            match parse_cron(&message.cron) {
                Ok(schedule) => *instance.schedule.lock() = Some(schedule),
                Err(error) => {
                    warn!(job = %message.job_name, %error, "received malformed cron; job disabled");
                    *instance.schedule.lock() = None;
                }
            }
        }
        let now = self.opts.time.utc_now();
        *instance.next_run.lock() = compute_next_run(&instance, now);
        instance.skip_update.store(false, Ordering::SeqCst);
        debug!(
            job = %message.job_name,
            reason = %message.reason,
            cron_changed,
            "applied remote job state"
        );
    }

    async fn start_job(
        &self,
        instance: &Arc<JobInstance>,
        scheduled: DateTime<Utc>,
        manual: bool,
    ) -> PlinthResult<()> {
        let name = instance.options.name.clone();
        let mut slot_handle = None;
        if instance.options.distributed {
            let minute_index = scheduled.timestamp().div_euclid(60);
            let slot_name = format!("{}:{}", name, minute_index);
            let slot = self
                .opts
                .locks
                .acquire(
                    &slot_name,
                    self.opts.slot_lease,
                    Some(Duration::ZERO),
                    &self.cancellation,
                )
                .await?;
            let Some(slot) = slot else {
                trace!(job = %name, "tick slot already claimed elsewhere");
                self.refresh_remote_state(instance).await;
                return Ok(());
            };
            let run = self
                .opts
                .locks
                .acquire(
                    &name,
                    self.opts.run_lease,
                    Some(Duration::ZERO),
                    &self.cancellation,
                )
                .await?;
            let Some(run) = run else {
                trace!(job = %name, "job already running elsewhere");
                // The slot handle is dropped unreleased: its lease keeps
                // the tick claimed so no instance re-runs it.
                drop(slot);
                self.refresh_remote_state(instance).await;
                return Ok(());
            };
            *instance.run_lock.lock().await = Some(run);
            slot_handle = Some(slot);
        }

        let now = self.opts.time.utc_now();
        {
            let mut state = instance.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.last_run = Some(if manual { now } else { scheduled });
        }
        *instance.next_run.lock() = compute_next_run(instance, now);
        if let Err(error) = self.write_next_run(instance).await {
            warn!(job = %name, %error, "failed to write shared next-run");
        }
        if let Err(error) = self.publish_state(instance, "state").await {
            warn!(job = %name, %error, "failed to publish job state");
        }

        if manual {
            self.execute_job(instance.clone(), scheduled, true, slot_handle)
                .await;
        } else {
            // Scheduled runs leave the slot lock to its lease.
            drop(slot_handle);
            let Some(runner) = self.weak.upgrade() else {
                return Ok(());
            };
            let instance = instance.clone();
            tokio::spawn(async move {
                runner.execute_job(instance, scheduled, false, None).await;
            });
        }
        Ok(())
    }

    async fn execute_job(
        &self,
        instance: Arc<JobInstance>,
        scheduled: DateTime<Utc>,
        manual: bool,
        slot_handle: Option<LockHandle>,
    ) {
        let name = instance.options.name.clone();
        // A fresh executor per run keeps each execution's dependencies
        // scoped to that run.
        let job = instance.options.factory.create();
        let job_token = self.cancellation.child();
        let started = self.opts.time.utc_now();
        debug!(job = %name, manual, "executing job");

        let outcome = std::panic::AssertUnwindSafe(job.run(&job_token))
            .catch_unwind()
            .await;
        let finished = self.opts.time.utc_now();
        let duration = (finished - started).to_std().unwrap_or_default();
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(_) => Some("job executor panicked".to_string()),
        };

        {
            let mut state = instance.state.lock();
            state.record_run(JobRunResult {
                date: started,
                scheduled_time: Some(if manual { DateTime::UNIX_EPOCH } else { scheduled }),
                manual,
                success: error.is_none(),
                duration,
                error_message: error.clone(),
            });
            state.running = false;
        }
        match &error {
            None => debug!(job = %name, ?duration, "job completed"),
            Some(error) => warn!(job = %name, %error, "job failed"),
        }

        if let Err(error) = self.publish_state(&instance, "state").await {
            warn!(job = %name, %error, "failed to publish job state");
        }
        if let Some(run_lock) = instance.run_lock.lock().await.take() {
            if let Err(error) = run_lock.release().await {
                warn!(job = %name, %error, "failed to release run lock");
            }
        }
        // Manual runs give their fixed slot back; scheduled slots ride
        // out their lease to absorb clock skew between instances.
        if manual {
            if let Some(slot) = slot_handle {
                if let Err(error) = slot.release().await {
                    warn!(job = %name, %error, "failed to release manual slot lock");
                }
            }
        }
    }

    async fn refresh_remote_state(&self, instance: &Arc<JobInstance>) {
        let name = instance.options.name.clone();
        match self.opts.cache.get(&state_key(&name)).await {
            Ok(Some(value)) => {
                if let Some(stored) = decode_state(&value) {
                    instance.skip_update.store(true, Ordering::SeqCst);
                    {
                        let mut state = instance.state.lock();
                        state.last_run = stored.last_run;
                        state.last_success = stored.last_success;
                        state.history = stored.history;
                        state.running = stored.running;
                    }
                    let now = self.opts.time.utc_now();
                    *instance.next_run.lock() = compute_next_run(instance, now);
                    instance.skip_update.store(false, Ordering::SeqCst);
                }
            }
            Ok(None) => {}
            Err(error) => warn!(job = %name, %error, "failed to refresh job state"),
        }
        match self.opts.cache.get(&next_run_key(&name)).await {
            Ok(Some(value)) => {
                if let Some(stamp) = value.as_time() {
                    *instance.next_run.lock() = Some(stamp);
                }
            }
            Ok(None) => {}
            Err(error) => warn!(job = %name, %error, "failed to refresh shared next-run"),
        }
    }

    async fn write_next_run(&self, instance: &Arc<JobInstance>) -> PlinthResult<()> {
        if !instance.options.distributed {
            return Ok(());
        }
        let key = next_run_key(&instance.options.name);
        let next = *instance.next_run.lock();
        match next {
            Some(stamp) => {
                self.opts.cache.set(&key, Value::Time(stamp), None).await?;
            }
            None => {
                self.opts.cache.remove(&key).await?;
            }
        }
        Ok(())
    }

    async fn publish_state(&self, instance: &Arc<JobInstance>, reason: &str) -> PlinthResult<()> {
        if !instance.options.distributed {
            return Ok(());
        }
        if instance.skip_update.load(Ordering::SeqCst) {
            trace!(job = %instance.options.name, "suppressing state re-publication");
            return Ok(());
        }
        let name = instance.options.name.clone();
        let (json, message) = {
            let state = instance.state.lock();
            (
                serde_json::to_string(&*state),
                JobStateChanged::from_state(self.id, &name, &state, reason),
            )
        };
        let json = json.map_err(|e| PlinthError::Parse(e.to_string()))?;
        self.opts
            .cache
            .set(&state_key(&name), Value::Str(json), None)
            .await?;
        self.opts.bus.publish(message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::lock::CacheLockProvider;
    use crate::messaging::InProcessMessageBus;
    use crate::time::VirtualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl super::super::Job for CountingJob {
        async fn run(&self, _cancellation: &CancelToken) -> PlinthResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingJob;

    #[async_trait]
    impl super::super::Job for FailingJob {
        async fn run(&self, _cancellation: &CancelToken) -> PlinthResult<()> {
            Err(PlinthError::Transport("backend down".to_string()))
        }
    }

    fn counting_factory(runs: Arc<AtomicUsize>) -> Arc<dyn super::super::JobFactory> {
        Arc::new(move || {
            Arc::new(CountingJob { runs: runs.clone() }) as Arc<dyn super::super::Job>
        })
    }

    fn runner_at(
        start: DateTime<Utc>,
    ) -> (Arc<JobRunner>, Arc<VirtualClock>, Arc<dyn CacheClient>) {
        let clock = Arc::new(VirtualClock::new(start));
        let cache: Arc<dyn CacheClient> = Arc::new(InMemoryCacheClient::new());
        let bus: Arc<dyn crate::messaging::MessageBus> = Arc::new(InProcessMessageBus::new());
        let locks = Arc::new(CacheLockProvider::new(
            cache.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let opts = JobRunnerOptions::new(cache.clone(), bus, locks).with_time(clock.clone());
        (JobRunner::new(opts), clock, cache)
    }

    fn ten_oclock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_due_job_runs_on_tick() {
        let (runner, clock, _) = runner_at(ten_oclock() - chrono::Duration::seconds(30));
        let runs = Arc::new(AtomicUsize::new(0));
        runner.register(JobOptions::new(
            "every-minute",
            "* * * * *",
            counting_factory(runs.clone()),
        ));
        assert_eq!(
            runner.snapshot("every-minute").unwrap().next_run,
            Some(ten_oclock())
        );
        clock.set(ten_oclock());
        runner.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let snapshot = runner.snapshot("every-minute").unwrap();
        assert_eq!(snapshot.last_run, Some(ten_oclock()));
        assert!(snapshot.next_run.unwrap() > ten_oclock());
        assert!(!snapshot.running);
    }

    #[tokio::test]
    async fn test_job_not_due_does_not_run() {
        let (runner, _, _) = runner_at(ten_oclock() + chrono::Duration::seconds(5));
        let runs = Arc::new(AtomicUsize::new(0));
        runner.register(JobOptions::new(
            "every-five",
            "*/5 * * * *",
            counting_factory(runs.clone()),
        ));
        runner.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_cron_disables_job() {
        let (runner, _, _) = runner_at(ten_oclock());
        let runs = Arc::new(AtomicUsize::new(0));
        runner.register(JobOptions::new(
            "broken",
            "not a cron",
            counting_factory(runs.clone()),
        ));
        let snapshot = runner.snapshot("broken").unwrap();
        assert_eq!(snapshot.next_run, None);
        runner.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_run_recorded_in_history() {
        let (runner, clock, _) = runner_at(ten_oclock() - chrono::Duration::seconds(30));
        runner.register(JobOptions::new(
            "failing",
            "* * * * *",
            Arc::new(|| Arc::new(FailingJob) as Arc<dyn super::super::Job>),
        ));
        clock.set(ten_oclock());
        runner.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = runner.snapshot("failing").unwrap();
        assert_eq!(snapshot.history.len(), 1);
        assert!(!snapshot.history[0].success);
        assert!(snapshot.last_error.as_deref().unwrap().contains("backend down"));
        assert!(snapshot.last_success.is_none());
    }

    #[tokio::test]
    async fn test_manual_run_records_epoch_schedule() {
        let (runner, _, _) = runner_at(ten_oclock());
        let runs = Arc::new(AtomicUsize::new(0));
        runner.register(JobOptions::new(
            "manual",
            "0 0 1 1 *",
            counting_factory(runs.clone()),
        ));
        runner.run_now("manual").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let snapshot = runner.snapshot("manual").unwrap();
        let run = snapshot.history.front().unwrap();
        assert!(run.manual);
        assert_eq!(run.scheduled_time, Some(DateTime::UNIX_EPOCH));
        assert!(matches!(
            runner.run_now("unknown").await,
            Err(PlinthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_next_run_rules() {
        let (runner, _, _) = runner_at(ten_oclock());
        let runs = Arc::new(AtomicUsize::new(0));
        runner.register(JobOptions::new(
            "hourly",
            "0 * * * *",
            counting_factory(runs.clone()),
        ));
        let instance = runner.jobs.get("hourly").unwrap().value().clone();

        // Two hours stale: skip to the next future occurrence.
        {
            instance.state.lock().last_run = Some(ten_oclock() - chrono::Duration::hours(3));
        }
        let next = compute_next_run(&instance, ten_oclock() + chrono::Duration::minutes(30));
        assert_eq!(next, Some(ten_oclock() + chrono::Duration::hours(1)));

        // Mildly stale with the next occurrence far off: catch up.
        {
            instance.state.lock().last_run = Some(ten_oclock() - chrono::Duration::minutes(30));
        }
        let next = compute_next_run(&instance, ten_oclock() + chrono::Duration::minutes(20));
        assert_eq!(next, Some(ten_oclock()));

        // Mildly stale but the next occurrence is close: prefer it.
        let next = compute_next_run(&instance, ten_oclock() + chrono::Duration::minutes(51));
        assert_eq!(next, Some(ten_oclock() + chrono::Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_expression_with_no_future_occurrence_never_starts() {
        let (runner, _, _) = runner_at(ten_oclock());
        let runs = Arc::new(AtomicUsize::new(0));
        // Year field pins the schedule entirely in the past.
        runner.register(JobOptions::new(
            "bygone",
            "0 0 0 1 1 * 2020",
            counting_factory(runs.clone()),
        ));
        assert_eq!(runner.snapshot("bygone").unwrap().next_run, None);
        runner.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_job_has_no_next_run() {
        let (runner, _, _) = runner_at(ten_oclock());
        let runs = Arc::new(AtomicUsize::new(0));
        runner.register(
            JobOptions::new("off", "* * * * *", counting_factory(runs.clone()))
                .with_enabled(false),
        );
        assert_eq!(runner.snapshot("off").unwrap().next_run, None);
        runner.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
