use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use loc_core::error::{Result, SchedulerError};
use loc_core::job::{
    now_ms, BackoffPolicy, Constraint, ExistingPolicy, FailureReason, JobResult, JobSpec, JobState,
    JobStatus,
};
use loc_core::store::{JobStore, Kv};

use crate::constraints::ConstraintProbe;
use crate::runner::Runner;

/// How long a one-shot waits before re-checking unmet constraints.
const CONSTRAINT_RECHECK: Duration = Duration::from_secs(60);

/// Outcome of [`Scheduler::enqueue_periodic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Enqueued {
    /// No registration existed; the new one is active.
    Registered,
    /// An existing registration was kept; the request was ignored.
    Kept,
    /// The previous registration was swapped for the new spec.
    Replaced,
}

/// Snapshot of one registration.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub spec: JobSpec,
    pub status: JobStatus,
    pub state: JobState,
}

/// Mutable per-name bookkeeping shared by every driver of a registration,
/// including drivers retired by a replace that are still finishing a run.
#[derive(Default)]
struct Slot {
    running: Mutex<bool>,
    state: Mutex<JobState>,
    // Only flipped or read while `state` is locked.
    cancelled: AtomicBool,
}

impl Slot {
    fn with_state(state: JobState) -> Self {
        Self { state: Mutex::new(state), ..Self::default() }
    }

    /// No run finishing after this returns touches the sink or the store.
    fn cancel(&self) {
        let _state = self.state.lock();
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn set_running(&self, on: bool) {
        if let Ok(mut r) = self.running.lock() {
            *r = on;
        }
    }

    fn status(&self) -> JobStatus {
        match self.running.lock().map(|r| *r) {
            Ok(true) => JobStatus::Running,
            _ => JobStatus::Scheduled,
        }
    }

    fn state(&self) -> JobState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Flips the slot back to scheduled even if the run future is dropped.
struct RunningGuard<'a>(&'a Slot);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

/// Per-name run lock. The map entry goes away with its last holder.
struct RunLease<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    name: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            // the map and this lease
            if Arc::strong_count(&self.lock) == 2 {
                locks.remove(self.name);
            }
        }
    }
}

struct Registration {
    spec: JobSpec,
    slot: Arc<Slot>,
    task: JoinHandle<()>,
    // Drivers replaced without cancelling that may still be mid-run.
    draining: Vec<JoinHandle<()>>,
    // Dropping this retires the driver at its next wait.
    _retire: watch::Sender<()>,
}

impl Registration {
    fn abort(&self) {
        self.task.abort();
        for old in &self.draining {
            old.abort();
        }
    }
}

struct Inner<K: Kv> {
    runner: Arc<Runner>,
    probe: Arc<dyn ConstraintProbe>,
    backoff: BackoffPolicy,
    store: JobStore<K>,
    registry: Mutex<HashMap<String, Registration>>,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: watch::Receiver<bool>,
}

/// Named one-shot and periodic job registrations with dedup, constraint
/// gating and retry backoff. Clones share the same registry.
pub struct Scheduler<K: Kv> {
    inner: Arc<Inner<K>>,
}

impl<K: Kv> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K: Kv> Scheduler<K> {
    /// Build a scheduler. Driver tasks stop once `shutdown` turns `true`.
    pub fn new(
        runner: Arc<Runner>,
        probe: Arc<dyn ConstraintProbe>,
        backoff: BackoffPolicy,
        store: JobStore<K>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                probe,
                backoff,
                store,
                registry: Mutex::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Run `spec` once in the background, with no dedup. The handle may be
    /// dropped; awaiting it yields the final result after any retries.
    pub fn enqueue_once(&self, spec: JobSpec) -> JoinHandle<JobResult> {
        let inner = self.inner.clone();
        info!(job = %spec.name, "one-shot enqueued");
        tokio::spawn(async move { inner.run_once(spec).await })
    }

    /// Register `spec` as a recurring job under its name.
    pub fn enqueue_periodic(&self, spec: JobSpec, policy: ExistingPolicy) -> Result<Enqueued> {
        let period = validate_period(&spec)?;
        let mut registry = self.inner.registry()?;

        let outcome = match (registry.contains_key(&spec.name), policy) {
            (true, ExistingPolicy::Keep) => {
                debug!(job = %spec.name, "already registered; keeping existing schedule");
                return Ok(Enqueued::Kept);
            }
            (true, _) => Enqueued::Replaced,
            (false, _) => Enqueued::Registered,
        };

        let fresh = if registry.contains_key(&spec.name) {
            None
        } else {
            Some(self.inner.store.state(&spec.name)?)
        };
        self.inner.store.save_spec(&spec)?;

        let (slot, draining) = match registry.remove(&spec.name) {
            Some(old) if policy == ExistingPolicy::ReplaceCancelling => {
                old.abort();
                debug!(job = %spec.name, "in-flight run cancelled");
                (old.slot.clone(), Vec::new())
            }
            Some(old) => {
                let mut draining: Vec<_> =
                    old.draining.into_iter().filter(|h| !h.is_finished()).collect();
                draining.push(old.task);
                (old.slot, draining)
            }
            None => (Arc::new(Slot::with_state(fresh.unwrap_or_default())), Vec::new()),
        };

        let mut reg = self.inner.spawn_driver(spec, period, Duration::ZERO, slot);
        reg.draining = draining;
        info!(job = %reg.spec.name, ?policy, ?outcome, "periodic job {:?}", period);
        registry.insert(reg.spec.name.clone(), reg);
        Ok(outcome)
    }

    /// Re-register every persisted periodic spec (Keep semantics). The first
    /// tick honours the last persisted run time.
    pub fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        let mut registry = self.inner.registry()?;
        for spec in self.inner.store.specs()? {
            if registry.contains_key(&spec.name) {
                continue;
            }
            let Ok(period) = validate_period(&spec) else {
                warn!(job = %spec.name, "persisted spec is not periodic; skipped");
                continue;
            };
            let state = self.inner.store.state(&spec.name)?;
            let since = Duration::from_millis(now_ms().saturating_sub(state.last_run_ms));
            let first = match state.last_run_ms {
                0 => Duration::ZERO,
                _ => period.saturating_sub(since),
            };
            debug!(job = %spec.name, "restored; first tick in {:?}", first);
            let slot = Arc::new(Slot::with_state(state));
            let reg = self.inner.spawn_driver(spec, period, first, slot);
            registry.insert(reg.spec.name.clone(), reg);
            restored += 1;
        }
        if restored > 0 {
            info!("restored {restored} periodic job(s)");
        }
        Ok(restored)
    }

    /// Remove a registration, aborting any in-flight run (including one left
    /// over from a replace). Returns whether it existed (live or persisted).
    pub fn cancel(&self, name: &str) -> Result<bool> {
        let live = self.inner.registry()?.remove(name);
        if let Some(reg) = &live {
            reg.slot.cancel();
            reg.abort();
        }
        let persisted = self.inner.store.remove(name)?;
        if live.is_some() || persisted {
            info!(job = name, "periodic job cancelled");
        }
        Ok(live.is_some() || persisted)
    }

    pub fn status(&self, name: &str) -> JobStatus {
        match self.inner.registry() {
            Ok(reg) => reg.get(name).map(|r| r.slot.status()).unwrap_or(JobStatus::Unregistered),
            Err(_) => JobStatus::Unregistered,
        }
    }

    /// Active registrations, sorted by name.
    pub fn registrations(&self) -> Vec<JobView> {
        let Ok(registry) = self.inner.registry() else { return Vec::new() };
        let mut out: Vec<JobView> = registry
            .values()
            .map(|r| JobView {
                spec: r.spec.clone(),
                status: r.slot.status(),
                state: r.slot.state(),
            })
            .collect();
        out.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        out
    }

    pub fn store(&self) -> &JobStore<K> {
        &self.inner.store
    }
}

fn validate_period(spec: &JobSpec) -> Result<Duration> {
    let period = spec
        .period()
        .ok_or_else(|| SchedulerError::NotPeriodic(spec.name.clone()))?;
    if period.is_zero() {
        return Err(SchedulerError::ZeroInterval(spec.name.clone()));
    }
    Ok(period)
}

fn cancelled() -> JobResult {
    JobResult::Failure(FailureReason::Cancelled)
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl<K: Kv> Inner<K> {
    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, Registration>>> {
        self.registry
            .lock()
            .map_err(|_| SchedulerError::Store(anyhow::anyhow!("registry lock poisoned")))
    }

    fn run_lease<'a>(&'a self, name: &'a str) -> RunLease<'a> {
        let lock = match self.run_locks.lock() {
            Ok(mut locks) => locks.entry(name.to_string()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        };
        RunLease { locks: &self.run_locks, name, lock }
    }

    fn unmet_constraint(&self, spec: &JobSpec) -> Option<Constraint> {
        spec.constraints.iter().copied().find(|c| !self.probe.is_met(*c))
    }

    /// Execute while holding the per-name run lock.
    async fn run_serialized(&self, spec: &JobSpec, slot: &Slot) -> JobResult {
        let lease = self.run_lease(&spec.name);
        let _turn = lease.lock.lock().await;
        slot.set_running(true);
        let _reset = RunningGuard(slot);
        self.runner.sample(&spec.action).await
    }

    /// Deliver the fix and update counters after a run; `retry_in` is the
    /// backoff delay, if any. Skipped once the registration is cancelled.
    fn record(&self, name: &str, slot: &Slot, result: &JobResult, retry_in: Option<Duration>) {
        let Ok(mut st) = slot.state.lock() else { return };
        if slot.cancelled.load(Ordering::SeqCst) {
            debug!(job = name, "registration cancelled; run result dropped");
            return;
        }
        self.runner.deliver(name, result);

        st.last_run_ms = now_ms();
        st.runs = st.runs.saturating_add(1);
        st.last_outcome = result.label().to_string();
        match result {
            JobResult::Retry => st.failures = st.failures.saturating_add(1),
            _ => st.failures = 0,
        }
        st.backoff_ms = retry_in.map(|d| d.as_millis() as u64).unwrap_or(0);
        if let Err(e) = self.store.save_state(name, &st) {
            warn!(job = name, "persist state failed: {e:#}");
        }
    }

    fn spawn_driver(
        self: &Arc<Self>,
        spec: JobSpec,
        period: Duration,
        first: Duration,
        slot: Arc<Slot>,
    ) -> Registration {
        let (retire, retired) = watch::channel(());
        let driver = self.clone().drive(spec.clone(), period, first, slot.clone(), retired);
        let task = tokio::spawn(driver);
        Registration { spec, slot, task, draining: Vec::new(), _retire: retire }
    }

    async fn drive(
        self: Arc<Self>,
        spec: JobSpec,
        period: Duration,
        first: Duration,
        slot: Arc<Slot>,
        mut retired: watch::Receiver<()>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let mut delay = first;
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = retired.changed() => {
                    debug!(job = %spec.name, "registration retired");
                    return;
                }
                _ = shutdown_signal(&mut shutdown) => return,
            }

            if let Some(c) = self.unmet_constraint(&spec) {
                info!(job = %spec.name, constraint = %c, "constraint unmet; tick skipped");
                delay = period;
                continue;
            }

            let result = tokio::select! {
                r = self.run_serialized(&spec, &slot) => r,
                _ = shutdown_signal(&mut shutdown) => return,
            };

            let retry_in = match result {
                JobResult::Retry => {
                    attempt += 1;
                    let d = self.backoff.delay_for(attempt);
                    if d.is_none() {
                        warn!(job = %spec.name, "retries exhausted; back to regular interval");
                        attempt = 0;
                    }
                    d
                }
                _ => {
                    attempt = 0;
                    None
                }
            };
            self.record(&spec.name, &slot, &result, retry_in);
            info!(job = %spec.name, outcome = result.label(), "periodic run finished");
            delay = retry_in.unwrap_or(period);
        }
    }

    async fn run_once(self: Arc<Self>, spec: JobSpec) -> JobResult {
        let mut shutdown = self.shutdown.clone();
        let slot = Slot::default();
        let mut delay = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_signal(&mut shutdown) => return cancelled(),
            }

            if let Some(c) = self.unmet_constraint(&spec) {
                debug!(job = %spec.name, constraint = %c, "one-shot waiting for constraint");
                delay = CONSTRAINT_RECHECK;
                continue;
            }

            let result = tokio::select! {
                r = self.run_serialized(&spec, &slot) => r,
                _ = shutdown_signal(&mut shutdown) => return cancelled(),
            };
            self.runner.deliver(&spec.name, &result);

            if result == JobResult::Retry {
                attempt += 1;
                if let Some(d) = self.backoff.delay_for(attempt) {
                    debug!(job = %spec.name, attempt, "one-shot retry in {:?}", d);
                    delay = d;
                    continue;
                }
                warn!(job = %spec.name, "one-shot retries exhausted");
            }
            info!(job = %spec.name, outcome = result.label(), "one-shot finished");
            return result;
        }
    }
}
