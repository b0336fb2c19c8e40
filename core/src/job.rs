use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A single resolved location reading.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LocationFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy_m: f64,
    /// Time the fix was produced (ms since epoch).
    pub timestamp_ms: u64,
}

/// A named, schedulable unit of work.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobSpec {
    /// Unique registration key.
    pub name: String,
    /// One-shot or recurring.
    pub schedule: Schedule,
    /// Conditions that must hold at tick time.
    pub constraints: BTreeSet<Constraint>,
    /// The work to perform when the job triggers.
    pub action: Action,
}

impl JobSpec {
    /// Recurring spec with no constraints.
    pub fn periodic(name: impl Into<String>, period: Duration, action: Action) -> Self {
        Self {
            name: name.into(),
            schedule: Schedule::Every { period_ms: period.as_millis() as u64 },
            constraints: BTreeSet::new(),
            action,
        }
    }

    /// One-shot spec with no constraints.
    pub fn once(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            schedule: Schedule::Once,
            constraints: BTreeSet::new(),
            action,
        }
    }

    /// Add a constraint (builder style).
    pub fn with_constraint(mut self, c: Constraint) -> Self {
        self.constraints.insert(c);
        self
    }

    /// Interval between ticks, `None` for one-shot specs.
    pub fn period(&self) -> Option<Duration> {
        match self.schedule {
            Schedule::Once => None,
            Schedule::Every { period_ms } => Some(Duration::from_millis(period_ms)),
        }
    }
}

/// When a job runs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Exactly once.
    Once,
    /// Every `period_ms` milliseconds.
    Every {
        /// Period between ticks (milliseconds).
        period_ms: u64,
    },
}

/// Device conditions gating a tick.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Battery is not below the low threshold.
    BatteryNotLow,
    /// At least one network interface is up.
    NetworkAvailable,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::BatteryNotLow => f.write_str("battery-not-low"),
            Constraint::NetworkAvailable => f.write_str("network-available"),
        }
    }
}

/// Actions that a job can perform.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Action {
    /// Acquire one location fix.
    SampleLocation {
        /// Hard deadline for the fix (ms).
        deadline_ms: u64,
        /// Ask the provider for its highest accuracy mode.
        high_accuracy: bool,
        /// Runs outside the foreground; also requires background permission.
        background: bool,
    },
}

/// What happens when a periodic name is already registered.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExistingPolicy {
    /// Leave the existing registration untouched.
    Keep,
    /// Swap in the new spec; an in-flight run completes.
    Replace,
    /// Swap in the new spec and abort any in-flight run.
    ReplaceCancelling,
}

/// Outcome of one job execution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    /// A fix was obtained.
    Success(LocationFix),
    /// Transient failure; eligible for backoff.
    Retry,
    /// Terminal failure for this run.
    Failure(FailureReason),
}

impl JobResult {
    /// Short label used in logs and persisted state.
    pub fn label(&self) -> &'static str {
        match self {
            JobResult::Success(_) => "success",
            JobResult::Retry => "retry",
            JobResult::Failure(_) => "failure",
        }
    }
}

/// Why a run failed without retry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// The permission gate refused the run.
    PermissionDenied,
    /// The run was cancelled by shutdown.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PermissionDenied => f.write_str("permission-denied"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Lifecycle of a registration.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No registration exists for the name.
    Unregistered,
    /// Waiting for the next tick.
    Scheduled,
    /// A run is in flight.
    Running,
}

/// Exponential retry backoff.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Retries allowed before falling back to the regular schedule.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(5 * 60 * 60),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Runtime state for a job.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct JobState {
    /// Timestamp (ms since epoch) of last run.
    pub last_run_ms: u64,
    /// Completed runs (any outcome).
    pub runs: u64,
    /// Consecutive retry outcomes.
    pub failures: u64,
    /// Current backoff (ms), 0 when not retrying.
    pub backoff_ms: u64,
    /// Label of the last outcome, empty before the first run.
    pub last_outcome: String,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let p = BackoffPolicy {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(100),
            max_attempts: 4,
        };
        assert_eq!(p.delay_for(1), Some(Duration::from_secs(30)));
        assert_eq!(p.delay_for(2), Some(Duration::from_secs(60)));
        assert_eq!(p.delay_for(3), Some(Duration::from_secs(100)));
        assert_eq!(p.delay_for(4), Some(Duration::from_secs(100)));
        assert_eq!(p.delay_for(5), None);
        assert_eq!(p.delay_for(0), None);
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let p = BackoffPolicy { max_attempts: u32::MAX, ..BackoffPolicy::default() };
        assert_eq!(p.delay_for(200), Some(p.max));
    }

    #[test]
    fn spec_builders() {
        let action =
            Action::SampleLocation { deadline_ms: 20_000, high_accuracy: true, background: true };
        let spec = JobSpec::periodic("LocationWork", Duration::from_secs(3600), action.clone())
            .with_constraint(Constraint::BatteryNotLow)
            .with_constraint(Constraint::BatteryNotLow);
        assert_eq!(spec.period(), Some(Duration::from_secs(3600)));
        assert_eq!(spec.constraints.len(), 1);
        assert_eq!(JobSpec::once("x", action).period(), None);
    }

    #[test]
    fn specs_roundtrip_through_bincode() {
        let spec = JobSpec::periodic(
            "LocationWork",
            Duration::from_secs(60),
            Action::SampleLocation { deadline_ms: 20_000, high_accuracy: true, background: true },
        )
        .with_constraint(Constraint::NetworkAvailable);
        let bytes = bincode::serialize(&spec).unwrap();
        let back: JobSpec = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn failure_reason_labels() {
        assert_eq!(FailureReason::PermissionDenied.to_string(), "permission-denied");
        assert_eq!(
            serde_json::to_string(&JobResult::Failure(FailureReason::PermissionDenied)).unwrap(),
            r#"{"failure":"permission-denied"}"#
        );
    }
}
