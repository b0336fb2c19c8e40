use std::sync::Arc;
use std::time::Duration;

use loc_core::job::{FailureReason, JobResult};
use tracing::warn;

use crate::location::LocationSource;
use crate::permission::{PermissionGate, PermissionKind};

/// Deadline used when none is configured.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(20);

/// One attempt at acquiring a location fix.
pub struct SampleJob {
    source: Arc<dyn LocationSource>,
    gate: Arc<dyn PermissionGate>,
    deadline: Duration,
    high_accuracy: bool,
    background: bool,
}

impl SampleJob {
    pub fn new(source: Arc<dyn LocationSource>, gate: Arc<dyn PermissionGate>) -> Self {
        Self { source, gate, deadline: DEFAULT_DEADLINE, high_accuracy: true, background: true }
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn high_accuracy(mut self, on: bool) -> Self {
        self.high_accuracy = on;
        self
    }

    /// Background runs additionally require the background-location grant.
    pub fn background(mut self, on: bool) -> Self {
        self.background = on;
        self
    }

    fn missing_permission(&self) -> Option<PermissionKind> {
        let mut needed = vec![PermissionKind::ForegroundLocation];
        if self.background {
            needed.push(PermissionKind::BackgroundLocation);
        }
        needed.into_iter().find(|k| !self.gate.has_permission(*k))
    }

    /// Check permissions, then wait (bounded) for one fix.
    pub async fn run(&self) -> JobResult {
        if let Some(kind) = self.missing_permission() {
            warn!(?kind, "location permission missing; sample skipped");
            return JobResult::Failure(FailureReason::PermissionDenied);
        }
        self.source.request_fix(self.deadline, self.high_accuracy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::StaticGate;
    use async_trait::async_trait;
    use loc_core::job::LocationFix;
    use std::sync::Mutex;

    /// Records every call and answers with a canned result.
    struct FakeSource {
        calls: Mutex<Vec<(Duration, bool)>>,
        answer: JobResult,
    }

    impl FakeSource {
        fn new(answer: JobResult) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()), answer })
        }
    }

    #[async_trait]
    impl LocationSource for FakeSource {
        async fn request_fix(&self, deadline: Duration, high_accuracy: bool) -> JobResult {
            self.calls.lock().unwrap().push((deadline, high_accuracy));
            self.answer.clone()
        }
    }

    fn fix() -> LocationFix {
        LocationFix { latitude: 37.7749, longitude: -122.4194, accuracy_m: 10.0, timestamp_ms: 1 }
    }

    #[tokio::test]
    async fn denied_permission_fails_without_touching_source() {
        let source = FakeSource::new(JobResult::Success(fix()));
        let gate = Arc::new(StaticGate::new(false, true));

        let result = SampleJob::new(source.clone(), gate).run().await;

        assert_eq!(result, JobResult::Failure(FailureReason::PermissionDenied));
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn background_grant_only_needed_for_background_runs() {
        let source = FakeSource::new(JobResult::Success(fix()));
        let gate = Arc::new(StaticGate::new(true, false));

        let bg = SampleJob::new(source.clone(), gate.clone()).run().await;
        assert_eq!(bg, JobResult::Failure(FailureReason::PermissionDenied));

        let fg = SampleJob::new(source.clone(), gate).background(false).run().await;
        assert_eq!(fg, JobResult::Success(fix()));
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn passes_deadline_and_accuracy_and_maps_result_through() {
        let source = FakeSource::new(JobResult::Retry);
        let gate = Arc::new(StaticGate::new(true, true));

        let job = SampleJob::new(source.clone(), gate);
        assert_eq!(job.run().await, JobResult::Retry);
        let job = job.deadline(Duration::from_secs(3)).high_accuracy(false);
        assert_eq!(job.run().await, JobResult::Retry);

        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![(DEFAULT_DEADLINE, true), (Duration::from_secs(3), false)]
        );
    }
}
