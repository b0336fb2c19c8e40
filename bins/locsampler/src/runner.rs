use std::sync::Arc;
use std::time::Duration;

use loc_core::job::{Action, JobResult};
use tracing::warn;

use crate::location::LocationSource;
use crate::permission::PermissionGate;
use crate::sample::SampleJob;
use crate::sink::FixSink;

/// Turns a job action into a [`JobResult`], handing fixes to the sink.
pub struct Runner {
    source: Arc<dyn LocationSource>,
    gate: Arc<dyn PermissionGate>,
    sink: Arc<dyn FixSink>,
}

impl Runner {
    pub fn new(
        source: Arc<dyn LocationSource>,
        gate: Arc<dyn PermissionGate>,
        sink: Arc<dyn FixSink>,
    ) -> Self {
        Self { source, gate, sink }
    }

    /// Execute one action for job `name`. Never fails: sink errors are logged.
    pub async fn execute(&self, name: &str, action: &Action) -> JobResult {
        let result = self.sample(action).await;
        self.deliver(name, &result);
        result
    }

    /// Run the action without touching the sink.
    pub async fn sample(&self, action: &Action) -> JobResult {
        match action {
            Action::SampleLocation { deadline_ms, high_accuracy, background } => {
                SampleJob::new(self.source.clone(), self.gate.clone())
                    .deadline(Duration::from_millis(*deadline_ms))
                    .high_accuracy(*high_accuracy)
                    .background(*background)
                    .run()
                    .await
            }
        }
    }

    /// Hand a successful result's fix to the sink.
    pub fn deliver(&self, name: &str, result: &JobResult) {
        if let JobResult::Success(fix) = result {
            if let Err(e) = self.sink.record(name, fix) {
                warn!(job = name, "fix sink failed: {e:#}");
            }
        }
    }
}
