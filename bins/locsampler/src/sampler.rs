use loc_core::cfg::SamplingCfg;
use loc_core::job::{ExistingPolicy, JobResult};
use tracing::{info, warn};

use crate::module::{Module, ModuleCtx};

/// Boot-time registration: restore persisted jobs, fire the startup
/// one-shot, and register the recurring sample with Keep.
pub struct Sampling {
    cfg: SamplingCfg,
}

impl Sampling {
    pub fn new(cfg: SamplingCfg) -> Self {
        Self { cfg }
    }
}

impl Module for Sampling {
    fn name(&self) -> &'static str { "sampling" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let sched = ctx.scheduler.clone();
            sched.restore()?;

            if self.cfg.run_once_on_start {
                let once = sched.enqueue_once(self.cfg.once_spec());
                tokio::spawn(async move {
                    match once.await {
                        Ok(JobResult::Success(fix)) => {
                            info!("startup fix {}, {}", fix.latitude, fix.longitude)
                        }
                        Ok(other) => warn!("startup sample ended with {}", other.label()),
                        Err(e) => warn!("startup sample task failed: {e}"),
                    }
                });
            }

            let outcome = sched.enqueue_periodic(self.cfg.periodic_spec(), ExistingPolicy::Keep)?;
            info!(
                "sampling job {} {:?} ({:?})",
                self.cfg.job_name,
                outcome,
                sched.status(&self.cfg.job_name)
            );

            loop {
                if ctx.shutdown.changed().await.is_err() || *ctx.shutdown.borrow() {
                    for v in sched.registrations() {
                        info!(
                            job = %v.spec.name,
                            runs = v.state.runs,
                            last = %v.state.last_outcome,
                            "sampling stopping"
                        );
                    }
                    break;
                }
            }
            Ok(())
        })
    }
}
