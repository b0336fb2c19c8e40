use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loc_core::error::FixError;
use loc_core::job::{JobResult, LocationFix};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info};

/// Handle returned by a provider for one update subscription.
pub type SubscriptionId = u64;

/// Invoked by the provider for every fix it produces.
pub type FixCallback = Box<dyn FnMut(LocationFix) + Send + 'static>;

/// Accuracy/power trade-off requested from the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    HighAccuracy,
    Balanced,
}

/// Parameters of one update subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixRequest {
    pub priority: Priority,
    /// How often the provider should deliver updates while subscribed.
    pub update_interval: Duration,
    /// Hold the first delivery until an accurate fix is available.
    pub wait_for_accurate: bool,
}

/// Callback-style platform location API.
pub trait FixProvider: Send + Sync + 'static {
    /// Start delivering fixes to `callback` until `unsubscribe(id)`.
    fn subscribe(
        &self,
        request: FixRequest,
        callback: FixCallback,
    ) -> Result<SubscriptionId, FixError>;
    /// Stop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Best-effort single fix acquisition under a deadline.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn request_fix(&self, deadline: Duration, high_accuracy: bool) -> JobResult;
}

/// Unsubscribes on drop, so timeouts and cancelled futures never leak.
struct Subscription<'a, P: FixProvider> {
    provider: &'a P,
    id: SubscriptionId,
}

impl<P: FixProvider> Drop for Subscription<'_, P> {
    fn drop(&mut self) {
        self.provider.unsubscribe(self.id);
        debug!(id = self.id, "location subscription closed");
    }
}

/// [`LocationSource`] over a [`FixProvider`]: one subscription per request,
/// the first delivered fix wins.
pub struct ProviderSource<P: FixProvider> {
    provider: Arc<P>,
    update_interval: Duration,
}

impl<P: FixProvider> ProviderSource<P> {
    pub fn new(provider: Arc<P>, update_interval: Duration) -> Self {
        Self { provider, update_interval }
    }

    /// Subscribe, wait for the first fix or the deadline, unsubscribe.
    pub async fn acquire(
        &self,
        deadline: Duration,
        high_accuracy: bool,
    ) -> Result<LocationFix, FixError> {
        let request = FixRequest {
            priority: if high_accuracy { Priority::HighAccuracy } else { Priority::Balanced },
            update_interval: self.update_interval,
            wait_for_accurate: high_accuracy,
        };

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let callback: FixCallback = Box::new(move |fix| match tx.take() {
            Some(tx) => {
                if tx.send(fix).is_err() {
                    debug!("fix arrived after the wait ended; discarded");
                }
            }
            None => debug!("extra fix after the first; ignored"),
        });

        let id = self.provider.subscribe(request, callback)?;
        let _sub = Subscription { provider: self.provider.as_ref(), id };

        match timeout(deadline, rx).await {
            Ok(Ok(fix)) => Ok(fix),
            Ok(Err(_)) => {
                Err(FixError::ProviderUnavailable("subscription dropped by provider".into()))
            }
            Err(_) => Err(FixError::Timeout(deadline)),
        }
    }
}

#[async_trait]
impl<P: FixProvider> LocationSource for ProviderSource<P> {
    async fn request_fix(&self, deadline: Duration, high_accuracy: bool) -> JobResult {
        match self.acquire(deadline, high_accuracy).await {
            Ok(fix) => {
                info!(
                    "fix lat={} lon={} acc={}m",
                    fix.latitude, fix.longitude, fix.accuracy_m
                );
                JobResult::Success(fix)
            }
            Err(e) => {
                info!("no fix: {e}");
                JobResult::Retry
            }
        }
    }
}
