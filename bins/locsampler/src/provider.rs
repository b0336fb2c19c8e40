use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use loc_core::cfg::SourceCfg;
use loc_core::error::FixError;
use loc_core::job::{now_ms, LocationFix};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::location::{FixCallback, FixProvider, FixRequest, SubscriptionId};

/// Stand-in for a platform location API: every subscription receives the
/// configured fix after `delay`, then again every `update_interval`.
/// A `None` delay never delivers.
pub struct SimulatedProvider {
    fix: LocationFix,
    delay: Option<Duration>,
    available: AtomicBool,
    next_id: AtomicU64,
    active: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    last_request: Mutex<Option<FixRequest>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    refused: AtomicUsize,
}

impl SimulatedProvider {
    pub fn new(fix: LocationFix, delay: Option<Duration>) -> Self {
        Self {
            fix,
            delay,
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
        }
    }

    pub fn from_cfg(cfg: &SourceCfg) -> Self {
        let fix = LocationFix {
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            accuracy_m: cfg.accuracy_m,
            timestamp_ms: 0,
        };
        let p = Self::new(fix, Some(Duration::from_millis(cfg.delay_ms)));
        p.set_available(cfg.available);
        p
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Accepted subscriptions so far.
    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Subscriptions refused while unavailable.
    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<FixRequest> {
        self.last_request.lock().ok().and_then(|r| *r)
    }
}

impl FixProvider for SimulatedProvider {
    fn subscribe(
        &self,
        request: FixRequest,
        mut callback: FixCallback,
    ) -> Result<SubscriptionId, FixError> {
        if !self.available.load(Ordering::SeqCst) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(FixError::ProviderUnavailable("simulated provider disabled".into()));
        }
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let template = self.fix;
        let first = self.delay;
        let every = request.update_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let Some(first) = first else {
                std::future::pending::<()>().await;
                return;
            };
            sleep(first).await;
            loop {
                callback(LocationFix { timestamp_ms: now_ms(), ..template });
                sleep(every).await;
            }
        });

        let mut active = self
            .active
            .lock()
            .map_err(|_| FixError::ProviderUnavailable("provider state poisoned".into()))?;
        active.insert(id, task);
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        debug!(id, "simulated subscription opened");
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self.active.lock().ok().and_then(|mut m| m.remove(&id));
        if let Some(task) = removed {
            task.abort();
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Priority;
    use std::sync::Arc;

    fn request() -> FixRequest {
        FixRequest {
            priority: Priority::Balanced,
            update_interval: Duration::from_secs(1),
            wait_for_accurate: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_repeatedly_until_unsubscribed() {
        let provider = SimulatedProvider::new(
            LocationFix { latitude: 1.0, longitude: 2.0, accuracy_m: 3.0, timestamp_ms: 0 },
            Some(Duration::from_millis(500)),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = provider
            .subscribe(request(), Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        sleep(Duration::from_millis(2_600)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        provider.unsubscribe(id);
        provider.unsubscribe(id);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(provider.unsubscribes(), 1);
        assert_eq!(provider.active_subscriptions(), 0);
    }

    #[test]
    fn from_cfg_copies_fix_and_availability() {
        let cfg = SourceCfg { available: false, ..SourceCfg::default() };
        let p = SimulatedProvider::from_cfg(&cfg);
        assert_eq!(p.fix.latitude, cfg.latitude);
        assert_eq!(p.delay, Some(Duration::from_millis(cfg.delay_ms)));
        assert!(!p.available.load(Ordering::SeqCst));
    }
}
