use anyhow::Result;
use loc_core::job::LocationFix;
use loc_core::store::{JobStore, Kv};
use tracing::{debug, info};

/// Destination for fixes produced by successful runs.
pub trait FixSink: Send + Sync {
    fn record(&self, job: &str, fix: &LocationFix) -> Result<()>;
}

/// Keeps the last fix and a running count per job in the KV store.
pub struct KvFixSink<K: Kv> {
    store: JobStore<K>,
}

impl<K: Kv> KvFixSink<K> {
    pub fn new(store: JobStore<K>) -> Self {
        Self { store }
    }
}

impl<K: Kv> FixSink for KvFixSink<K> {
    fn record(&self, job: &str, fix: &LocationFix) -> Result<()> {
        let n = self.store.record_fix(job, fix)?;
        debug!(job, n, "fix stored");
        Ok(())
    }
}

/// Only logs the fix.
pub struct LogSink;

impl FixSink for LogSink {
    fn record(&self, job: &str, fix: &LocationFix) -> Result<()> {
        info!(job, "location {}, {} (±{}m)", fix.latitude, fix.longitude, fix.accuracy_m);
        Ok(())
    }
}
