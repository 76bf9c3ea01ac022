//! Invocation counters for the gate

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters shared by the gate, the reload pipeline and the relay
#[derive(Debug, Default)]
pub struct GateStats {
    /// Requests that reached the gate
    pub requests: AtomicU64,
    /// Reload attempts started
    pub reloads: AtomicU64,
    /// Reload attempts that ended in an error
    pub failed_reloads: AtomicU64,
    /// Build invocations
    pub builds: AtomicU64,
    /// Start invocations
    pub starts: AtomicU64,
    /// Relays that failed at the connection level
    pub relay_failures: AtomicU64,
    /// Reloads currently in progress
    pub active_reloads: AtomicU64,
    /// Highest number of reloads ever in progress at once
    pub max_concurrent_reloads: AtomicU64,
}

impl GateStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_failure(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a reload as started. The reload counts as active until the
    /// returned guard is dropped, and as failed unless `succeeded` was called.
    pub fn reload_started(self: &Arc<Self>) -> ReloadGuard {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        let active = self.active_reloads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_reloads.fetch_max(active, Ordering::SeqCst);
        ReloadGuard {
            stats: Arc::clone(self),
            success: false,
        }
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn get_failed_reloads(&self) -> u64 {
        self.failed_reloads.load(Ordering::Relaxed)
    }

    pub fn get_builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn get_starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn get_relay_failures(&self) -> u64 {
        self.relay_failures.load(Ordering::Relaxed)
    }

    pub fn get_active_reloads(&self) -> u64 {
        self.active_reloads.load(Ordering::SeqCst)
    }

    pub fn get_max_concurrent_reloads(&self) -> u64 {
        self.max_concurrent_reloads.load(Ordering::SeqCst)
    }
}

/// An in-progress reload. Dropping it without `succeeded`, including when
/// the reload future is cancelled, records a failed reload.
#[derive(Debug)]
pub struct ReloadGuard {
    stats: Arc<GateStats>,
    success: bool,
}

impl ReloadGuard {
    pub fn succeeded(mut self) {
        self.success = true;
    }
}

impl Drop for ReloadGuard {
    fn drop(&mut self) {
        self.stats.active_reloads.fetch_sub(1, Ordering::SeqCst);
        if !self.success {
            self.stats.failed_reloads.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = GateStats::default();

        stats.record_request();
        stats.record_build();
        stats.record_start();
        stats.record_relay_failure();

        assert_eq!(stats.get_requests(), 1);
        assert_eq!(stats.get_builds(), 1);
        assert_eq!(stats.get_starts(), 1);
        assert_eq!(stats.get_relay_failures(), 1);
    }

    #[test]
    fn test_concurrent_reload_tracking() {
        let stats = Arc::new(GateStats::default());

        stats.reload_started().succeeded();
        drop(stats.reload_started());
        assert_eq!(stats.get_reloads(), 2);
        assert_eq!(stats.get_failed_reloads(), 1);
        assert_eq!(stats.get_active_reloads(), 0);
        assert_eq!(stats.get_max_concurrent_reloads(), 1);

        let first = stats.reload_started();
        let second = stats.reload_started();
        assert_eq!(stats.get_active_reloads(), 2);
        assert_eq!(stats.get_max_concurrent_reloads(), 2);

        drop(first);
        second.succeeded();
        assert_eq!(stats.get_active_reloads(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_reload_is_released() {
        let stats = Arc::new(GateStats::default());

        let task = {
            let stats = Arc::clone(&stats);
            async move {
                let guard = stats.reload_started();
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                guard.succeeded();
            }
        };
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), task).await;

        assert!(result.is_err());
        assert_eq!(stats.get_active_reloads(), 0);
        assert_eq!(stats.get_failed_reloads(), 1);
    }
}
