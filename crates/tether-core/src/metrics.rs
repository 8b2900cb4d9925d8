//! Client-side counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::RpcError;

/// Point-in-time copy of the client counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Calls that expected a result.
    pub requests: u64,
    /// Fire-and-forget calls.
    pub notifications: u64,
    /// Flushes that reached the scheduler with at least one request.
    pub flushes: u64,
    /// Partitions sent over the network.
    pub partitions: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Cacheable requests sent to the server.
    pub cache_misses: u64,
    /// Requests that completed with an error, cancellations included.
    pub errors: u64,
    /// Requests that timed out.
    pub timeouts: u64,
    /// Requests completed as cancelled.
    pub cancellations: u64,
    /// Credential refreshes, preemptive and after a challenge.
    pub auth_refreshes: u64,
    /// Requests resent after an authentication challenge.
    pub challenge_resends: u64,
    /// Encoded payload bytes, resends included.
    pub bytes_sent: u64,
    /// Response body bytes.
    pub bytes_received: u64,
}

/// Lock-free counters shared by the dispatcher, scheduler and sessions.
#[derive(Default)]
pub struct ClientMetrics {
    requests: AtomicU64,
    notifications: AtomicU64,
    flushes: AtomicU64,
    partitions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    challenge_resends: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ClientMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request.
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a notification.
    pub fn inc_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a flush.
    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count partitions sent.
    pub fn add_partitions(&self, count: u64) {
        self.partitions.fetch_add(count, Ordering::Relaxed);
    }

    /// Count a cache hit.
    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a cache miss.
    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a resend after a challenge.
    pub fn inc_challenge_resends(&self) {
        self.challenge_resends.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the bytes sent.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add to the bytes received.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a failed request, classifying timeouts and cancellations.
    pub fn record_error(&self, error: &RpcError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        match error {
            RpcError::Timeout { .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            RpcError::Cancelled { .. } => {
                self.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Snapshot of all counters; `auth_refreshes` is left at zero and filled
    /// in by the owner of the credential state.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            partitions: self.partitions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            auth_refreshes: 0,
            challenge_resends: self.challenge_resends.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[test]
    fn test_new_is_zeroed() {
        assert_eq!(ClientMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_error_classification() {
        let metrics = ClientMetrics::new();
        metrics.record_error(&RpcError::Timeout { timeout_ms: 5 });
        metrics.record_error(&RpcError::Cancelled {
            reason: CancelReason::UserRequested,
        });
        metrics.record_error(&RpcError::protocol("bad"));
        let snap = metrics.snapshot();
        assert_eq!(snap.errors, 3);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.cancellations, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ClientMetrics::new();
        metrics.add_bytes_sent(128);
        metrics.inc_cache_hits();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["bytes_sent"], 128);
        assert_eq!(json["cache_hits"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let metrics = Arc::new(ClientMetrics::new());
        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let metrics = metrics.clone();
            tasks.spawn(async move {
                for _ in 0..100 {
                    metrics.inc_requests();
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        assert_eq!(metrics.snapshot().requests, 800);
    }
}
