//! Splitting a flush into per-connection partitions.

use std::time::Duration;

use crate::call::Request;
use crate::config::{ClientConfig, TimeoutPolicy};

/// Bandwidth class of the current network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkClass {
    /// Wired or WiFi.
    #[default]
    HighBandwidth,
    /// Metered or mobile.
    Constrained,
}

/// Reports which class of network the client is currently on.
pub trait NetworkClassifier: Send + Sync + 'static {
    /// Current network class.
    fn classify(&self) -> NetworkClass;
}

/// Classifier that always reports the same class.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedNetwork(pub NetworkClass);

impl NetworkClassifier for FixedNetwork {
    fn classify(&self) -> NetworkClass {
        self.0
    }
}

/// Connection limit for `class` under `config`.
pub fn connection_limit(config: &ClientConfig, class: NetworkClass) -> usize {
    match class {
        NetworkClass::HighBandwidth => config.max_connections_high_bandwidth,
        NetworkClass::Constrained => config.max_connections_constrained,
    }
    .max(1)
}

/// Deal requests to `count` partitions in turn, preserving their order
/// within each partition.
pub fn round_robin(requests: Vec<Request>, count: usize) -> Vec<Vec<Request>> {
    let count = count.clamp(1, requests.len().max(1));
    let mut parts: Vec<Vec<Request>> = (0..count).map(|_| Vec::new()).collect();
    for (i, request) in requests.into_iter().enumerate() {
        parts[i % count].push(request);
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Longest-processing-time-first list scheduling: heaviest requests first,
/// each to the partition with the smallest total weight so far.
pub fn longest_first(mut requests: Vec<Request>, count: usize) -> Vec<Vec<Request>> {
    let count = count.clamp(1, requests.len().max(1));
    requests.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.id.cmp(&b.id)));

    let mut parts: Vec<Vec<Request>> = (0..count).map(|_| Vec::new()).collect();
    let mut loads = vec![0u64; count];
    for request in requests {
        // min_by_key returns the first minimum, so ties go to the lowest index
        let target = loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(i, _)| i)
            .unwrap_or(0);
        loads[target] += request.weight;
        parts[target].push(request);
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Deadline of a partition under `policy`.
pub fn partition_timeout(policy: TimeoutPolicy, requests: &[Request]) -> Duration {
    policy.aggregate(requests.iter().map(|r| r.timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallDescriptor;

    fn weighted(weights: &[u64]) -> Vec<Request> {
        let desc = CallDescriptor::builder("m").build();
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let mut r = Request::new(i as u64 + 1, &desc, vec![], Duration::from_millis(100));
                r.weight = *w;
                r
            })
            .collect()
    }

    fn ids(parts: &[Vec<Request>]) -> Vec<Vec<u64>> {
        parts.iter().map(|p| p.iter().map(|r| r.id).collect()).collect()
    }

    #[test]
    fn test_round_robin() {
        let parts = round_robin(weighted(&[1, 1, 1, 1, 1]), 2);
        assert_eq!(ids(&parts), vec![vec![1, 3, 5], vec![2, 4]]);
    }

    #[test]
    fn test_round_robin_more_partitions_than_requests() {
        let parts = round_robin(weighted(&[1, 1]), 4);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_longest_first_isolates_heavy_request() {
        let parts = longest_first(weighted(&[9, 1, 1, 1]), 2);
        assert_eq!(ids(&parts), vec![vec![1], vec![2, 3, 4]]);
    }

    #[test]
    fn test_longest_first_tie_breaks() {
        let parts = longest_first(weighted(&[2, 2, 2, 2]), 2);
        assert_eq!(ids(&parts), vec![vec![1, 3], vec![2, 4]]);
    }

    #[test]
    fn test_partition_timeout_policies() {
        let reqs = weighted(&[1, 1, 1]);
        assert_eq!(
            partition_timeout(TimeoutPolicy::Sum, &reqs),
            Duration::from_millis(300)
        );
        assert_eq!(
            partition_timeout(TimeoutPolicy::Max, &reqs),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_connection_limit() {
        let config = ClientConfig::default();
        assert_eq!(connection_limit(&config, NetworkClass::HighBandwidth), 4);
        assert_eq!(connection_limit(&config, NetworkClass::Constrained), 2);
    }
}
