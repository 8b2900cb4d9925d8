//! Property-based tests for partitioning and batch response correlation.

use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};
use tether_core::codec::{Dialect, JsonRpcCodec, WireCodec};
use tether_core::partition::{longest_first, round_robin};
use tether_core::{CallDescriptor, Request};

fn requests(weights: &[u64]) -> Vec<Request> {
    let desc = CallDescriptor::builder("m").build();
    weights
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let mut r = Request::new(i as u64 + 1, &desc, vec![json!(i)], Duration::from_secs(1));
            r.weight = *w;
            r
        })
        .collect()
}

proptest! {
    /// Every request lands in exactly one partition and no partition is empty.
    #[test]
    fn test_round_robin_is_a_partition(len in 1usize..40, count in 1usize..8) {
        let parts = round_robin(requests(&vec![1; len]), count);
        prop_assert!(parts.len() <= count);
        prop_assert!(parts.iter().all(|p| !p.is_empty()));
        let ids: HashSet<u64> = parts.iter().flatten().map(|r| r.id).collect();
        prop_assert_eq!(ids.len(), len);
        for part in &parts {
            prop_assert!(part.windows(2).all(|w| w[0].id < w[1].id));
        }
    }

    /// Greedy longest-first keeps the spread between the heaviest and
    /// lightest partition within the largest single weight.
    #[test]
    fn test_longest_first_balance(
        weights in proptest::collection::vec(1u64..1000, 1..40),
        count in 1usize..8,
    ) {
        let parts = longest_first(requests(&weights), count);
        let ids: HashSet<u64> = parts.iter().flatten().map(|r| r.id).collect();
        prop_assert_eq!(ids.len(), weights.len());

        let loads: Vec<u64> = parts.iter().map(|p| p.iter().map(|r| r.weight).sum()).collect();
        let max_load = loads.iter().copied().max().unwrap_or(0);
        let min_load = loads.iter().copied().min().unwrap_or(0);
        let heaviest = weights.iter().copied().max().unwrap_or(0);
        prop_assert!(max_load - min_load <= heaviest);
    }

    /// Batch responses in any order are matched back to their requests.
    #[test]
    fn test_batch_response_order_is_irrelevant(
        order in Just((0..12u64).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let reqs = requests(&[1; 12]);
        let body: Vec<Value> = order
            .iter()
            .map(|i| json!({"jsonrpc": "2.0", "result": i, "id": i + 1}))
            .collect();
        let body = serde_json::to_vec(&body).unwrap();

        let outcomes = codec.decode_batch(&body, &reqs).unwrap();
        for (i, (id, outcome)) in outcomes.into_iter().enumerate() {
            prop_assert_eq!(id, i as u64 + 1);
            prop_assert_eq!(outcome, Ok(json!(i)));
        }
    }
}
