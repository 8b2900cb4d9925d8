//! Batch scheduling and flush execution.
//!
//! Asynchronous requests wait in a [`BatchGroup`] until a flush drains it:
//! right away in immediate mode, on `flush_batch` while a manual batch is
//! open, or when the auto-flush timer fires. Synchronous calls skip the
//! group and run as their own single-request flush.
//!
//! A flush serves what it can from the response cache, splits the rest into
//! partitions (one per connection), sends the partitions concurrently and
//! completes every request in submission order. If a partition fails as a
//! whole, every network request of the flush receives that error; cache hits
//! still succeed. Partition tasks only get wire copies of their requests, so
//! completions still fire when a task panics.
//!
//! A single cacheable request whose cached copy expired but carries a server
//! validator is sent as a conditional request; `304 Not Modified` revives the
//! cached value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cache::{ResponseCache, Validator};
use crate::call::{Outcome, Request};
use crate::cancel::{new_cancel_pair, CancelReason, CancelToken};
use crate::codec::WireCodec;
use crate::config::{BatchMode, ClientConfig};
use crate::error::{Result, RpcError};
use crate::metrics::ClientMetrics;
use crate::partition::{connection_limit, longest_first, partition_timeout, round_robin, NetworkClassifier};
use crate::session::{TransportSession, NOT_MODIFIED};
use crate::timing::{Phase, TimeStat, WeightTracker};

/// Requests collected for the next group flush.
#[derive(Debug, Default)]
pub struct BatchGroup {
    requests: Vec<Request>,
    /// A manual batch has been started and not yet flushed.
    open: bool,
    /// An auto-flush timer is pending.
    timer_armed: bool,
}

impl BatchGroup {
    /// Requests waiting for the next flush.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// True between `start_batch` and its flush.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Everything a flush needs, shared with spawned partition tasks.
pub(crate) struct FlushContext {
    pub(crate) config: ClientConfig,
    pub(crate) codec: Arc<dyn WireCodec>,
    pub(crate) session: TransportSession,
    pub(crate) cache: ResponseCache,
    pub(crate) weights: WeightTracker,
    pub(crate) metrics: Arc<ClientMetrics>,
    pub(crate) classifier: Arc<dyn NetworkClassifier>,
}

/// Per-client scheduler.
pub struct BatchScheduler {
    ctx: Arc<FlushContext>,
    group: Mutex<BatchGroup>,
    flushing: tokio::sync::Mutex<()>,
    runtime: Handle,
}

/// What a partition task hands back to its flush.
struct PartitionReport {
    outcomes: Result<Vec<(u64, Outcome)>>,
    /// Validators of cacheable responses, by request id.
    validators: HashMap<u64, Validator>,
}

impl PartitionReport {
    fn failed(err: RpcError) -> Self {
        PartitionReport {
            outcomes: Err(err),
            validators: HashMap::new(),
        }
    }
}

impl BatchScheduler {
    pub(crate) fn new(ctx: FlushContext, runtime: Handle) -> Self {
        BatchScheduler {
            ctx: Arc::new(ctx),
            group: Mutex::new(BatchGroup::default()),
            flushing: tokio::sync::Mutex::new(()),
            runtime,
        }
    }

    fn lock_group(&self) -> MutexGuard<'_, BatchGroup> {
        self.group.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub(crate) fn cache(&self) -> &ResponseCache {
        &self.ctx.cache
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Number of requests waiting for the next group flush.
    pub fn pending(&self) -> usize {
        self.lock_group().len()
    }

    /// Open a manual batch; asynchronous calls are held until `flush_batch`.
    pub fn start_batch(&self) {
        self.lock_group().open = true;
    }

    /// Queue an asynchronous request or notification according to the
    /// batch mode.
    pub fn submit(self: &Arc<Self>, request: Request) {
        let arm_timer = {
            let mut group = self.lock_group();
            if group.open {
                group.requests.push(request);
                return;
            }
            match self.ctx.config.batch_mode {
                BatchMode::AutoFlush => {
                    group.requests.push(request);
                    !std::mem::replace(&mut group.timer_armed, true)
                }
                BatchMode::Immediate | BatchMode::Manual => {
                    drop(group);
                    let scheduler = Arc::clone(self);
                    self.runtime.spawn(async move {
                        scheduler.execute(vec![request]).await;
                    });
                    return;
                }
            }
        };
        if arm_timer {
            let scheduler = Arc::clone(self);
            let delay = self.ctx.config.auto_flush_delay();
            self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                scheduler.flush_group().await;
            });
        }
    }

    /// Close the manual batch and flush everything queued.
    pub async fn flush_batch(&self) -> Vec<Outcome> {
        self.lock_group().open = false;
        self.flush_group().await
    }

    /// Drain the group and flush it; group flushes never overlap.
    pub async fn flush_group(&self) -> Vec<Outcome> {
        let _flushing = self.flushing.lock().await;
        let requests = {
            let mut group = self.lock_group();
            group.timer_armed = false;
            std::mem::take(&mut group.requests)
        };
        self.execute(requests).await
    }

    /// Run one flush and return the outcomes in submission order.
    pub async fn execute(&self, mut requests: Vec<Request>) -> Vec<Outcome> {
        if requests.is_empty() {
            return Vec::new();
        }
        let ctx = &self.ctx;
        ctx.metrics.inc_flushes();
        requests.sort_by_key(|r| r.id);
        let total = requests.len();

        let mut done: Vec<(Request, Outcome)> = Vec::with_capacity(total);
        let mut network = Vec::with_capacity(total);
        for mut request in requests {
            if let Some(reason) = request.cancel_token().and_then(CancelToken::cancelled_reason) {
                done.push((request, Err(RpcError::Cancelled { reason })));
                continue;
            }
            if let Some(key) = request.cache_key().filter(|_| ctx.cache.is_enabled()) {
                if let Some(value) = ctx.cache.probe(&key) {
                    ctx.metrics.inc_cache_hits();
                    request.report_progress(100);
                    done.push((request, Ok(value)));
                    continue;
                }
                ctx.metrics.inc_cache_misses();
            }
            if ctx.config.weighted_partitioning {
                request.weight = ctx.weights.weight(&request.name);
            }
            network.push(request);
        }
        let cache_hits = done.len();

        if !network.is_empty() {
            let limit = connection_limit(&ctx.config, ctx.classifier.classify());
            let count = limit.min(network.len());
            let partitions = if ctx.config.weighted_partitioning && !ctx.weights.is_empty() {
                longest_first(network, count)
            } else {
                round_robin(network, count)
            };
            debug!(
                requests = total,
                cache_hits,
                partitions = partitions.len(),
                "flush started"
            );
            ctx.metrics.add_partitions(partitions.len() as u64);

            let mut running = Vec::with_capacity(partitions.len());
            for (index, partition) in partitions.into_iter().enumerate() {
                let copies = partition.iter().map(Request::wire_copy).collect();
                let task = self
                    .runtime
                    .spawn(run_partition(Arc::clone(&self.ctx), index, copies));
                running.push((partition, task));
            }

            let mut failure: Option<RpcError> = None;
            let mut returned: Vec<(Vec<Request>, Option<RpcError>)> = Vec::with_capacity(running.len());
            let mut outcomes: HashMap<u64, Outcome> = HashMap::with_capacity(total);
            let mut validators: HashMap<u64, Validator> = HashMap::new();
            for (requests, task) in running {
                let result = match task.await {
                    Ok(report) => {
                        validators.extend(report.validators);
                        report.outcomes
                    }
                    Err(join_error) => {
                        error!(error = %join_error, "partition task did not finish");
                        Err(RpcError::Transport {
                            reason: format!("partition task failed: {}", join_error),
                        })
                    }
                };
                match result {
                    Ok(items) => {
                        outcomes.extend(items);
                        returned.push((requests, None));
                    }
                    Err(err) if err.is_cancelled() => {
                        returned.push((requests, Some(err)));
                    }
                    Err(err) => {
                        warn!(error = %err, "partition failed, failing the whole flush");
                        failure.get_or_insert_with(|| err.clone());
                        returned.push((requests, Some(err)));
                    }
                }
            }

            for (requests, local) in returned {
                for request in requests {
                    let outcome = match (&failure, &local) {
                        (Some(err), _) | (None, Some(err)) => Err(err.clone()),
                        (None, None) => outcomes.remove(&request.id).unwrap_or_else(|| {
                            if request.notification {
                                Ok(serde_json::Value::Null)
                            } else {
                                Err(RpcError::protocol(format!(
                                    "no outcome for request {}",
                                    request.id
                                )))
                            }
                        }),
                    };
                    if let (Some(key), Ok(value)) = (request.cache_key(), &outcome) {
                        ctx.cache.populate_validated(
                            key,
                            value.clone(),
                            request.cache.ttl,
                            request.cache.max_entries,
                            validators.remove(&request.id),
                        );
                    }
                    done.push((request, outcome));
                }
            }
        }

        done.sort_by_key(|(r, _)| r.id);
        let mut results = Vec::with_capacity(done.len());
        for (request, outcome) in done {
            let outcome = request.complete(outcome);
            if let Err(err) = &outcome {
                ctx.metrics.record_error(err);
            }
            results.push(outcome);
        }
        debug!(
            requests = total,
            failed = results.iter().filter(|o| o.is_err()).count(),
            "flush finished"
        );
        results
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("mode", &self.ctx.config.batch_mode)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Token that fires once every member of a partition has been cancelled.
fn partition_cancel(requests: &[Request]) -> (Option<CancelToken>, Option<JoinHandle<()>>) {
    if let [only] = requests {
        return (only.cancel_token().cloned(), None);
    }
    let tokens: Option<Vec<CancelToken>> = requests.iter().map(|r| r.cancel_token().cloned()).collect();
    match tokens {
        Some(tokens) if !tokens.is_empty() => {
            let (token, handle) = new_cancel_pair();
            let watcher = tokio::spawn(async move {
                let mut reason = CancelReason::UserRequested;
                for member in &tokens {
                    reason = member.cancelled().await;
                }
                handle.cancel(reason);
            });
            (Some(token), Some(watcher))
        }
        _ => (None, None),
    }
}

async fn run_partition(ctx: Arc<FlushContext>, index: usize, requests: Vec<Request>) -> PartitionReport {
    let timeout = partition_timeout(ctx.config.timeout_policy, &requests);
    let sinks = requests.iter().filter_map(|r| r.progress.clone()).collect();
    let mut stat = TimeStat::start(sinks);

    let encoded = match requests.as_slice() {
        [only] => ctx.codec.encode_call(only),
        many => ctx.codec.encode_batch(many),
    };
    let body = match encoded {
        Ok(body) => Bytes::from(body),
        Err(err) => return PartitionReport::failed(err),
    };

    let stale = match requests.as_slice() {
        [only] => only
            .cache_key()
            .and_then(|key| ctx.cache.stale(&key).map(|(value, validator)| (key, value, validator))),
        _ => None,
    };

    let (cancel, watcher) = partition_cancel(&requests);
    let response = ctx
        .session
        .send_conditional(
            body,
            timeout,
            cancel.as_ref(),
            stale.as_ref().map(|(_, _, validator)| validator),
            &mut stat,
        )
        .await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    let response = match response {
        Ok(response) => response,
        Err(err) => return PartitionReport::failed(err),
    };

    let mut validators = HashMap::new();
    let decoded = if requests.iter().all(|r| r.notification) {
        Ok(Vec::new())
    } else {
        match (requests.as_slice(), stale) {
            ([only], Some((key, value, validator))) if response.status == NOT_MODIFIED => {
                ctx.cache.revalidated(&key);
                validators.insert(only.id, validator);
                Ok(vec![(only.id, Ok(value))])
            }
            ([only], _) => {
                if only.cache.cacheable {
                    if let Some(validator) =
                        Validator::new(response.header("ETag"), response.header("Last-Modified"))
                    {
                        validators.insert(only.id, validator);
                    }
                }
                ctx.codec
                    .decode_single(&response.body, only)
                    .map(|outcome| vec![(only.id, outcome)])
            }
            (many, _) => ctx.codec.decode_batch(&response.body, many),
        }
    };
    stat.mark(Phase::Parse);
    debug!(
        partition = index,
        requests = requests.len(),
        endpoint = %ctx.session.endpoint(),
        timing = %stat,
        "partition finished"
    );
    if decoded.is_ok() {
        ctx.weights
            .record(requests.iter().map(|r| r.name.as_str()), stat.elapsed());
    }
    PartitionReport {
        outcomes: decoded,
        validators,
    }
}
