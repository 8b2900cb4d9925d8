//! The public client: validates calls and routes them to the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::auth::{AuthState, Credential, TokenRefresher};
use crate::cache::{CacheStats, ResponseCache};
use crate::call::{CallDescriptor, CallKind, Outcome, Request};
use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::codec::{decode_value, JsonRpcCodec, WireCodec};
use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::handles::{SlotKey, TaskConsumer, TaskHandleRegistry, Ticket};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::observable::PrimaryContext;
use crate::partition::{FixedNetwork, NetworkClassifier};
use crate::scheduler::{BatchScheduler, FlushContext};
use crate::session::TransportSession;
use crate::timing::WeightTracker;
use crate::transport::Transport;

/// Collapse per-request outcomes into the ordered value list, or the first
/// error.
pub fn aggregate(outcomes: Vec<Outcome>) -> Result<Vec<Value>> {
    outcomes.into_iter().collect()
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    codec: Option<Arc<dyn WireCodec>>,
    classifier: Arc<dyn NetworkClassifier>,
    context: Option<Arc<dyn PrimaryContext>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    runtime: Option<Handle>,
}

impl RpcClientBuilder {
    /// Replace the JSON-RPC codec selected by the configured dialect.
    pub fn codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Decide between high-bandwidth and constrained connection limits.
    pub fn network_classifier(mut self, classifier: Arc<dyn NetworkClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Deliver task-handle notifications through `context`.
    pub fn primary_context(mut self, context: Arc<dyn PrimaryContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Refresher consulted when the token expires or is rejected.
    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Runtime used for spawned flushes; defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the configuration and assemble the client.
    pub fn build(self) -> Result<RpcClient> {
        self.config
            .validate()
            .map_err(|e| RpcError::configuration("client", e.to_string()))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                RpcError::configuration("client", format!("no tokio runtime available: {}", e))
            })?,
        };
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(JsonRpcCodec::new(self.config.dialect)));
        let metrics = Arc::new(ClientMetrics::new());
        let auth = Arc::new(AuthState::from_config(&self.config.auth));
        auth.set_refresher(self.refresher);
        let session = TransportSession::new(
            &self.config,
            self.transport,
            auth.clone(),
            metrics.clone(),
            codec.content_type(),
        );
        let ctx = FlushContext {
            cache: ResponseCache::new(self.config.cache.clone()),
            config: self.config,
            codec,
            session,
            weights: WeightTracker::default(),
            metrics: metrics.clone(),
            classifier: self.classifier,
        };
        let (root, shutdown) = new_cancel_pair();
        info!(endpoint = %ctx.config.endpoint, dialect = ?ctx.config.dialect, mode = ?ctx.config.batch_mode, "rpc client created");
        Ok(RpcClient {
            scheduler: Arc::new(BatchScheduler::new(ctx, runtime)),
            handles: Arc::new(TaskHandleRegistry::new(self.context)),
            auth,
            metrics,
            next_id: AtomicU64::new(1),
            root,
            shutdown,
        })
    }
}

/// Client-side RPC engine.
///
/// Synchronous calls are `async fn`s that resolve when the single-request
/// flush carrying them completes. Asynchronous calls and notifications go
/// through the batch scheduler according to the configured batch mode.
pub struct RpcClient {
    scheduler: Arc<BatchScheduler>,
    handles: Arc<TaskHandleRegistry>,
    auth: Arc<AuthState>,
    metrics: Arc<ClientMetrics>,
    next_id: AtomicU64,
    root: CancelToken,
    shutdown: CancelHandle,
}

impl RpcClient {
    /// Start building a client over `transport`.
    pub fn builder(config: ClientConfig, transport: Arc<dyn Transport>) -> RpcClientBuilder {
        RpcClientBuilder {
            config,
            transport,
            codec: None,
            classifier: Arc::new(FixedNetwork::default()),
            context: None,
            refresher: None,
            runtime: None,
        }
    }

    /// Client with default collaborators on the current tokio runtime.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(config, transport).build()
    }

    fn request(&self, descriptor: &CallDescriptor, args: Vec<Value>) -> Request {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Request::new(id, descriptor, args, self.config().method_timeout())
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        self.scheduler.config()
    }

    /// Call a method and wait for its result.
    pub async fn call<T: DeserializeOwned>(&self, descriptor: &CallDescriptor, args: Vec<Value>) -> Result<T> {
        descriptor.validate(CallKind::Sync, &args)?;
        self.metrics.inc_requests();
        let (token, _handle) = self.root.child();
        let request = self.request(descriptor, args).with_cancel(token);
        debug!(method = %descriptor.name(), id = request.id, "sync call");
        let outcome = self
            .scheduler
            .execute(vec![request])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(RpcError::protocol("flush returned no outcome")))?;
        decode_value(outcome)
    }

    /// Thread-blocking variant of [`RpcClient::call`].
    ///
    /// From inside a multi-threaded runtime the current worker is handed
    /// over with `block_in_place`; it must not be used on a current-thread
    /// runtime.
    pub fn call_blocking<T: DeserializeOwned>(&self, descriptor: &CallDescriptor, args: Vec<Value>) -> Result<T> {
        let runtime = self.scheduler.runtime().clone();
        if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| runtime.block_on(self.call(descriptor, args)))
        } else {
            runtime.block_on(self.call(descriptor, args))
        }
    }

    /// Send a notification; no result is expected or delivered.
    pub fn notify(&self, descriptor: &CallDescriptor, args: Vec<Value>) -> Result<()> {
        descriptor.validate(CallKind::Notification, &args)?;
        self.metrics.inc_notifications();
        let request = self.request(descriptor, args);
        debug!(method = %descriptor.name(), "notification");
        self.scheduler.submit(request);
        Ok(())
    }

    /// Start an asynchronous call; `callback` receives the outcome.
    pub fn call_async<F>(&self, descriptor: &CallDescriptor, args: Vec<Value>, callback: F) -> Result<CancelHandle>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        descriptor.validate(CallKind::Async, &args)?;
        self.metrics.inc_requests();
        let (token, handle) = self.root.child();
        let request = self
            .request(descriptor, args)
            .with_cancel(token)
            .with_completion(Box::new(callback));
        debug!(method = %descriptor.name(), id = request.id, "async call");
        self.scheduler.submit(request);
        Ok(handle)
    }

    /// Start an asynchronous call owned by the task handle `(owner, slot)`.
    ///
    /// Any operation already running in that slot is cancelled first.
    pub fn subscribe(
        &self,
        owner: &str,
        slot: &str,
        descriptor: &CallDescriptor,
        args: Vec<Value>,
        consumer: Arc<dyn TaskConsumer>,
    ) -> Result<Ticket> {
        descriptor.validate(CallKind::Async, &args)?;
        self.metrics.inc_requests();
        let ticket = self
            .handles
            .subscribe(SlotKey::new(owner, slot), consumer, &self.root);
        let request = self
            .request(descriptor, args)
            .with_cancel(ticket.token().clone())
            .with_progress(self.handles.progress_sink(&ticket))
            .with_completion(self.handles.completion(&ticket));
        debug!(method = %descriptor.name(), id = request.id, owner, slot, "subscribed call");
        self.scheduler.submit(request);
        Ok(ticket)
    }

    /// Stop delivering to the consumer of `(owner, slot)`.
    pub fn detach(&self, owner: &str, slot: &str) -> bool {
        self.handles.detach(&SlotKey::new(owner, slot))
    }

    /// Attach `consumer` to `(owner, slot)` and replay what it missed.
    pub fn reattach(&self, owner: &str, slot: &str, consumer: Arc<dyn TaskConsumer>) -> bool {
        self.handles.reattach(&SlotKey::new(owner, slot), consumer)
    }

    /// Cancel the operation held by `(owner, slot)`.
    pub fn cancel(&self, owner: &str, slot: &str) -> bool {
        self.handles.cancel(&SlotKey::new(owner, slot))
    }

    /// Hold asynchronous calls until [`RpcClient::flush_batch`].
    pub fn start_batch(&self) {
        self.scheduler.start_batch();
    }

    /// Flush the open batch and return its results in call order, or the
    /// first error.
    pub async fn flush_batch(&self) -> Result<Vec<Value>> {
        aggregate(self.scheduler.flush_batch().await)
    }

    /// Flush the open batch in the background and hand the aggregate to
    /// `callback`.
    pub fn flush_batch_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<Vec<Value>>) + Send + 'static,
    {
        let scheduler = Arc::clone(&self.scheduler);
        self.scheduler.runtime().spawn(async move {
            callback(aggregate(scheduler.flush_batch().await));
        });
    }

    /// Replace the bearer credential.
    pub async fn set_auth_credential(&self, credential: Option<Credential>) {
        self.auth.set_credential(credential).await;
    }

    /// Install or remove the token refresher.
    pub fn set_token_refresher(&self, refresher: Option<Arc<dyn TokenRefresher>>) {
        self.auth.set_refresher(refresher);
    }

    /// Drop every cached response.
    pub fn invalidate_cache(&self) {
        self.scheduler.cache().invalidate_all();
    }

    /// Cache counters and occupancy.
    pub fn cache_stats(&self) -> CacheStats {
        self.scheduler.cache().stats()
    }

    /// Snapshot of the client counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            auth_refreshes: self.auth.refresh_count(),
            ..self.metrics.snapshot()
        }
    }

    /// Requests waiting for the next group flush.
    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    /// Cancel every outstanding call and task handle.
    pub fn shutdown(&self) {
        info!("rpc client shutting down");
        self.shutdown.cancel(CancelReason::Shutdown);
        self.handles.cancel_all();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("scheduler", &self.scheduler)
            .field("handles", &self.handles.len())
            .finish()
    }
}
