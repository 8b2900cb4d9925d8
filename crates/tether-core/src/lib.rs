#![warn(missing_docs)]

//! Tether client engine: batched JSON-RPC calls over an authenticated
//! transport, with response caching and reattachable task handles.

/// Bearer credentials and token refresh.
pub mod auth;
/// Response cache.
pub mod cache;
/// Call descriptors and requests.
pub mod call;
/// Cancellation tokens.
pub mod cancel;
/// JSON-RPC encoding and decoding.
pub mod codec;
/// Client configuration.
pub mod config;
/// HTTP Digest authentication.
pub mod digest;
/// Public client surface.
pub mod dispatcher;
/// Error type.
pub mod error;
/// Reattachable task handles.
pub mod handles;
/// Client counters.
pub mod metrics;
/// Observable values and primary-context delivery.
pub mod observable;
/// Flush partitioning.
pub mod partition;
/// Batch scheduling and flush execution.
pub mod scheduler;
/// Authenticated exchanges.
pub mod session;
/// Phase timing and latency weights.
pub mod timing;
/// Transport boundary trait.
pub mod transport;

pub use auth::{AuthState, Credential, TokenRefresher};
pub use cache::{CacheKey, CacheStats, ResponseCache, Validator};
pub use call::{CallDescriptor, CallKind, CachePolicy, Outcome, Request, ResultShape};
pub use cancel::{CancelHandle, CancelReason, CancelToken};
pub use codec::{Dialect, JsonRpcCodec, WireCodec};
pub use config::{AuthConfig, BatchMode, CacheConfig, ClientConfig, TimeoutPolicy};
pub use dispatcher::{RpcClient, RpcClientBuilder};
pub use error::{Result, RpcError};
pub use handles::{SlotKey, TaskConsumer, Ticket};
pub use metrics::MetricsSnapshot;
pub use observable::{JsonFileStore, ObservableValue, PersistentStore, PrimaryContext};
pub use partition::{FixedNetwork, NetworkClass, NetworkClassifier};
pub use transport::{HttpRequest, HttpResponse, Transport};
