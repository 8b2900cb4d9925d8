//! Call descriptions and the requests built from them.
//!
//! A [`CallDescriptor`] is the static shape of a remote method: its name,
//! parameter labels, expected result, timeout and caching policy. The
//! dispatcher validates arguments against it and turns every invocation into
//! a [`Request`] owned by the scheduler until its completion fires.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::CacheKey;
use crate::cancel::CancelToken;
use crate::error::{Result, RpcError};

/// How the caller expects to receive the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallKind {
    /// The caller waits for the result.
    #[default]
    Sync,
    /// The result is delivered to a callback or task handle.
    Async,
    /// No result is expected.
    Notification,
}

/// Declared shape of a call's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    /// The result is ignored.
    Void,
    /// A non-null result is required.
    #[default]
    Required,
    /// A null or missing result is accepted.
    AllowEmpty,
}

/// Caching rules for one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
    /// Results may be served from the cache.
    pub cacheable: bool,
    /// Lifetime of a cached result; the cache default applies when unset.
    pub ttl: Option<Duration>,
    /// Maximum number of cached results kept for this method.
    pub max_entries: Option<usize>,
}

/// Static description of a remote method.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    name: String,
    param_names: Option<Vec<String>>,
    returns: ResultShape,
    timeout: Option<Duration>,
    cache: CachePolicy,
    kind: CallKind,
}

impl CallDescriptor {
    /// Start describing the method `name`.
    pub fn builder(name: impl Into<String>) -> CallDescriptorBuilder {
        CallDescriptorBuilder {
            descriptor: CallDescriptor {
                name: name.into(),
                param_names: None,
                returns: ResultShape::Required,
                timeout: None,
                cache: CachePolicy::default(),
                kind: CallKind::Sync,
            },
        }
    }

    /// Remote method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Labels for named parameters.
    pub fn param_names(&self) -> Option<&[String]> {
        self.param_names.as_deref()
    }

    /// Expected result shape.
    pub fn returns(&self) -> ResultShape {
        self.returns
    }

    /// Per-method timeout override.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Caching rules.
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    /// How the call is dispatched.
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Check that this descriptor may be invoked as `used_as` with `args`.
    pub fn validate(&self, used_as: CallKind, args: &[Value]) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RpcError::configuration(&self.name, "method name is empty"));
        }
        if self.kind != used_as {
            return Err(RpcError::configuration(
                &self.name,
                format!("declared as {:?} but invoked as {:?}", self.kind, used_as),
            ));
        }
        if let Some(names) = &self.param_names {
            if names.len() != args.len() {
                return Err(RpcError::configuration(
                    &self.name,
                    format!(
                        "{} parameter names for {} arguments",
                        names.len(),
                        args.len()
                    ),
                ));
            }
        }
        if self.kind == CallKind::Notification {
            if self.returns != ResultShape::Void {
                return Err(RpcError::configuration(
                    &self.name,
                    "notifications cannot declare a result",
                ));
            }
            if self.cache.cacheable {
                return Err(RpcError::configuration(
                    &self.name,
                    "notifications cannot be cached",
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`CallDescriptor`].
#[derive(Debug, Clone)]
pub struct CallDescriptorBuilder {
    descriptor: CallDescriptor,
}

impl CallDescriptorBuilder {
    /// Send parameters as a named object instead of a positional array.
    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.param_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Expected result shape.
    pub fn returns(mut self, shape: ResultShape) -> Self {
        self.descriptor.returns = shape;
        self
    }

    /// Accept a `null` result.
    pub fn allow_empty_result(self) -> Self {
        self.returns(ResultShape::AllowEmpty)
    }

    /// Override the client-wide method timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = Some(timeout);
        self
    }

    /// Cache results for `ttl`, keeping at most `max_entries` for this method.
    pub fn cacheable(mut self, ttl: Option<Duration>, max_entries: Option<usize>) -> Self {
        self.descriptor.cache = CachePolicy {
            cacheable: true,
            ttl,
            max_entries,
        };
        self
    }

    /// How the call is dispatched.
    pub fn kind(mut self, kind: CallKind) -> Self {
        self.descriptor.kind = kind;
        self
    }

    /// Shorthand for an asynchronous call.
    pub fn asynchronous(self) -> Self {
        self.kind(CallKind::Async)
    }

    /// Shorthand for a fire-and-forget call with no result.
    pub fn notification(self) -> Self {
        self.kind(CallKind::Notification).returns(ResultShape::Void)
    }

    /// Finish the descriptor.
    pub fn build(self) -> CallDescriptor {
        self.descriptor
    }
}

/// Outcome delivered for one request.
pub type Outcome = Result<Value>;

/// Completion invoked exactly once with a request's outcome.
pub type Completion = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Receives progress updates in percent.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync + 'static>;

/// One logical remote call, owned by the scheduler until completed.
pub struct Request {
    /// Per-client request id, echoed by the server.
    pub id: u64,
    /// Remote method name.
    pub name: String,
    /// Argument values in order.
    pub args: Vec<Value>,
    /// Labels sending `args` by name.
    pub param_names: Option<Vec<String>>,
    /// Expected result shape.
    pub returns: ResultShape,
    /// Effective timeout; zero means none.
    pub timeout: Duration,
    /// Caching rules copied from the descriptor.
    pub cache: CachePolicy,
    /// Sent without an id; no result is expected.
    pub notification: bool,
    /// Estimated cost used by weighted partitioning.
    pub weight: u64,
    pub(crate) completion: Option<Completion>,
    pub(crate) progress: Option<ProgressSink>,
    pub(crate) cancel: Option<CancelToken>,
}

impl Request {
    /// Build a request from a validated descriptor.
    pub fn new(id: u64, descriptor: &CallDescriptor, args: Vec<Value>, timeout: Duration) -> Self {
        Request {
            id,
            name: descriptor.name.clone(),
            args,
            param_names: descriptor.param_names.clone(),
            returns: descriptor.returns,
            timeout: descriptor.timeout.unwrap_or(timeout),
            cache: descriptor.cache,
            notification: descriptor.kind == CallKind::Notification,
            weight: 1,
            completion: None,
            progress: None,
            cancel: None,
        }
    }

    /// Attach the completion.
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Attach a progress listener.
    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Cache key, if this request may be served from the cache.
    pub fn cache_key(&self) -> Option<CacheKey> {
        if self.cache.cacheable && !self.notification {
            Some(CacheKey::new(&self.name, &self.args))
        } else {
            None
        }
    }

    /// True once the attached token is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// Copy carrying everything needed on the wire but not the completion,
    /// which stays with the original.
    pub(crate) fn wire_copy(&self) -> Request {
        Request {
            id: self.id,
            name: self.name.clone(),
            args: self.args.clone(),
            param_names: self.param_names.clone(),
            returns: self.returns,
            timeout: self.timeout,
            cache: self.cache,
            notification: self.notification,
            weight: self.weight,
            completion: None,
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub(crate) fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    pub(crate) fn report_progress(&self, percent: u8) {
        if let Some(progress) = &self.progress {
            progress(percent.min(100));
        }
    }

    /// Deliver the outcome; a cancelled request always sees a cancellation.
    pub(crate) fn complete(mut self, outcome: Outcome) -> Outcome {
        let outcome = match self.cancel.as_ref().and_then(|t| t.cancelled_reason()) {
            Some(reason) => Err(RpcError::Cancelled { reason }),
            None => outcome,
        };
        if let Some(completion) = self.completion.take() {
            completion(outcome.clone());
        }
        outcome
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("weight", &self.weight)
            .field("notification", &self.notification)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}
