//! Cooperative cancellation for in-flight calls.
//!
//! A [`CancelHandle`] triggers cancellation; any number of cloned
//! [`CancelToken`]s observe it, either by polling [`CancelToken::is_cancelled`]
//! or by awaiting [`CancelToken::cancelled`]. Child tokens are cancelled with
//! their parent but can also be cancelled on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

/// Reasons for cancelling a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit cancellation by the caller.
    #[default]
    UserRequested,
    /// A newer operation took over the same task-handle slot.
    Superseded,
    /// The client is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Superseded => write!(f, "Superseded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn new() -> Arc<Self> {
        Arc::new(CancelState {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = match self.children.lock() {
            Ok(mut c) => std::mem::take(&mut *c),
            Err(_) => Vec::new(),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }

    fn reason(&self) -> Option<CancelReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }
}

/// A lightweight, cloneable cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        if self.is_cancelled() {
            self.state.reason()
        } else {
            None
        }
    }

    /// Wait until the token is cancelled and return the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            if let Some(reason) = self.cancelled_reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Create a child token that is cancelled when this one is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = CancelState::new();
        if let Some(reason) = self.cancelled_reason() {
            state.cancel(reason);
        } else if let Ok(mut children) = self.state.children.lock() {
            // children whose tokens are all gone no longer need the cascade
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&state));
        }
        (
            CancelToken {
                state: state.clone(),
            },
            CancelHandle { state },
        )
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: self.state.clone(),
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = CancelState::new();
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_token_new() {
        let (token, _handle) = new_cancel_pair();
        assert!(!token.is_cancelled());
        assert_eq!(token.cancelled_reason(), None);
    }

    #[test]
    fn test_cancel_handle_cancels_token() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_double_cancel_keeps_first_reason() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Superseded);
        handle.cancel(CancelReason::Shutdown);
        assert_eq!(token.cancelled_reason(), Some(CancelReason::Superseded));
    }

    #[test]
    fn test_child_token_cancelled_by_parent() {
        let (token, handle) = new_cancel_pair();
        let (child, _child_handle) = token.child();
        handle.cancel(CancelReason::Shutdown);
        assert!(child.is_cancelled());
        assert_eq!(child.cancelled_reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_parent_not_cancelled_by_child() {
        let (token, _handle) = new_cancel_pair();
        let (child, child_handle) = token.child();
        child_handle.cancel(CancelReason::UserRequested);
        assert!(child.is_cancelled());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Shutdown);
        let (child, _) = token.child();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let (token, handle) = new_cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.cancel(CancelReason::UserRequested);
        let reason = waiter.await.unwrap();
        assert_eq!(reason, CancelReason::UserRequested);
    }

    #[tokio::test]
    async fn test_cancelled_future_ready_when_already_cancelled() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Superseded);
        assert_eq!(token.cancelled().await, CancelReason::Superseded);
    }
}
