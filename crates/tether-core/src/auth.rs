//! Bearer credential state shared by all transport sessions of a client.
//!
//! The credential lives behind an async mutex that doubles as the
//! single-flight lock for refreshes: a session that finds the credential
//! expired refreshes it while holding the lock, and every session queued
//! behind it re-checks the credential before doing anything itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{Result, RpcError};

/// An access token and the moment it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Scheme sent before the token, e.g. `Bearer`.
    pub token_type: String,
    /// The token itself.
    pub token: String,
    /// Expiry, if known.
    pub expires_at: Option<Instant>,
}

impl Credential {
    /// A bearer token without a known expiry.
    pub fn bearer(token: impl Into<String>) -> Self {
        Credential {
            token_type: "Bearer".to_string(),
            token: token.into(),
            expires_at: None,
        }
    }

    /// Set the expiry to `lifetime` from now.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.expires_at = Some(Instant::now() + lifetime);
        self
    }

    /// True once `now` has reached the expiry.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_type", &self.token_type)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Obtains a new credential, typically from an OAuth2 token endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    /// Produce a replacement for `current`.
    async fn refresh(&self, current: Option<&Credential>) -> Result<Credential>;
}

/// Credential shared by the sessions of one client.
pub struct AuthState {
    credential: Mutex<Option<Credential>>,
    refresher: RwLock<Option<Arc<dyn TokenRefresher>>>,
    refreshes: AtomicU64,
}

impl AuthState {
    /// Empty state: no credential, no refresher.
    pub fn new() -> Self {
        AuthState {
            credential: Mutex::new(None),
            refresher: RwLock::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Build the initial state from the `auth` section of the config.
    pub fn from_config(config: &AuthConfig) -> Self {
        let credential = config.access_token.as_ref().map(|token| {
            let credential = Credential {
                token_type: config
                    .token_type
                    .clone()
                    .unwrap_or_else(|| "Bearer".to_string()),
                token: token.clone(),
                expires_at: None,
            };
            match config.token_lifetime_ms {
                Some(ms) => credential.with_lifetime(Duration::from_millis(ms)),
                None => credential,
            }
        });
        AuthState {
            credential: Mutex::new(credential),
            ..AuthState::new()
        }
    }

    /// Replace the current credential.
    pub async fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.lock().await = credential;
    }

    /// Install or remove the token refresher.
    pub fn set_refresher(&self, refresher: Option<Arc<dyn TokenRefresher>>) {
        if let Ok(mut slot) = self.refresher.write() {
            *slot = refresher;
        }
    }

    fn refresher(&self) -> Option<Arc<dyn TokenRefresher>> {
        self.refresher.read().ok().and_then(|r| r.clone())
    }

    /// True when a refresher is installed.
    pub fn has_refresher(&self) -> bool {
        self.refresher().is_some()
    }

    /// Number of refreshes performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Current `Authorization` header value, if any.
    pub async fn authorization(&self) -> Option<String> {
        self.credential.lock().await.as_ref().map(Credential::authorization)
    }

    /// Refresh the credential first if it is known to have expired, then
    /// return the header value to send.
    pub async fn ensure_fresh(&self) -> Result<Option<String>> {
        let mut guard = self.credential.lock().await;
        let expired = guard
            .as_ref()
            .map(|c| c.is_expired(Instant::now()))
            .unwrap_or(false);
        if expired {
            if let Some(refresher) = self.refresher() {
                debug!("credential expired, refreshing before send");
                let fresh = refresh_with(&refresher, guard.as_ref()).await?;
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                info!(token_type = %fresh.token_type, "credential refreshed");
                *guard = Some(fresh);
            }
        }
        Ok(guard.as_ref().map(Credential::authorization))
    }

    /// Handle a bearer challenge for a request sent with `seen`.
    ///
    /// If another session already replaced that credential the current one
    /// is returned without refreshing again.
    pub async fn refresh_after_challenge(&self, seen: Option<&str>) -> Result<String> {
        let mut guard = self.credential.lock().await;
        let current = guard.as_ref().map(Credential::authorization);
        if let Some(current) = current {
            if Some(current.as_str()) != seen {
                debug!("credential already refreshed by a concurrent request");
                return Ok(current);
            }
        }
        let refresher = self.refresher().ok_or_else(|| RpcError::Auth {
            reason: "server requires authentication and no token refresher is set".to_string(),
        })?;
        let fresh = refresh_with(&refresher, guard.as_ref()).await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(token_type = %fresh.token_type, "credential refreshed after challenge");
        let header = fresh.authorization();
        *guard = Some(fresh);
        Ok(header)
    }
}

/// A failed refresh is terminal for the request that needed it.
async fn refresh_with(refresher: &Arc<dyn TokenRefresher>, current: Option<&Credential>) -> Result<Credential> {
    refresher.refresh(current).await.map_err(|e| {
        warn!(error = %e, "credential refresh failed");
        RpcError::Auth {
            reason: format!("credential refresh failed: {}", e),
        }
    })
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("has_refresher", &self.has_refresher())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingRefresher {
        calls: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _current: Option<&Credential>) -> Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(Credential::bearer(format!("token-{}", n)).with_lifetime(Duration::from_secs(60)))
        }
    }

    fn refresher(delay: Duration) -> Arc<CountingRefresher> {
        Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            delay,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_credential_is_not_refreshed() {
        let state = AuthState::new();
        let r = refresher(Duration::ZERO);
        state.set_refresher(Some(r.clone()));
        state
            .set_credential(Some(
                Credential::bearer("abc").with_lifetime(Duration::from_secs(10)),
            ))
            .await;
        assert_eq!(state.ensure_fresh().await.unwrap().as_deref(), Some("Bearer abc"));
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credential_refreshed_once_for_concurrent_callers() {
        let state = Arc::new(AuthState::new());
        let r = refresher(Duration::from_millis(50));
        state.set_refresher(Some(r.clone()));
        state
            .set_credential(Some(
                Credential::bearer("old").with_lifetime(Duration::from_secs(1)),
            ))
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let a = tokio::spawn({
            let state = state.clone();
            async move { state.ensure_fresh().await }
        });
        let b = tokio::spawn({
            let state = state.clone();
            async move { state.ensure_fresh().await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.as_deref(), Some("Bearer token-1"));
        assert_eq!(a, b);
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_challenge_skips_refresh_when_token_changed() {
        let state = AuthState::new();
        let r = refresher(Duration::ZERO);
        state.set_refresher(Some(r.clone()));
        state.set_credential(Some(Credential::bearer("new"))).await;

        let header = state.refresh_after_challenge(Some("Bearer old")).await.unwrap();
        assert_eq!(header, "Bearer new");
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);

        let header = state.refresh_after_challenge(Some("Bearer new")).await.unwrap();
        assert_eq!(header, "Bearer token-1");
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_challenge_without_refresher_is_auth_error() {
        let state = AuthState::new();
        let err = state.refresh_after_challenge(None).await.unwrap_err();
        assert!(matches!(err, RpcError::Auth { .. }));
    }

    struct FailingRefresher;

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        async fn refresh(&self, _current: Option<&Credential>) -> Result<Credential> {
            Err(RpcError::Transport {
                reason: "token endpoint unreachable".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_is_auth_error() {
        let state = AuthState::new();
        state.set_refresher(Some(Arc::new(FailingRefresher)));
        state
            .set_credential(Some(
                Credential::bearer("old").with_lifetime(Duration::from_secs(1)),
            ))
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;

        match state.ensure_fresh().await {
            Err(RpcError::Auth { reason }) => {
                assert!(reason.starts_with("credential refresh failed"));
                assert!(reason.contains("token endpoint unreachable"));
            }
            other => panic!("expected auth error, got {:?}", other),
        }
        let err = state.refresh_after_challenge(Some("Bearer old")).await.unwrap_err();
        assert!(matches!(err, RpcError::Auth { .. }));
        assert_eq!(state.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = AuthConfig {
            token_type: Some("MAC".to_string()),
            access_token: Some("xyz".to_string()),
            ..Default::default()
        };
        let state = AuthState::from_config(&config);
        assert_eq!(state.authorization().await.as_deref(), Some("MAC xyz"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let text = format!("{:?}", Credential::bearer("secret"));
        assert!(!text.contains("secret"));
    }
}
