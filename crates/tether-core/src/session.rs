//! Authenticated exchange of one encoded payload with the server.
//!
//! A [`TransportSession`] wraps a [`Transport`] with everything a single
//! exchange needs beyond moving bytes: header injection, the preemptive
//! credential refresh, one resend after a bearer or digest challenge, the
//! deadline, and cancellation. Phase timings are recorded into the caller's
//! [`TimeStat`].
//!
//! Once a digest challenge has been answered it is remembered and later
//! requests carry a fresh digest response up front. A request may also be
//! conditional on a cached [`Validator`], in which case `304 Not Modified`
//! is handed back as a valid response.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::auth::AuthState;
use crate::cache::Validator;
use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::digest::{request_uri, DigestAuth, DigestChallenge};
use crate::error::{Result, RpcError};
use crate::metrics::ClientMetrics;
use crate::timing::{Phase, TimeStat};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// `304 Not Modified`
pub const NOT_MODIFIED: u16 = 304;
const UNAUTHORIZED: u16 = 401;
const MAX_STATUS_MESSAGE: usize = 256;

/// One client's view of the server endpoint.
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    auth: Arc<AuthState>,
    digest: Option<DigestAuth>,
    /// Last digest challenge answered successfully.
    challenge: Mutex<Option<DigestChallenge>>,
    metrics: Arc<ClientMetrics>,
    endpoint: String,
    content_type: String,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
}

impl TransportSession {
    /// Session posting to the configured endpoint; digest auth is enabled when a username and password are set.
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<AuthState>,
        metrics: Arc<ClientMetrics>,
        content_type: &str,
    ) -> Self {
        let digest = match (&config.auth.username, &config.auth.password) {
            (Some(user), Some(pass)) => Some(DigestAuth::new(user.clone(), pass.clone())),
            _ => None,
        };
        TransportSession {
            transport,
            auth,
            digest,
            challenge: Mutex::new(None),
            metrics,
            endpoint: config.endpoint.clone(),
            content_type: content_type.to_string(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }

    /// Server URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn lock_challenge(&self) -> MutexGuard<'_, Option<DigestChallenge>> {
        self.challenge.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build(
        &self,
        body: Bytes,
        authorization: Option<String>,
        condition: Option<&Validator>,
        timeout: Duration,
    ) -> HttpRequest {
        let mut headers = Vec::with_capacity(self.headers.len() + 4);
        headers.push(("Content-Type".to_string(), self.content_type.clone()));
        headers.push(("Accept".to_string(), self.content_type.clone()));
        if let Some(value) = authorization {
            headers.push(("Authorization".to_string(), value));
        }
        if let Some(validator) = condition {
            let (name, value) = validator.condition();
            headers.push((name.to_string(), value.to_string()));
        }
        headers.extend(self.headers.iter().cloned());
        HttpRequest {
            url: self.endpoint.clone(),
            headers,
            body,
            timeout,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Send `body` and return the successful response.
    ///
    /// A zero `timeout` means no deadline. The exchange is abandoned with
    /// [`RpcError::Cancelled`] as soon as `cancel` fires.
    pub async fn send(
        &self,
        body: Bytes,
        timeout: Duration,
        cancel: Option<&CancelToken>,
        stat: &mut TimeStat,
    ) -> Result<HttpResponse> {
        self.send_conditional(body, timeout, cancel, None, stat).await
    }

    /// [`TransportSession::send`] made conditional on `condition`; a
    /// [`NOT_MODIFIED`] response is returned as success.
    pub async fn send_conditional(
        &self,
        body: Bytes,
        timeout: Duration,
        cancel: Option<&CancelToken>,
        condition: Option<&Validator>,
        stat: &mut TimeStat,
    ) -> Result<HttpResponse> {
        let exchange = async {
            if timeout.is_zero() {
                self.exchange(body, timeout, condition, stat).await
            } else {
                match tokio::time::timeout(timeout, self.exchange(body, timeout, condition, stat)).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };
        match cancel {
            Some(token) => tokio::select! {
                result = exchange => result,
                reason = token.cancelled() => {
                    debug!(endpoint = %self.endpoint, %reason, "exchange cancelled");
                    Err(RpcError::Cancelled { reason })
                }
            },
            None => exchange.await,
        }
    }

    async fn exchange(
        &self,
        body: Bytes,
        timeout: Duration,
        condition: Option<&Validator>,
        stat: &mut TimeStat,
    ) -> Result<HttpResponse> {
        self.metrics.add_bytes_sent(body.len() as u64);
        stat.mark(Phase::Create);

        let bearer = self.auth.ensure_fresh().await?;
        let authorization = match self.preemptive_digest()? {
            Some(digest) => Some(digest),
            None => bearer.clone(),
        };
        stat.mark(Phase::Connect);

        let request = self.build(body.clone(), authorization, condition, timeout);
        let mut response = self.transport.send(request).await?;
        stat.mark(Phase::Send);

        if response.status == UNAUTHORIZED {
            let retry_authorization = self.answer_challenge(&response, bearer.as_deref()).await?;
            self.metrics.inc_challenge_resends();
            info!(endpoint = %self.endpoint, "resending after authentication challenge");
            response = self
                .transport
                .send(self.build(body, Some(retry_authorization), condition, timeout))
                .await?;
            if response.status == UNAUTHORIZED {
                *self.lock_challenge() = None;
                return Err(RpcError::Auth {
                    reason: "credentials rejected after challenge".to_string(),
                });
            }
        }

        self.metrics.add_bytes_received(response.body.len() as u64);
        let not_modified = condition.is_some() && response.status == NOT_MODIFIED;
        if !response.is_success() && !not_modified {
            let text = String::from_utf8_lossy(&response.body);
            let message: String = text.chars().take(MAX_STATUS_MESSAGE).collect();
            return Err(RpcError::HttpStatus {
                status: response.status,
                message,
            });
        }
        stat.mark(Phase::Read);
        trace!(status = response.status, bytes = response.body.len(), "response read");
        Ok(response)
    }

    /// Digest response for the remembered challenge, if there is one.
    fn preemptive_digest(&self) -> Result<Option<String>> {
        let Some(digest) = &self.digest else {
            return Ok(None);
        };
        let challenge = self.lock_challenge().clone();
        match challenge {
            Some(challenge) => {
                trace!(realm = %challenge.realm, "reusing digest challenge");
                digest
                    .authorization(&challenge, "POST", request_uri(&self.endpoint))
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    async fn answer_challenge(&self, response: &HttpResponse, sent: Option<&str>) -> Result<String> {
        let challenge = response
            .header("WWW-Authenticate")
            .and_then(DigestChallenge::parse);
        match (challenge, &self.digest) {
            (Some(challenge), Some(digest)) => {
                debug!(realm = %challenge.realm, "answering digest challenge");
                let header = digest.authorization(&challenge, "POST", request_uri(&self.endpoint))?;
                *self.lock_challenge() = Some(challenge);
                Ok(header)
            }
            _ => self.auth.refresh_after_challenge(sent).await,
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("endpoint", &self.endpoint)
            .field("digest", &self.digest.is_some())
            .finish()
    }
}
