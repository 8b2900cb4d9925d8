//! In-memory JSON-RPC 2.0 server used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tether_core::{HttpRequest, HttpResponse, Result, Transport};

/// Computes the result of one method call, or a `(code, message)` error.
pub type Handler = Arc<dyn Fn(&str, &Value) -> std::result::Result<Value, (i64, String)> + Send + Sync>;

/// Scripted server answering JSON-RPC 2.0 payloads.
///
/// Batch responses are returned in reverse order so the client has to
/// correlate them by id.
pub struct MockServer {
    handler: Handler,
    sends: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
    headers: Mutex<Vec<Vec<(String, String)>>>,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    required_token: Mutex<Option<String>>,
    replies: Mutex<HashMap<String, Value>>,
    etags: Mutex<HashMap<String, String>>,
}

impl MockServer {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> std::result::Result<Value, (i64, String)> + Send + Sync + 'static,
    {
        Arc::new(MockServer {
            handler: Arc::new(handler),
            sends: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            required_token: Mutex::new(None),
            replies: Mutex::new(HashMap::new()),
            etags: Mutex::new(HashMap::new()),
        })
    }

    /// Server that echoes `params` back for every method except `sum`, which
    /// adds its positional arguments.
    pub fn echo() -> Arc<Self> {
        Self::new(|method, params| match method {
            "sum" => Ok(json!(params
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).sum::<i64>())
                .unwrap_or(0))),
            "missing" => Err((-32601, "Method not found".to_string())),
            _ => Ok(params.clone()),
        })
    }

    /// Delay every payload that contains `method`.
    pub fn delay(&self, method: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(method.to_string(), delay);
    }

    /// Answer HTTP 500 to every payload that contains `method`.
    pub fn fail(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    /// Require `Authorization: Bearer <token>`.
    pub fn require_token(&self, token: &str) {
        *self.required_token.lock().unwrap() = Some(format!("Bearer {}", token));
    }

    /// Answer `method` with `reply` as-is; only the `id` is filled in.
    pub fn reply_with(&self, method: &str, reply: Value) {
        self.replies.lock().unwrap().insert(method.to_string(), reply);
    }

    /// Tag single-call responses for `method` with `etag` and answer
    /// `304 Not Modified` when the client already holds it.
    pub fn etag(&self, method: &str, etag: &str) {
        self.etags.lock().unwrap().insert(method.to_string(), etag.to_string());
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn headers(&self) -> Vec<Vec<(String, String)>> {
        self.headers.lock().unwrap().clone()
    }

    fn answer(&self, item: &Value) -> Option<Value> {
        let id = item.get("id").filter(|id| !id.is_null())?.clone();
        let method = item.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = item.get("params").cloned().unwrap_or(Value::Null);
        if let Some(mut reply) = self.replies.lock().unwrap().get(method).cloned() {
            reply["id"] = id;
            return Some(reply);
        }
        Some(match (self.handler)(method, &params) {
            Ok(result) => json!({"jsonrpc": "2.0", "result": result, "id": id}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "error": {"code": code, "message": message}, "id": id})
            }
        })
    }
}

fn methods(payload: &Value) -> Vec<String> {
    let items = match payload {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    items
        .iter()
        .filter_map(|i| i.get("method").and_then(Value::as_str).map(str::to_string))
        .collect()
}

#[async_trait]
impl Transport for MockServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let payload: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        self.payloads.lock().unwrap().push(payload.clone());
        self.headers.lock().unwrap().push(request.headers.clone());

        let names = methods(&payload);
        let delay = {
            let delays = self.delays.lock().unwrap();
            names.iter().filter_map(|m| delays.get(m).copied()).max()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let required = self.required_token.lock().unwrap().clone();
        if let Some(required) = required {
            if request.header("authorization") != Some(required.as_str()) {
                return Ok(HttpResponse {
                    status: 401,
                    headers: vec![("WWW-Authenticate".to_string(), "Bearer realm=\"rpc\"".to_string())],
                    body: Bytes::new(),
                });
            }
        }

        let failing = {
            let failing = self.failing.lock().unwrap();
            names.iter().any(|m| failing.contains(m))
        };
        if failing {
            return Ok(HttpResponse {
                status: 500,
                headers: Vec::new(),
                body: Bytes::from_static(b"internal error"),
            });
        }

        let etag = match (&payload, names.as_slice()) {
            (Value::Object(_), [method]) => self.etags.lock().unwrap().get(method).cloned(),
            _ => None,
        };
        if let Some(etag) = &etag {
            if request.header("if-none-match") == Some(etag.as_str()) {
                return Ok(HttpResponse {
                    status: 304,
                    headers: Vec::new(),
                    body: Bytes::new(),
                });
            }
        }

        let body = match &payload {
            Value::Array(items) => {
                let mut answers: Vec<Value> = items.iter().filter_map(|i| self.answer(i)).collect();
                answers.reverse();
                serde_json::to_vec(&answers).unwrap_or_default()
            }
            item => match self.answer(item) {
                Some(answer) => serde_json::to_vec(&answer).unwrap_or_default(),
                None => Vec::new(),
            },
        };
        let mut response = HttpResponse::ok(body);
        if let Some(etag) = etag {
            response.headers.push(("ETag".to_string(), etag));
        }
        Ok(response)
    }
}

/// Consumer recording every task-handle event as text.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl tether_core::TaskConsumer for Recorder {
    fn on_progress(&self, percent: u8) {
        self.events.lock().unwrap().push(format!("progress {}", percent));
    }

    fn on_success(&self, value: Value) {
        self.events.lock().unwrap().push(format!("ok {}", value));
    }

    fn on_error(&self, error: tether_core::RpcError) {
        self.events.lock().unwrap().push(format!("err {}", error));
    }
}
