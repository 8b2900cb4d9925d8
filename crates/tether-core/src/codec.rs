//! Wire codec for the JSON-RPC family of dialects.
//!
//! Two sibling dialects are supported and selected by configuration:
//!
//! - JSON-RPC 1.0: `{"method", "params", "id"}` requests; responses carry an
//!   inline `error` value which, when non-null, is the peer's error.
//! - JSON-RPC 2.0: requests add `"jsonrpc": "2.0"` and notifications omit the
//!   `id`; errors are structured `{"code", "message", "data"}` objects.
//!
//! Decoding keeps three failure classes apart: malformed payloads
//! ([`RpcError::Protocol`]), explicit peer errors ([`RpcError::Application`])
//! and null results for calls that require one ([`RpcError::EmptyResult`]).

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::call::{Outcome, Request, ResultShape};
use crate::error::{Result, RpcError};

/// JSON-RPC dialect spoken with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// JSON-RPC 1.0: `id: null` notifications, `error` objects without a version tag.
    JsonRpc1,
    /// JSON-RPC 2.0.
    #[default]
    JsonRpc2,
}

/// Encodes requests into wire payloads and decodes responses into outcomes.
pub trait WireCodec: Send + Sync + 'static {
    /// MIME type of encoded payloads.
    fn content_type(&self) -> &'static str;

    /// Encode one request as a standalone payload.
    fn encode_call(&self, request: &Request) -> Result<Vec<u8>>;

    /// Encode several requests as one batch payload.
    fn encode_batch(&self, requests: &[Request]) -> Result<Vec<u8>>;

    /// Decode the response to a standalone request. An `Err` means the
    /// payload as a whole could not be used; problems with the response
    /// item itself are reported in the inner outcome.
    fn decode_single(&self, body: &[u8], request: &Request) -> Result<Outcome>;

    /// Decode a batch response into one outcome per non-notification
    /// request, in request order. An `Err` means the payload as a whole
    /// could not be used.
    fn decode_batch(&self, body: &[u8], requests: &[Request]) -> Result<Vec<(u64, Outcome)>>;
}

/// [`WireCodec`] for JSON-RPC 1.0 and 2.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcCodec {
    dialect: Dialect,
}

impl JsonRpcCodec {
    /// Codec speaking `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        JsonRpcCodec { dialect }
    }

    /// Selected dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn request_value(&self, request: &Request) -> Value {
        let params = match &request.param_names {
            Some(names) => Value::Object(
                names
                    .iter()
                    .cloned()
                    .zip(request.args.iter().cloned())
                    .collect(),
            ),
            None => Value::Array(request.args.clone()),
        };
        let mut obj = Map::new();
        if self.dialect == Dialect::JsonRpc2 {
            obj.insert("jsonrpc".to_string(), Value::from("2.0"));
        }
        obj.insert("method".to_string(), Value::from(request.name.as_str()));
        obj.insert("params".to_string(), params);
        match (self.dialect, request.notification) {
            (Dialect::JsonRpc2, true) => {}
            (Dialect::JsonRpc1, true) => {
                obj.insert("id".to_string(), Value::Null);
            }
            (_, false) => {
                obj.insert("id".to_string(), Value::from(request.id));
            }
        }
        Value::Object(obj)
    }

    fn application_error(&self, method: &str, error: &Value) -> RpcError {
        match self.dialect {
            Dialect::JsonRpc1 => {
                let (code, message) = match error {
                    Value::String(s) => (0, s.clone()),
                    Value::Object(obj) => (
                        obj.get("code").and_then(Value::as_i64).unwrap_or(0),
                        obj.get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| error.to_string()),
                    ),
                    other => (0, other.to_string()),
                };
                RpcError::Application {
                    method: method.to_string(),
                    code,
                    message,
                    data: None,
                }
            }
            Dialect::JsonRpc2 => {
                let code = error.get("code").and_then(Value::as_i64);
                let message = error.get("message").and_then(Value::as_str);
                match (code, message) {
                    (Some(code), Some(message)) => RpcError::Application {
                        method: method.to_string(),
                        code,
                        message: message.to_string(),
                        data: error.get("data").cloned(),
                    },
                    _ => RpcError::protocol(format!(
                        "{}: malformed error object {}",
                        method, error
                    )),
                }
            }
        }
    }

    fn outcome_from(&self, response: &Map<String, Value>, request: &Request) -> Outcome {
        if self.dialect == Dialect::JsonRpc2 {
            match response.get("jsonrpc") {
                Some(Value::String(v)) if v == "2.0" => {}
                Some(other) => {
                    return Err(RpcError::protocol(format!(
                        "unexpected jsonrpc version {}",
                        other
                    )))
                }
                None => return Err(RpcError::protocol("missing jsonrpc version")),
            }
        }
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(self.application_error(&request.name, error));
        }
        let result = match response.get("result") {
            Some(result) => result,
            None => {
                return Err(RpcError::protocol(format!(
                    "{}: response has neither result nor error",
                    request.name
                )))
            }
        };
        match request.returns {
            ResultShape::Void => Ok(Value::Null),
            ResultShape::Required if result.is_null() => Err(RpcError::EmptyResult {
                method: request.name.clone(),
            }),
            _ => Ok(result.clone()),
        }
    }
}

fn response_id(response: &Map<String, Value>) -> Option<u64> {
    response.get("id").and_then(Value::as_u64)
}

impl WireCodec for JsonRpcCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_call(&self, request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.request_value(request))?)
    }

    fn encode_batch(&self, requests: &[Request]) -> Result<Vec<u8>> {
        let items: Vec<Value> = requests.iter().map(|r| self.request_value(r)).collect();
        Ok(serde_json::to_vec(&Value::Array(items))?)
    }

    fn decode_single(&self, body: &[u8], request: &Request) -> Result<Outcome> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(RpcError::protocol("empty server response"));
        }
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            RpcError::protocol(format!(
                "wrong server response ({}), is the dialect {:?} correct?",
                e, self.dialect
            ))
        })?;
        let response = value
            .as_object()
            .ok_or_else(|| RpcError::protocol("response is not a JSON object"))?;
        if let Some(id) = response_id(response) {
            if id != request.id {
                return Ok(Err(RpcError::protocol(format!(
                    "response id {} does not match request id {}",
                    id, request.id
                ))));
            }
        }
        Ok(self.outcome_from(response, request))
    }

    fn decode_batch(&self, body: &[u8], requests: &[Request]) -> Result<Vec<(u64, Outcome)>> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            RpcError::protocol(format!(
                "wrong batch response ({}), is the dialect {:?} correct?",
                e, self.dialect
            ))
        })?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(obj) => {
                // a lone error object answers the whole batch
                return match obj.get("error").filter(|e| !e.is_null()) {
                    Some(error) => Err(self.application_error("batch", error)),
                    None => Err(RpcError::protocol("batch response is not an array")),
                };
            }
            _ => return Err(RpcError::protocol("batch response is not an array")),
        };

        let mut by_id: HashMap<u64, Map<String, Value>> = HashMap::with_capacity(items.len());
        for item in items {
            match item {
                Value::Object(obj) => match response_id(&obj) {
                    Some(id) => {
                        by_id.insert(id, obj);
                    }
                    None => trace!("ignoring batch item without numeric id"),
                },
                _ => return Err(RpcError::protocol("batch item is not a JSON object")),
            }
        }

        Ok(requests
            .iter()
            .filter(|r| !r.notification)
            .map(|request| {
                let outcome = match by_id.get(&request.id) {
                    Some(response) => self.outcome_from(response, request),
                    None => Err(RpcError::protocol(format!(
                        "no response for request {} ({})",
                        request.id, request.name
                    ))),
                };
                (request.id, outcome)
            })
            .collect())
    }
}

/// Convert a decoded JSON result into a caller type.
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| RpcError::protocol(format!("result type: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallDescriptor;
    use serde_json::json;
    use std::time::Duration;

    fn request(id: u64, name: &str, args: Vec<Value>) -> Request {
        let desc = CallDescriptor::builder(name).build();
        Request::new(id, &desc, args, Duration::from_secs(1))
    }

    fn encoded(codec: &JsonRpcCodec, req: &Request) -> Value {
        serde_json::from_slice(&codec.encode_call(req).unwrap()).unwrap()
    }

    #[test]
    fn test_encode_v2_positional() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let req = request(7, "sum", vec![json!(1), json!(2)]);
        assert_eq!(
            encoded(&codec, &req),
            json!({"jsonrpc": "2.0", "method": "sum", "params": [1, 2], "id": 7})
        );
    }

    #[test]
    fn test_encode_v1_named() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc1);
        let desc = CallDescriptor::builder("login").params(["user", "pass"]).build();
        let req = Request::new(3, &desc, vec![json!("a"), json!("b")], Duration::ZERO);
        assert_eq!(
            encoded(&codec, &req),
            json!({"method": "login", "params": {"user": "a", "pass": "b"}, "id": 3})
        );
    }

    #[test]
    fn test_encode_notification_ids() {
        let desc = CallDescriptor::builder("log").notification().build();
        let req = Request::new(9, &desc, vec![], Duration::ZERO);

        let v2 = encoded(&JsonRpcCodec::new(Dialect::JsonRpc2), &req);
        assert!(v2.get("id").is_none());

        let v1 = encoded(&JsonRpcCodec::new(Dialect::JsonRpc1), &req);
        assert_eq!(v1.get("id"), Some(&Value::Null));
    }

    #[test]
    fn test_encode_batch_is_array() {
        let codec = JsonRpcCodec::default();
        let reqs = vec![request(1, "a", vec![]), request(2, "b", vec![])];
        let value: Value = serde_json::from_slice(&codec.encode_batch(&reqs).unwrap()).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["method"], "b");
    }

    #[test]
    fn test_decode_v2_success() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let req = request(1, "sum", vec![]);
        let body = br#"{"jsonrpc": "2.0", "result": 3, "id": 1}"#;
        assert_eq!(codec.decode_single(body, &req).unwrap(), Ok(json!(3)));
    }

    #[test]
    fn test_decode_v2_structured_error() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let req = request(1, "sum", vec![]);
        let body =
            br#"{"jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found", "data": {"x": 1}}, "id": 1}"#;
        match codec.decode_single(body, &req).unwrap() {
            Err(RpcError::Application {
                code,
                message,
                data,
                ..
            }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
                assert_eq!(data, Some(json!({"x": 1})));
            }
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_v2_inline_error_is_protocol_error() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let req = request(1, "sum", vec![]);
        let body = br#"{"jsonrpc": "2.0", "error": "boom", "id": 1}"#;
        assert!(matches!(
            codec.decode_single(body, &req).unwrap(),
            Err(RpcError::Protocol { .. })
        ));
    }

    #[test]
    fn test_decode_v1_inline_error() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc1);
        let req = request(1, "sum", vec![]);
        let body = br#"{"result": null, "error": "access denied", "id": 1}"#;
        match codec.decode_single(body, &req).unwrap() {
            Err(RpcError::Application { message, code, .. }) => {
                assert_eq!(message, "access denied");
                assert_eq!(code, 0);
            }
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_result() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc1);
        let req = request(1, "get", vec![]);
        let body = br#"{"result": null, "error": null, "id": 1}"#;
        assert!(matches!(
            codec.decode_single(body, &req).unwrap(),
            Err(RpcError::EmptyResult { .. })
        ));

        let desc = CallDescriptor::builder("get").allow_empty_result().build();
        let req = Request::new(1, &desc, vec![], Duration::ZERO);
        assert_eq!(codec.decode_single(body, &req).unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_decode_void_ignores_result() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let desc = CallDescriptor::builder("set")
            .returns(ResultShape::Void)
            .build();
        let req = Request::new(1, &desc, vec![], Duration::ZERO);
        let body = br#"{"jsonrpc": "2.0", "result": {"ignored": true}, "id": 1}"#;
        assert_eq!(codec.decode_single(body, &req).unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let req = request(1, "get", vec![]);
        for body in [&b"not json"[..], &b""[..], &b"  \n"[..], &b"[1]"[..]] {
            assert!(
                matches!(codec.decode_single(body, &req), Err(RpcError::Protocol { .. })),
                "body {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_decode_bad_item_is_an_outcome() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let req = request(1, "get", vec![]);
        for body in [
            &br#"{"jsonrpc": "2.0", "id": 1}"#[..],
            &br#"{"result": 1, "id": 1}"#[..],
            &br#"{"jsonrpc": "2.0", "result": 1, "id": 2}"#[..],
            &br#"{"jsonrpc": "2.0", "error": {"code": "x"}, "id": 1}"#[..],
        ] {
            assert!(
                matches!(codec.decode_single(body, &req), Ok(Err(RpcError::Protocol { .. }))),
                "body {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_decode_batch_out_of_order() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let reqs = vec![request(1, "a", vec![]), request(2, "b", vec![]), request(3, "c", vec![])];
        let body = br#"[
            {"jsonrpc": "2.0", "result": "c", "id": 3},
            {"jsonrpc": "2.0", "error": {"code": 1, "message": "bad"}, "id": 2},
            {"jsonrpc": "2.0", "result": "a", "id": 1}
        ]"#;
        let outcomes = codec.decode_batch(body, &reqs).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], (1, Ok(json!("a"))));
        assert!(matches!(outcomes[1], (2, Err(RpcError::Application { .. }))));
        assert_eq!(outcomes[2], (3, Ok(json!("c"))));
    }

    #[test]
    fn test_decode_batch_missing_item() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let reqs = vec![request(1, "a", vec![]), request(2, "b", vec![])];
        let body = br#"[{"jsonrpc": "2.0", "result": "a", "id": 1}]"#;
        let outcomes = codec.decode_batch(body, &reqs).unwrap();
        assert!(matches!(outcomes[1], (2, Err(RpcError::Protocol { .. }))));
    }

    #[test]
    fn test_decode_batch_whole_payload_errors() {
        let codec = JsonRpcCodec::new(Dialect::JsonRpc2);
        let reqs = vec![request(1, "a", vec![]), request(2, "b", vec![])];
        assert!(matches!(
            codec.decode_batch(b"{}", &reqs),
            Err(RpcError::Protocol { .. })
        ));
        assert!(matches!(
            codec.decode_batch(b"[1, 2]", &reqs),
            Err(RpcError::Protocol { .. })
        ));
        let body = br#"{"jsonrpc": "2.0", "error": {"code": -32700, "message": "Parse error"}, "id": null}"#;
        assert!(matches!(
            codec.decode_batch(body, &reqs),
            Err(RpcError::Application { code: -32700, .. })
        ));
    }

    #[test]
    fn test_decode_value_type_mismatch() {
        #[derive(Debug, Deserialize)]
        struct User {
            #[allow(dead_code)]
            name: String,
        }
        let err = decode_value::<User>(json!(5)).unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
        let ok: Vec<u32> = decode_value(json!([1, 2])).unwrap();
        assert_eq!(ok, vec![1, 2]);
    }
}
