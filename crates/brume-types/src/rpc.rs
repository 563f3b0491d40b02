//! JSON-RPC 2.0 envelopes carried over ports.
//!
//! Requests and responses share one wire shape per message; [`RpcMessage`]
//! tells them apart by the presence of `method`. Ids are opaque and only
//! used to correlate a response with the request that caused it.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `jsonrpc` protocol marker.
pub const JSONRPC_VERSION: &str = "2.0";

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Correlation id of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
    Null,
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{n}"),
            RpcId::String(s) => write!(f, "{s}"),
            RpcId::Null => write!(f, "null"),
        }
    }
}

impl From<String> for RpcId {
    fn from(s: String) -> Self {
        RpcId::String(s)
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        RpcId::Number(n)
    }
}

/// A request before an id is assigned to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequestInit {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequestInit {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params }
    }

    /// A request without params.
    pub fn method(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Value::Null }
    }

    /// Attach an id, producing the wire request.
    pub fn with_id(self, id: RpcId) -> RpcRequest {
        RpcRequest {
            jsonrpc: jsonrpc_version(),
            id,
            method: self.method,
            params: self.params,
        }
    }

    /// Decode positional params into a tuple or struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        decode_params(&self.method, &self.params)
    }
}

/// A JSON-RPC request on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    /// Decode positional params into a tuple or struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        decode_params(&self.method, &self.params)
    }

    /// Drop the id, keeping method and params.
    pub fn to_init(&self) -> RpcRequestInit {
        RpcRequestInit { method: self.method.clone(), params: self.params.clone() }
    }
}

fn decode_params<T: DeserializeOwned>(method: &str, params: &Value) -> Result<T, RpcError> {
    serde_json::from_value(params.clone())
        .map_err(|e| RpcError::invalid_params(format!("{method}: {e}")))
}

/// Either half of a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcError),
}

/// A JSON-RPC response on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn ok(id: RpcId, result: Value) -> Self {
        Self { jsonrpc: jsonrpc_version(), id, outcome: RpcOutcome::Result(result) }
    }

    pub fn err(id: RpcId, error: RpcError) -> Self {
        Self { jsonrpc: jsonrpc_version(), id, outcome: RpcOutcome::Error(error) }
    }

    pub fn from_result(id: RpcId, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(error) => Self::err(id, error),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error(error) => Err(error),
        }
    }

    /// Decode the result into `T`, surfacing the error object otherwise.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let value = self.into_result()?;
        serde_json::from_value(value).map_err(|e| RpcError::internal(format!("bad result: {e}")))
    }
}

/// A JSON-RPC error object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const UPSTREAM_ERROR: i64 = -32000;
    pub const UNIMPLEMENTED: i64 = -32004;
    /// EIP-1193: the user rejected the request.
    pub const USER_REJECTED: i64 = 4001;
    /// EIP-1193: the requested account/method is not authorized (no user logged in).
    pub const UNAUTHORIZED: i64 = 4100;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

/// Any message received on a port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl From<RpcRequest> for RpcMessage {
    fn from(r: RpcRequest) -> Self {
        RpcMessage::Request(r)
    }
}

impl From<RpcResponse> for RpcMessage {
    fn from(r: RpcResponse) -> Self {
        RpcMessage::Response(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_discriminates_request_and_response() {
        let req: RpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": "a", "method": "brume_origin"
        }))
        .unwrap();
        assert!(matches!(req, RpcMessage::Request(ref r) if r.method == "brume_origin"));

        let res: RpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 7, "result": null
        }))
        .unwrap();
        match res {
            RpcMessage::Response(r) => {
                assert_eq!(r.id, RpcId::Number(7));
                assert_eq!(r.into_result().unwrap(), Value::Null);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let res = RpcResponse::err(RpcId::from("x".to_string()), RpcError::method_not_found("nope"));
        let value = serde_json::to_value(&res).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["error"]["code"], RpcError::METHOD_NOT_FOUND);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_null_result_is_serialized() {
        let res = RpcResponse::ok(RpcId::Number(1), Value::Null);
        let value = serde_json::to_value(&res).unwrap();
        assert!(value.as_object().unwrap().contains_key("result"));
    }

    #[test]
    fn test_params_decode_error_is_invalid_params() {
        let init = RpcRequestInit::new("brume_login", json!(["only-one"]));
        let err = init.params::<(String, String)>().unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_PARAMS);
    }
}
