//! Wire shapes for the duplex line-delimited JSON-RPC transport: a
//! standard JSON-RPC 2.0 envelope, `{jsonrpc, method, params, id}` in,
//! `{jsonrpc, result|error, id}` out, with request/response `id`s
//! type-matched so a caller can always line up its own request with the
//! response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound line. `id` is `None` for notifications (client-sent
/// `exec_pipe.stdin`, `exec_tty.resize`, …); methods that expect a result
/// require a numeric `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcRequest {
    /// `id` narrowed to the numeric form every call-expecting-a-result
    /// method requires. `Some(None)` would mean "present but not
    /// numeric"; we fold that into plain `None` since both cases reject
    /// identically at the dispatch boundary.
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    /// True when the `id` field was present but not a bare JSON integer
    /// (a string, float, object, array, or null) — the "non-numeric"
    /// half of the invalid-request rule.
    pub fn has_non_numeric_id(&self) -> bool {
        matches!(&self.id, Some(v) if v.as_i64().is_none())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Option<i64>,
}

impl RpcResponse {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(id: Option<i64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outbound message carrying either a response to a request or an
/// unprompted notification (`exec_stream.stdout`, `event`, …); both share
/// the serial writer, so both are modeled as one enum that serializes to
/// the right JSON shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

impl From<RpcResponse> for OutboundMessage {
    fn from(r: RpcResponse) -> Self {
        OutboundMessage::Response(r)
    }
}

impl From<RpcNotification> for OutboundMessage {
    fn from(n: RpcNotification) -> Self {
        OutboundMessage::Notification(n)
    }
}
