// JSON-RPC frame shapes used on the `/rpc` endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing request frame.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub id: u64,
    pub src: &'a str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

/// Response frame: exactly one of `result` / `error` is expected.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}
