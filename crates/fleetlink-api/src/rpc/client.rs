// JSON-RPC HTTP client for generation-2+ devices.
//
// Every call is a POST of a `{id, src, method, params}` frame to `/rpc`.
// The device answers with `{id, result}` or `{id, error: {code, message}}`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use super::types::{RpcRequest, RpcResponse};
use crate::auth::Credentials;
use crate::error::Error;
use crate::transport::{TransportConfig, device_base_url};

/// Source tag sent with every request so device logs can attribute calls.
const RPC_SOURCE: &str = "fleetlink";

/// Async client for a JSON-RPC device.
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: Url,
    credentials: Option<Credentials>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Build a client for the device at `address`.
    pub fn new(
        address: &str,
        credentials: Option<Credentials>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Self::with_client(http, address, credentials)
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        address: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, Error> {
        let endpoint = device_base_url(address)?.join("rpc")?;
        Ok(Self {
            http,
            endpoint,
            credentials,
            next_id: AtomicU64::new(1),
        })
    }

    /// The `/rpc` endpoint URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Invoke `method` with optional `params` and return the raw `result`.
    pub async fn call(&self, method: &str, params: Option<&Value>) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RpcRequest {
            id,
            src: RPC_SOURCE,
            method,
            params,
        };
        debug!(id, method, "POST {}", self.endpoint);

        let mut builder = self.http.post(self.endpoint.clone()).json(&frame);
        if let Some(ref creds) = self.credentials {
            builder = creds.apply(builder);
        }
        let resp = builder.send().await.map_err(Error::Transport)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: format!("{method}: device requires credentials (HTTP 401)"),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        let parsed: RpcResponse = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (status {status}, body preview: {preview:?})"),
                body: body.clone(),
            }
        })?;

        if parsed.id.is_some_and(|rid| rid != id) {
            trace!(sent = id, received = ?parsed.id, "RPC response id mismatch");
        }

        if let Some(err) = parsed.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}
