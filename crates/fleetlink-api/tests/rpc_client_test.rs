#![allow(clippy::unwrap_used)]
// Integration tests for `RpcClient` and the identity probe using wiremock.

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleetlink_api::{Error, RpcClient, probe};

async fn setup() -> (MockServer, RpcClient) {
    let server = MockServer::start().await;
    let client = RpcClient::with_client(reqwest::Client::new(), &server.uri(), None).unwrap();
    (server, client)
}

// ── RPC calls ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_call_returns_result() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({
            "method": "Switch.Set",
            "params": { "id": 0, "on": true },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "src": "plus1-a8032ab12345",
            "result": { "was_on": false },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client
        .call("Switch.Set", Some(&json!({ "id": 0, "on": true })))
        .await
        .unwrap();

    assert_eq!(result, json!({ "was_on": false }));
}

#[tokio::test]
async fn test_request_ids_increase() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "id": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 2, "result": null })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "result": {} })))
        .mount(&server)
        .await;

    client.call("Shelly.GetStatus", None).await.unwrap();
    let second = client.call("Shelly.GetStatus", None).await.unwrap();
    assert_eq!(second, serde_json::Value::Null);
}

#[tokio::test]
async fn test_error_frame_maps_to_rpc_error() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "error": { "code": -114, "message": "Method Cover.Open failed: not found" },
        })))
        .mount(&server)
        .await;

    let err = client.call("Cover.Open", None).await.unwrap_err();
    match err {
        Error::Rpc { code, ref message } => {
            assert_eq!(code, -114);
            assert!(message.contains("not found"));
        }
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client.call("Sys.GetConfig", None).await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(!err.is_connection_error());
}

// ── Identity probe ──────────────────────────────────────────────────

#[tokio::test]
async fn test_probe_detects_legacy_device() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shelly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "SHSW-25",
            "mac": "A4CF12F45431",
            "auth": false,
        })))
        .mount(&server)
        .await;

    let identity = probe::identify(&reqwest::Client::new(), &server.uri())
        .await
        .unwrap();

    assert!(identity.is_gen1());
    assert_eq!(identity.mac.as_deref(), Some("A4CF12F45431"));
}

#[tokio::test]
async fn test_probe_detects_rpc_device() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shelly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pro4pm-c8f09e8a1b2c",
            "model": "SPSW-104PE16EU",
            "gen": 2,
            "auth_en": true,
        })))
        .mount(&server)
        .await;

    let identity = probe::identify(&reqwest::Client::new(), &server.uri())
        .await
        .unwrap();

    assert_eq!(identity.generation, 2);
    assert!(identity.auth_required);
}

#[tokio::test]
async fn test_probe_rejects_missing_endpoint() {
    let server = MockServer::start().await;

    let result = probe::identify(&reqwest::Client::new(), &server.uri()).await;
    tokio_test::assert_err!(&result);
    assert!(matches!(result, Err(Error::LegacyApi { status: 404, .. })));
}
