use std::time::Duration;

use futures::StreamExt;
use gateway_core::config::GatewayConfig;
use gateway_core::server::{build_router, AppState};
use serde_json::{json, Value};
use tokio::time::timeout;

fn sandbox_config() -> GatewayConfig {
    GatewayConfig {
        enable_app_id: None,
        enable_private_key_path: None,
        enable_env: gateway_core::config::EnableEnv::Sandbox,
        aspsp_id: None,
        aspsp_country: None,
        oauth_redirect_url: None,
        oauth_issuer: None,
        host: "127.0.0.1".into(),
        port: 0,
        enable_base_url: None,
    }
}

/// Spins up the full router on an ephemeral port and returns its base URL.
/// The server task is detached; it dies with the test process.
async fn spawn_gateway() -> String {
    let state = AppState::new(sandbox_config());
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn initialize(client: &reqwest::Client, base: &str) -> (String, Value) {
    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/mcp"))
            .header("content-type", "application/json")
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2025-06-18", "clientInfo": { "name": "test-client" } }
            }))
            .send(),
    )
    .await
    .expect("initialize timed out")
    .unwrap();

    let session_id = resp
        .headers()
        .get("mcp-session-id")
        .expect("initialize must return Mcp-Session-Id")
        .to_str()
        .unwrap()
        .to_string();
    let body: Value = resp.json().await.unwrap();
    (session_id, body)
}

#[tokio::test]
async fn unauthenticated_tools_list_returns_the_catalogue() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/mcp"))
            .header("content-type", "application/json")
            .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }))
            .send(),
    )
    .await
    .expect("tools/list timed out")
    .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let tools = body["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "echo"));
    assert!(tools.iter().any(|t| t["name"] == "search"));
}

#[tokio::test]
async fn protected_tool_without_bearer_is_unauthorized() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/mcp"))
            .header("content-type", "application/json")
            .json(&json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": { "name": "search", "arguments": {} }
            }))
            .send(),
    )
    .await
    .expect("tools/call timed out")
    .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);
}

#[tokio::test]
async fn echo_tool_works_without_any_auth() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/mcp"))
            .header("content-type", "application/json")
            .json(&json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": { "name": "echo", "arguments": { "message": "hi there" } }
            }))
            .send(),
    )
    .await
    .expect("tools/call timed out")
    .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "hi there");
}

#[tokio::test]
async fn dynamic_client_registration_returns_a_usable_client() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/oauth/register"))
            .json(&json!({ "redirect_uris": ["https://claude.ai/api/mcp/auth_callback"] }))
            .send(),
    )
    .await
    .expect("register timed out")
    .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert!(body["client_id"].as_str().unwrap().starts_with("client_"));
    assert_eq!(body["token_endpoint_auth_method"], "client_secret_post");
}

/// Sandbox mode lets `authorization_code` grants through even for a code that
/// never existed in the store, auto-registering a client on the fly -- this
/// is how local tooling bootstraps a token without driving a real browser
/// through the Enable Banking consent screen.
#[tokio::test]
async fn sandbox_authorization_code_grant_issues_a_token_pair() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/oauth/token"))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", "sandbox-code"),
                ("client_id", "sandbox-client"),
                ("redirect_uri", "http://127.0.0.1/callback"),
            ])
            .send(),
    )
    .await
    .expect("token request timed out")
    .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let access_token = body["access_token"].as_str().unwrap().to_string();
    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();
    assert_eq!(body["token_type"], "Bearer");

    // A tool call with this access token still 401s: sandbox tokens are
    // issued with empty `extra` until an Enable Banking consent is linked.
    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/mcp"))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {access_token}"))
            .json(&json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": { "name": "search", "arguments": {} }
            }))
            .send(),
    )
    .await
    .expect("tools/call timed out")
    .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Refresh token rotation still works independent of that.
    let resp = timeout(
        Duration::from_secs(5),
        client
            .post(format!("{base}/oauth/token"))
            .form(&[("grant_type", "refresh_token"), ("refresh_token", &refresh_token)])
            .send(),
    )
    .await
    .expect("refresh timed out")
    .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["access_token"].as_str().unwrap() != access_token);
}

#[tokio::test]
async fn revoke_is_idempotent_over_http() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/oauth/revoke"))
        .form(&[("token", "never-issued")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn initialize_then_sse_stream_emits_connected_then_heartbeat() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let (session_id, init_body) = initialize(&client, &base).await;
    assert_eq!(init_body["result"]["protocolVersion"], "2025-06-18");

    let resp = timeout(
        Duration::from_secs(5),
        client
            .get(format!("{base}/mcp"))
            .header("mcp-session-id", &session_id)
            .send(),
    )
    .await
    .expect("sse connect timed out")
    .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );

    let mut stream = resp.bytes_stream();
    let mut collected = String::new();
    // Pull bytes until we have both a connected and a heartbeat frame, or
    // time out -- the heartbeat fires on a 1s idle timeout.
    let result = timeout(Duration::from_secs(3), async {
        while !collected.contains("event: heartbeat") {
            match stream.next().await {
                Some(Ok(chunk)) => collected.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
    })
    .await;

    assert!(result.is_ok(), "never observed a heartbeat frame: {collected:?}");
    assert!(collected.contains("event: connected"));
    assert!(collected.contains(&session_id));
    assert!(collected.contains("event: heartbeat"));
}

#[tokio::test]
async fn ping_replies_with_an_empty_object() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let (session_id, _) = initialize(&client, &base).await;

    let resp = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .header("mcp-session-id", &session_id)
        .json(&json!({ "jsonrpc": "2.0", "id": 42, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], json!({}));
    assert_eq!(body["id"], 42);
}

#[tokio::test]
async fn ping_without_a_session_is_rejected_with_400() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .json(&json!({ "jsonrpc": "2.0", "id": 42, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn notifications_get_a_202_and_no_body_processing() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .json(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
}

#[tokio::test]
async fn disallowed_origin_is_rejected_with_403() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .header("origin", "https://evil.example.com")
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn health_check_reports_ok() {
    let base = spawn_gateway().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
