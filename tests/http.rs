mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chat_gateway::config::{AuthConfig, GatewayConfig, ProvidersConfig};
use chat_gateway::{app, AppState};
use common::*;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn router(server: Option<&MockServer>, codes: &[&str]) -> Router {
    let providers = match server {
        Some(s) => ProvidersConfig {
            bedrock: bedrock_config(&s.uri()),
            openai: openai_config(&s.uri()),
        },
        None => ProvidersConfig::default(),
    };
    app(AppState::new(GatewayConfig {
        auth: AuthConfig {
            access_codes: codes.iter().map(|c| c.to_string()).collect(),
        },
        providers,
    }))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [
            {"role": "system", "content": "be terse"},
            {"role": "user", "content": "hi"}
        ]
    })
}

#[tokio::test]
async fn healthz() {
    let resp = router(None, &[]).oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"ok");
}

#[tokio::test]
async fn path_off_the_allow_list_is_forbidden() {
    let resp = router(None, &["code"])
        .oneshot(post("/api/bedrock/v1/audio/speech", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["error"], true);
    assert!(body["msg"].as_str().unwrap().contains("not allowed"));

    let resp = router(None, &[]).oneshot(get("/api/gemini/v1/models")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn access_code_is_required_when_configured() {
    let resp = router(None, &["code"])
        .oneshot(get("/api/openai/v1/models"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["msg"], "missing access code");

    let req = Request::builder()
        .uri("/api/openai/v1/models")
        .header("x-api-key", "wrong")
        .body(Body::empty())
        .unwrap();
    let resp = router(None, &["code"]).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["msg"], "invalid access code");
}

#[tokio::test]
async fn disabled_backend_is_a_server_error() {
    let resp = router(None, &[])
        .oneshot(post("/api/bedrock/chat", chat_body(CLAUDE, false)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(resp).await["error"], true);
}

#[tokio::test]
async fn invalid_request_is_a_client_error() {
    let server = MockServer::start().await;
    let resp = router(Some(&server), &[])
        .oneshot(post("/api/bedrock/chat", json!({"model": CLAUDE, "messages": []})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = router(Some(&server), &[])
        .oneshot(post("/api/bedrock/chat", chat_body("gpt-4", false)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn bedrock_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/model/anthropic.claude-3-haiku/invoke"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 5, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let req = Request::builder()
        .method("POST")
        .uri("/api/bedrock/chat")
        .header(header::AUTHORIZATION, "Bearer code")
        .body(Body::from(chat_body(CLAUDE, false).to_string()))
        .unwrap();
    let resp = router(Some(&server), &["code"]).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], CLAUDE);
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(
        body["usage"],
        json!({"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6})
    );
}

#[tokio::test]
async fn openai_stream_is_reencoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(openai_sse(&["He", "llo"], "stop"), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let resp = router(Some(&server), &[])
        .oneshot(post("/api/openai/v1/chat/completions", chat_body("gpt-4o", true)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");

    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(events[3], "[DONE]");

    let chunks: Vec<Value> = events[..3]
        .iter()
        .map(|e| serde_json::from_str(e).unwrap())
        .collect();
    let deltas: Vec<_> = chunks
        .iter()
        .map(|c| c["choices"][0]["delta"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(deltas, vec!["He", "llo", ""]);
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
}

#[tokio::test]
async fn bedrock_models_and_usage_fallbacks() {
    let server = MockServer::start().await;
    let resp = router(Some(&server), &[])
        .oneshot(get("/api/bedrock/models"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"object": "list", "data": []}));

    let resp = router(Some(&server), &[])
        .oneshot(get("/api/openai/dashboard/billing/usage"))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await, json!({"used": -1.0, "total": -1.0}));
}

#[tokio::test]
async fn openai_speech_returns_audio() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"ID3audio".to_vec(), "audio/mpeg"))
        .mount(&server)
        .await;

    let resp = router(Some(&server), &[])
        .oneshot(post(
            "/api/openai/v1/audio/speech",
            json!({"model": "tts-1", "input": "hello", "voice": "alloy"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(body_bytes(resp).await, b"ID3audio");
}

#[tokio::test]
async fn metrics_are_exported() {
    let resp = router(None, &[]).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
