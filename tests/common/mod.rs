#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chat_gateway::config::{BedrockConfig, OpenAiConfig};
use chat_gateway::core::entities::{ChatMessage, ChatRequest, ModelConfig, Role};
use chat_gateway::providers::{ChatHandler, ResponseHandle};
use chat_gateway::GatewayError;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub const CLAUDE: &str = "anthropic.claude-3-haiku";

pub fn bedrock_config(base_url: &str) -> BedrockConfig {
    BedrockConfig {
        enabled: true,
        base_url: Some(base_url.to_string()),
        api_key: Some("bedrock-key".into()),
        ..Default::default()
    }
}

pub fn openai_config(base_url: &str) -> OpenAiConfig {
    OpenAiConfig {
        enabled: true,
        base_url: Some(base_url.to_string()),
        api_key: Some("sk-test".into()),
        ..Default::default()
    }
}

pub fn request(model: &str, stream: bool, messages: Vec<ChatMessage>) -> ChatRequest {
    ChatRequest {
        messages,
        config: ModelConfig::new(model, None, stream, None),
    }
}

pub fn terse_hi(model: &str, stream: bool) -> ChatRequest {
    request(
        model,
        stream,
        vec![
            ChatMessage::new(Role::System, "be terse"),
            ChatMessage::new(Role::User, "hi"),
        ],
    )
}

/// Encodes one AWS event-stream message with string headers.
pub fn event_message(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut hbuf = Vec::new();
    for (name, value) in headers {
        hbuf.push(name.len() as u8);
        hbuf.extend_from_slice(name.as_bytes());
        hbuf.push(7);
        hbuf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        hbuf.extend_from_slice(value.as_bytes());
    }
    let total = 16 + hbuf.len() + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(hbuf.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(&out).to_be_bytes());
    out.extend_from_slice(&hbuf);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32fast::hash(&out).to_be_bytes());
    out
}

/// A Bedrock `chunk` event wrapping one Anthropic streaming event.
pub fn bedrock_chunk(event: Value) -> Vec<u8> {
    let payload = json!({ "bytes": STANDARD.encode(event.to_string()) }).to_string();
    event_message(
        &[
            (":message-type", "event"),
            (":event-type", "chunk"),
            (":content-type", "application/json"),
        ],
        payload.as_bytes(),
    )
}

/// A complete Bedrock stream producing `deltas`, then a normal stop.
pub fn bedrock_stream(deltas: &[&str]) -> Vec<u8> {
    let mut body = bedrock_chunk(json!({
        "type": "message_start",
        "message": {"role": "assistant"}
    }));
    for d in deltas {
        body.extend(bedrock_chunk(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": d}
        })));
    }
    body.extend(bedrock_chunk(json!({
        "type": "message_delta",
        "delta": {"stop_reason": "end_turn"},
        "usage": {"output_tokens": deltas.len()}
    })));
    body.extend(bedrock_chunk(json!({
        "type": "message_stop",
        "amazon-bedrock-invocationMetrics": {"inputTokenCount": 5, "outputTokenCount": deltas.len()}
    })));
    body
}

/// OpenAI chat completion chunks as an SSE body, ending with `[DONE]`.
pub fn openai_sse(deltas: &[&str], finish_reason: &str) -> String {
    let mut body = String::new();
    for d in deltas {
        let chunk = json!({
            "choices": [{"index": 0, "delta": {"content": d}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    let last = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}]});
    body.push_str(&format!("data: {last}\n\n"));
    body.push_str("data: [DONE]\n\n");
    body
}

/// Records every callback for later assertions.
#[derive(Default)]
pub struct Recorder {
    pub cancel_on_start: bool,
    pub controller: Option<CancellationToken>,
    pub updates: Vec<(String, String)>,
    pub finished: Vec<(String, ResponseHandle)>,
    pub errors: Vec<GatewayError>,
}

impl ChatHandler for Recorder {
    fn on_controller(&mut self, controller: CancellationToken) {
        if self.cancel_on_start {
            controller.cancel();
        }
        self.controller = Some(controller);
    }

    fn on_update(&mut self, accumulated: &str, delta: &str) {
        self.updates.push((accumulated.to_string(), delta.to_string()));
    }

    fn on_finish(&mut self, text: &str, response: ResponseHandle) {
        self.finished.push((text.to_string(), response));
    }

    fn on_error(&mut self, error: GatewayError) {
        self.errors.push(error);
    }
}
