use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::entities::{
    CanonicalChunk, CanonicalResponse, ChatMessage, ChatRequest, ContentPart, ImageSource,
    MessageContent, ModelConfig, ModelDescriptor, Role, UsageInfo, ValidationError,
};

#[derive(Debug, Deserialize)]
pub struct InboundChatRequest {
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

fn parse_role(i: usize, role: &str) -> Result<Role, ValidationError> {
    match role {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(ValidationError(format!("message {i} has unknown role '{other}'"))),
    }
}

fn parse_content(i: usize, content: Value) -> Result<MessageContent, ValidationError> {
    match content {
        Value::Null => Ok(MessageContent::Text(String::new())),
        Value::String(s) => Ok(MessageContent::Text(s)),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(ContentPart::text(text));
                        }
                    }
                    Some("image_url") => {
                        // both {"image_url": {"url": ..}} and {"image_url": ".."} occur
                        let url = item
                            .pointer("/image_url/url")
                            .or_else(|| item.get("image_url"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        parts.push(ContentPart::Image {
                            source: ImageSource::RemoteUrl(url.to_string()),
                        });
                    }
                    _ => {}
                }
            }
            Ok(MessageContent::Parts(parts))
        }
        _ => Err(ValidationError(format!(
            "message {i} content must be a string or an array of parts"
        ))),
    }
}

/// Converts the inbound wire request into the canonical model. Out-of-range
/// sampling values fall back to the defaults.
pub fn to_chat_request(req: InboundChatRequest) -> Result<ChatRequest, ValidationError> {
    let messages = req
        .messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| {
            Ok(ChatMessage {
                role: parse_role(i, &m.role)?,
                content: parse_content(i, m.content)?,
            })
        })
        .collect::<Result<Vec<_>, ValidationError>>()?;

    Ok(ChatRequest {
        messages,
        config: ModelConfig::new(
            req.model,
            req.temperature,
            req.stream.unwrap_or(false),
            req.max_tokens,
        ),
    })
}

pub fn chunk_json(id: &str, created: i64, model: &str, chunk: &CanonicalChunk) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": chunk.delta_text },
            "finish_reason": chunk.finish_reason.map(|r| r.as_str()),
        }]
    })
}

pub fn final_json(model: &str, resp: &CanonicalResponse) -> Value {
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": resp.text },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": resp.usage.prompt_tokens,
            "completion_tokens": resp.usage.completion_tokens,
            "total_tokens": resp.usage.total_tokens,
        }
    })
}

pub fn models_json(models: &[ModelDescriptor]) -> Value {
    json!({
        "object": "list",
        "data": models
            .iter()
            .map(|m| json!({"id": m.id, "object": "model", "owned_by": m.owned_by}))
            .collect::<Vec<_>>(),
    })
}

pub fn usage_json(usage: &UsageInfo) -> Value {
    json!({
        "used": usage.used.unwrap_or(-1.0),
        "total": usage.total.unwrap_or(-1.0),
    })
}

pub fn speech_content_type(format: Option<&str>) -> &'static str {
    match format {
        Some("opus") => "audio/opus",
        Some("aac") => "audio/aac",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        Some("pcm") => "audio/pcm",
        _ => "audio/mpeg",
    }
}
