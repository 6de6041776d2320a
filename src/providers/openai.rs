use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures_util::StreamExt;
use regex::Regex;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::OpenAiConfig;
use crate::core::entities::{
    CanonicalResponse, ChatMessage, ChatRequest, ContentPart, FinishReason, ImageSource,
    MessageContent, ModelDescriptor, SpeechOptions, TokenUsage, UsageInfo,
};
use crate::error::GatewayError;
use crate::metrics::{REQUEST_DURATION, TOKENS_TOTAL};
use crate::normalize::{validate_images, ContentNormalizer};
use crate::providers::{
    check_model, compile_model_pattern, Provider, ProviderKind, ProviderResponse,
};
use crate::transcoder::{transcode, EventDecoder, NativeEvent, ReleaseGuard};

pub const NAME: &str = "openai";
pub const DEFAULT_MODEL_PATTERN: &str = r"^(?:gpt-|chatgpt-|o\d)";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model_pattern: Regex,
}

impl OpenAiProvider {
    pub fn from_config(cfg: &OpenAiConfig) -> Result<Self, GatewayError> {
        if !cfg.enabled {
            return Err(GatewayError::Configuration("openai is not enabled".into()));
        }
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GatewayError::Configuration("openai API key not configured".into()))?;
        let base_url = cfg
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let model_pattern =
            compile_model_pattern(NAME, cfg.model_pattern.as_deref(), DEFAULT_MODEL_PATTERN)?;
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        tracing::debug!(base_url = %base_url, "openai provider constructed");
        Ok(Self {
            client,
            api_key,
            base_url,
            model_pattern,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
    }

    async fn execute(
        &self,
        rb: RequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, GatewayError> {
        let send = rb.send();
        let resp = match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                resp = send => resp,
            },
            None => send.await,
        }
        .map_err(|e| GatewayError::upstream(NAME, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "openai returned an error status");
            return Err(GatewayError::Upstream {
                provider: NAME,
                message: format!("status {status}"),
                body: Some(text),
            });
        }
        Ok(resp)
    }

    /// Builds the chat completions body. `http(s)` images are forwarded as
    /// URLs; `data:` images are decoded and re-encoded, others are dropped.
    pub fn build_payload(req: &ChatRequest) -> Result<Value, GatewayError> {
        let (system, messages) = req.split_system();
        let messages = ContentNormalizer::normalize_messages_local(messages);
        validate_images(&messages)?;

        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            out.push(json!({"role": "system", "content": system}));
        }
        out.extend(messages.iter().map(message_json));

        Ok(json!({
            "model": req.config.model,
            "messages": out,
            "stream": req.config.stream,
            "temperature": req.config.temperature,
            "max_tokens": req.config.max_tokens,
        }))
    }
}

fn message_json(m: &ChatMessage) -> Value {
    let content = match &m.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let parts: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image {
                        source: ImageSource::RemoteUrl(url),
                    } => json!({"type": "image_url", "image_url": {"url": url}}),
                    ContentPart::Image {
                        source: ImageSource::InlineData { mime_type, bytes },
                    } => {
                        let url = format!("data:{mime_type};base64,{}", STANDARD.encode(bytes));
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect();
            if parts.is_empty() {
                json!([{"type": "text", "text": ""}])
            } else {
                json!(parts)
            }
        }
    };
    json!({"role": m.role.as_str(), "content": content})
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "length" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Parses a non-streaming chat completion.
pub fn parse_response(raw: &str) -> Result<CanonicalResponse, GatewayError> {
    let v: Value = serde_json::from_str(raw).map_err(|e| {
        GatewayError::protocol(NAME, format!("invalid JSON: {e}"), Some(raw.into()))
    })?;
    let choice = v
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| {
            GatewayError::protocol(NAME, "missing or empty choices", Some(raw.into()))
        })?;
    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let usage = v.get("usage");
    let count = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_i64);
    Ok(CanonicalResponse {
        text,
        usage: TokenUsage::from_counts(
            count("prompt_tokens"),
            count("completion_tokens"),
            count("total_tokens"),
        ),
    })
}

/// Decodes chat completion chunks delivered as server-sent events.
#[derive(Debug, Default)]
pub struct OpenAiEventDecoder {
    finish_reason: Option<FinishReason>,
}

impl EventDecoder for OpenAiEventDecoder {
    type Frame = Event;

    fn decode(&mut self, event: Event) -> Option<NativeEvent> {
        let data = event.data.trim();
        if data == "[DONE]" {
            return Some(NativeEvent::Stop {
                reason: Some(self.finish_reason.unwrap_or(FinishReason::Stop)),
                output_tokens: None,
            });
        }
        let v: Value = serde_json::from_str(data).ok()?;
        if let Some(err) = v.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| err.to_string());
            return Some(NativeEvent::Failure(message));
        }
        // Usage-only chunks carry an empty `choices` array.
        let Some(choice) = v.pointer("/choices/0") else {
            return Some(NativeEvent::Ignored);
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(finish_reason(reason));
        }
        match choice.pointer("/delta/content").and_then(Value::as_str) {
            Some(text) => Some(NativeEvent::Delta(text.to_string())),
            None => Some(NativeEvent::Ignored),
        }
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn invoke(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, GatewayError> {
        req.validate()?;
        check_model(NAME, &self.model_pattern, &req.config.model)?;
        let body = Self::build_payload(&req)?;
        let stream = req.config.stream;

        let started = Instant::now();
        let rb = self
            .request(Method::POST, "/v1/chat/completions")
            .header(
                header::ACCEPT,
                if stream { "text/event-stream" } else { "application/json" },
            )
            .json(&body);
        let resp = self.execute(rb, Some(&cancel)).await?;
        REQUEST_DURATION
            .with_label_values(&[NAME, if stream { "true" } else { "false" }])
            .observe(started.elapsed().as_secs_f64());

        if stream {
            let frames = resp
                .bytes_stream()
                .eventsource()
                .map(|r| r.map_err(|e| GatewayError::upstream(NAME, e)));
            let release =
                ReleaseGuard::new(|| tracing::debug!(provider = NAME, "transport released"));
            return Ok(ProviderResponse::Streaming(transcode(
                NAME,
                frames,
                OpenAiEventDecoder::default(),
                cancel,
                release,
            )));
        }

        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            raw = resp.text() => raw.map_err(|e| GatewayError::upstream(NAME, e))?,
        };
        let parsed = parse_response(&raw)?;
        for (kind, n) in [
            ("prompt", parsed.usage.prompt_tokens),
            ("completion", parsed.usage.completion_tokens),
        ] {
            if n >= 0 {
                TOKENS_TOTAL.with_label_values(&[NAME, kind]).inc_by(n as u64);
            }
        }
        Ok(ProviderResponse::Complete(parsed))
    }

    async fn models(&self) -> Result<Vec<ModelDescriptor>, GatewayError> {
        let resp = self.execute(self.request(Method::GET, "/v1/models"), None).await?;
        let raw = resp.text().await.map_err(|e| GatewayError::upstream(NAME, e))?;
        let v: Value = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::protocol(NAME, format!("invalid JSON: {e}"), Some(raw.clone()))
        })?;
        let data = v
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::protocol(NAME, "missing model list", Some(raw.clone())))?;
        Ok(data
            .iter()
            .filter_map(|m| {
                Some(ModelDescriptor {
                    id: m.get("id")?.as_str()?.to_string(),
                    owned_by: m
                        .get("owned_by")
                        .and_then(Value::as_str)
                        .unwrap_or(NAME)
                        .to_string(),
                })
            })
            .collect())
    }

    async fn usage(&self) -> Result<UsageInfo, GatewayError> {
        Ok(UsageInfo::unknown())
    }

    async fn speech(&self, options: SpeechOptions) -> Result<Bytes, GatewayError> {
        let mut body = json!({
            "model": options.model,
            "input": options.input,
            "voice": options.voice,
        });
        if let Some(format) = options.response_format {
            body["response_format"] = json!(format);
        }
        if let Some(speed) = options.speed {
            body["speed"] = json!(speed);
        }
        let rb = self.request(Method::POST, "/v1/audio/speech").json(&body);
        let resp = self.execute(rb, None).await?;
        resp.bytes().await.map_err(|e| GatewayError::upstream(NAME, e))
    }
}
