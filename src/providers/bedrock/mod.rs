//! Anthropic Claude models served by AWS Bedrock.

use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::{header, Client, Url};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

pub mod eventstream;
pub mod sigv4;

use self::eventstream::{EventMessage, EventStreamCodec};
use self::sigv4::{Credentials, SignableRequest, SigningParams};
use crate::config::BedrockConfig;
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

pub const NAME: &str = "bedrock";
pub const DEFAULT_MODEL_PATTERN: &str = r"^(?:(?:us|eu|apac|global)\.)?anthropic\.claude";
const DEFAULT_REGION: &str = "us-east-1";
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const SERVICE: &str = "bedrock";
const METRICS_KEY: &str = "amazon-bedrock-invocationMetrics";

enum BedrockAuth {
    ApiKey(String),
    SigV4(Credentials),
}

pub struct BedrockProvider {
    client: Client,
    base_url: Url,
    region: String,
    auth: BedrockAuth,
    model_pattern: Regex,
}

impl BedrockProvider {
    pub fn from_config(cfg: &BedrockConfig) -> Result<Self, GatewayError> {
        if !cfg.enabled {
            return Err(GatewayError::Configuration("bedrock is not enabled".into()));
        }
        let auth = match (&cfg.api_key, &cfg.access_key_id, &cfg.secret_access_key) {
            (Some(key), _, _) => BedrockAuth::ApiKey(key.clone()),
            (None, Some(id), Some(secret)) => BedrockAuth::SigV4(Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: cfg.session_token.clone(),
            }),
            _ => {
                return Err(GatewayError::Configuration(
                    "bedrock requires an API key or an access key id and secret".into(),
                ))
            }
        };
        let region = cfg.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());
        let base = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        let base_url = Url::parse(base.trim_end_matches('/')).map_err(|e| {
            GatewayError::Configuration(format!("bedrock: invalid base URL '{base}': {e}"))
        })?;
        let model_pattern =
            compile_model_pattern(NAME, cfg.model_pattern.as_deref(), DEFAULT_MODEL_PATTERN)?;
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        tracing::debug!(region = %region, base_url = %base_url, "bedrock provider constructed");
        Ok(Self {
            client,
            base_url,
            region,
            auth,
            model_pattern,
        })
    }

    /// Builds the native invoke body. Image parts are fetched and inlined.
    pub async fn build_payload(&self, req: &ChatRequest) -> Result<Value, GatewayError> {
        let (system, messages) = req.split_system();
        let normalizer = ContentNormalizer::new(self.client.clone());
        let messages = normalizer.normalize_messages(messages).await;
        validate_images(&messages)?;

        let mut body = json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": req.config.max_tokens,
            "temperature": req.config.temperature,
            "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        Ok(body)
    }

    fn invoke_url(&self, model: &str, stream: bool) -> Result<Url, GatewayError> {
        let action = if stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        let prefix = self.base_url.path().trim_end_matches('/');
        let path = format!("{prefix}/model/{}/{action}", sigv4::uri_encode(model));
        let mut url = self.base_url.clone();
        url.set_path(&path);
        Ok(url)
    }

    async fn send(
        &self,
        url: Url,
        accept: &str,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut rb = self
            .client
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, accept);

        match &self.auth {
            BedrockAuth::ApiKey(key) => rb = rb.bearer_auth(key),
            BedrockAuth::SigV4(credentials) => {
                let host = match (url.host_str(), url.port()) {
                    (Some(h), Some(p)) => format!("{h}:{p}"),
                    (Some(h), None) => h.to_string(),
                    (None, _) => {
                        return Err(GatewayError::Configuration(format!(
                            "bedrock: URL without host: {url}"
                        )))
                    }
                };
                let signed = sigv4::sign(
                    &SignableRequest {
                        method: "POST",
                        host: &host,
                        path: url.path(),
                        query: url.query().unwrap_or(""),
                        headers: &[("content-type", "application/json")],
                        payload: &body,
                    },
                    &SigningParams {
                        credentials,
                        region: &self.region,
                        service: SERVICE,
                        time: OffsetDateTime::now_utc(),
                    },
                );
                for (name, value) in signed {
                    rb = rb.header(name, value);
                }
            }
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            resp = rb.body(body).send() => resp.map_err(|e| GatewayError::upstream(NAME, e))?,
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "bedrock returned an error status");
            return Err(GatewayError::Upstream {
                provider: NAME,
                message: format!("status {status}"),
                body: Some(text),
            });
        }
        Ok(resp)
    }
}

fn message_json(m: &ChatMessage) -> Value {
    let content: Vec<Value> = match &m.content {
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::Image {
                    source: ImageSource::InlineData { mime_type, bytes },
                } => Some(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": mime_type,
                        "data": STANDARD.encode(bytes),
                    }
                })),
                // inlined by the normalizer
                ContentPart::Image {
                    source: ImageSource::RemoteUrl(_),
                } => None,
            })
            .collect(),
    };
    let content = if content.is_empty() {
        vec![json!({"type": "text", "text": ""})]
    } else {
        content
    };
    json!({"role": m.role.as_str(), "content": content})
}

/// Parses a non-streaming invoke response.
pub fn parse_response(raw: &str) -> Result<CanonicalResponse, GatewayError> {
    let v: Value = serde_json::from_str(raw)
        .map_err(|e| GatewayError::protocol(NAME, format!("invalid JSON: {e}"), Some(raw.into())))?;
    let content = v
        .get("content")
        .and_then(Value::as_array)
        .filter(|blocks| !blocks.is_empty())
        .ok_or_else(|| GatewayError::protocol(NAME, "missing or empty content", Some(raw.into())))?;
    let text: String = content
        .iter()
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    let metrics = v.get(METRICS_KEY);
    let count = |usage_key: &str, metrics_key: &str| {
        v.get("usage")
            .and_then(|u| u.get(usage_key))
            .and_then(Value::as_i64)
            .or_else(|| metrics?.get(metrics_key)?.as_i64())
    };
    let usage = TokenUsage::from_counts(
        count("input_tokens", "inputTokenCount"),
        count("output_tokens", "outputTokenCount"),
        None,
    );
    Ok(CanonicalResponse { text, usage })
}

/// Decodes Bedrock `chunk` events wrapping Anthropic streaming events.
#[derive(Debug, Default)]
pub struct BedrockEventDecoder {
    output_tokens: Option<i64>,
    truncated: bool,
}

impl BedrockEventDecoder {
    fn decode_event(&mut self, event: &Value) -> Option<NativeEvent> {
        match event.get("type")?.as_str()? {
            "content_block_delta" => {
                let delta = event.get("delta")?;
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text")?.as_str()?;
                        Some(NativeEvent::Delta(text.to_string()))
                    }
                    _ => Some(NativeEvent::Ignored),
                }
            }
            "message_delta" => {
                if let Some(n) = event.pointer("/usage/output_tokens").and_then(Value::as_i64) {
                    self.output_tokens = Some(n);
                }
                let stop_reason = event.pointer("/delta/stop_reason").and_then(Value::as_str);
                if stop_reason == Some("max_tokens") {
                    self.truncated = true;
                }
                Some(NativeEvent::Ignored)
            }
            "message_stop" => {
                let output_tokens = event
                    .get(METRICS_KEY)
                    .and_then(|m| m.get("outputTokenCount"))
                    .and_then(Value::as_i64)
                    .or(self.output_tokens);
                Some(NativeEvent::Stop {
                    reason: self.truncated.then_some(FinishReason::Length),
                    output_tokens,
                })
            }
            _ => Some(NativeEvent::Ignored),
        }
    }
}

impl EventDecoder for BedrockEventDecoder {
    type Frame = EventMessage;

    fn decode(&mut self, msg: EventMessage) -> Option<NativeEvent> {
        match msg.message_type() {
            "event" => {}
            "exception" | "error" => {
                let kind = msg
                    .header(":exception-type")
                    .or_else(|| msg.header(":error-code"))
                    .unwrap_or("exception");
                return Some(NativeEvent::Failure(format!(
                    "{kind}: {}",
                    String::from_utf8_lossy(&msg.payload)
                )));
            }
            _ => return Some(NativeEvent::Ignored),
        }
        if msg.header(":event-type").is_some_and(|t| t != "chunk") {
            return Some(NativeEvent::Ignored);
        }
        let wrapper: Value = serde_json::from_slice(&msg.payload).ok()?;
        let decoded = STANDARD.decode(wrapper.get("bytes")?.as_str()?).ok()?;
        let event: Value = serde_json::from_slice(&decoded).ok()?;
        self.decode_event(&event)
    }
}

#[async_trait::async_trait]
impl Provider for BedrockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    async fn invoke(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, GatewayError> {
        req.validate()?;
        check_model(NAME, &self.model_pattern, &req.config.model)?;

        let payload = self.build_payload(&req).await?;
        let body = serde_json::to_vec(&payload).map_err(|e| GatewayError::upstream(NAME, e))?;
        let stream = req.config.stream;
        let url = self.invoke_url(&req.config.model, stream)?;
        let accept = if stream {
            "application/vnd.amazon.eventstream"
        } else {
            "application/json"
        };

        let started = Instant::now();
        let resp = self.send(url, accept, body, &cancel).await?;
        REQUEST_DURATION
            .with_label_values(&[NAME, if stream { "true" } else { "false" }])
            .observe(started.elapsed().as_secs_f64());

        if stream {
            let body = resp.bytes_stream().map(|r| r.map_err(std::io::Error::other));
            let frames = FramedRead::new(StreamReader::new(body), EventStreamCodec)
                .map(|r| r.map_err(|e| GatewayError::upstream(NAME, e)));
            let release =
                ReleaseGuard::new(|| tracing::debug!(provider = NAME, "transport released"));
            return Ok(ProviderResponse::Streaming(transcode(
                NAME,
                frames,
                BedrockEventDecoder::default(),
                cancel,
                release,
            )));
        }

        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            raw = resp.text() => raw.map_err(|e| GatewayError::upstream(NAME, e))?,
        };
        let parsed = parse_response(&raw)?;
        if parsed.usage.prompt_tokens >= 0 {
            TOKENS_TOTAL
                .with_label_values(&[NAME, "prompt"])
                .inc_by(parsed.usage.prompt_tokens as u64);
        }
        if parsed.usage.completion_tokens >= 0 {
            TOKENS_TOTAL
                .with_label_values(&[NAME, "completion"])
                .inc_by(parsed.usage.completion_tokens as u64);
        }
        Ok(ProviderResponse::Complete(parsed))
    }

    async fn models(&self) -> Result<Vec<ModelDescriptor>, GatewayError> {
        Ok(Vec::new())
    }

    async fn usage(&self) -> Result<UsageInfo, GatewayError> {
        Ok(UsageInfo::unknown())
    }

    async fn speech(&self, _options: SpeechOptions) -> Result<Bytes, GatewayError> {
        Err(GatewayError::UnsupportedCapability {
            provider: NAME,
            capability: "speech",
        })
    }
}
