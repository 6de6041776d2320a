use bytes::Bytes;
use futures_util::StreamExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;

pub mod bedrock;
pub mod openai;

use crate::config::ProvidersConfig;
use crate::core::entities::{
    CanonicalResponse, ChatRequest, FinishReason, ModelDescriptor, SpeechOptions, StreamEvent,
    UsageInfo,
};
use crate::error::GatewayError;
use crate::transcoder::ChunkStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Bedrock,
    OpenAi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Chat,
    Models,
    Usage,
    Speech,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Chat => "chat",
            Operation::Models => "models",
            Operation::Usage => "usage",
            Operation::Speech => "speech",
        }
    }
}

const BEDROCK_PATHS: &[(&str, Operation)] =
    &[("chat", Operation::Chat), ("models", Operation::Models)];

const OPENAI_PATHS: &[(&str, Operation)] = &[
    ("v1/chat/completions", Operation::Chat),
    ("v1/models", Operation::Models),
    ("v1/audio/speech", Operation::Speech),
    ("dashboard/billing/usage", Operation::Usage),
];

impl ProviderKind {
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "bedrock" => Some(ProviderKind::Bedrock),
            "openai" => Some(ProviderKind::OpenAi),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Bedrock => bedrock::NAME,
            ProviderKind::OpenAi => openai::NAME,
        }
    }

    pub fn allowed_paths(&self) -> &'static [(&'static str, Operation)] {
        match self {
            ProviderKind::Bedrock => BEDROCK_PATHS,
            ProviderKind::OpenAi => OPENAI_PATHS,
        }
    }

    /// Maps an inbound sub-path onto an operation if it is on the allow-list.
    pub fn operation_for(&self, sub_path: &str) -> Option<Operation> {
        let sub_path = sub_path.trim_matches('/');
        self.allowed_paths()
            .iter()
            .find(|(p, _)| *p == sub_path)
            .map(|(_, op)| *op)
    }
}

pub enum ProviderResponse {
    Streaming(ChunkStream),
    Complete(CanonicalResponse),
}

/// The capability set every backend implements.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Validates and translates `req`, calls the backend and returns either
    /// the canonical stream or the parsed response. `cancel` stops the
    /// backend call and any stream it produced.
    async fn invoke(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, GatewayError>;

    /// Empty when the backend has no model discovery.
    async fn models(&self) -> Result<Vec<ModelDescriptor>, GatewayError>;

    /// [`UsageInfo::unknown`] when the backend has no usage API.
    async fn usage(&self) -> Result<UsageInfo, GatewayError>;

    async fn speech(&self, options: SpeechOptions) -> Result<Bytes, GatewayError>;
}

/// Constructs the adapter for `kind`; fails without network I/O when the
/// backend is disabled or lacks credentials.
pub fn build(kind: ProviderKind, cfg: &ProvidersConfig) -> Result<Box<dyn Provider>, GatewayError> {
    Ok(match kind {
        ProviderKind::Bedrock => Box::new(bedrock::BedrockProvider::from_config(&cfg.bedrock)?),
        ProviderKind::OpenAi => Box::new(openai::OpenAiProvider::from_config(&cfg.openai)?),
    })
}

pub(crate) fn compile_model_pattern(
    provider: &'static str,
    custom: Option<&str>,
    default: &str,
) -> Result<Regex, GatewayError> {
    let pattern = custom.unwrap_or(default);
    Regex::new(pattern).map_err(|e| {
        GatewayError::Configuration(format!("{provider}: invalid model pattern '{pattern}': {e}"))
    })
}

pub(crate) fn check_model(
    provider: &'static str,
    pattern: &Regex,
    model: &str,
) -> Result<(), GatewayError> {
    if pattern.is_match(model) {
        Ok(())
    } else {
        Err(GatewayError::UnsupportedModel {
            provider,
            model: model.to_string(),
        })
    }
}

/// What `on_finish` receives besides the final text.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseHandle {
    Stream { finish_reason: Option<FinishReason> },
    Complete(CanonicalResponse),
}

/// Callback side of [`chat`].
pub trait ChatHandler: Send {
    /// Called once, before the backend call starts.
    fn on_controller(&mut self, _controller: CancellationToken) {}

    fn on_update(&mut self, _accumulated: &str, _delta: &str) {}

    /// Called exactly once on success.
    fn on_finish(&mut self, text: &str, response: ResponseHandle);

    /// Called at most once, and never together with `on_finish`.
    fn on_error(&mut self, error: GatewayError);
}

/// Runs one chat request against `provider`, reporting progress through
/// `handler`.
pub async fn chat(provider: &dyn Provider, request: ChatRequest, handler: &mut dyn ChatHandler) {
    let controller = CancellationToken::new();
    handler.on_controller(controller.clone());

    let response = match provider.invoke(request, controller).await {
        Ok(r) => r,
        Err(e) => return handler.on_error(e),
    };

    let mut stream = match response {
        ProviderResponse::Complete(resp) => {
            let text = resp.text.clone();
            return handler.on_finish(&text, ResponseHandle::Complete(resp));
        }
        ProviderResponse::Streaming(stream) => stream,
    };

    let mut text = String::new();
    let mut finish_reason = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamEvent::Chunk(chunk)) => {
                if chunk.finish_reason.is_some() {
                    finish_reason = chunk.finish_reason;
                }
                if !chunk.delta_text.is_empty() {
                    text.push_str(&chunk.delta_text);
                    handler.on_update(&text, &chunk.delta_text);
                }
            }
            Ok(StreamEvent::Done) => {
                return handler.on_finish(&text, ResponseHandle::Stream { finish_reason });
            }
            Err(e) => return handler.on_error(e),
        }
    }
    handler.on_error(GatewayError::protocol(
        provider.kind().name(),
        "stream closed without end-of-stream marker",
        None,
    ));
}
