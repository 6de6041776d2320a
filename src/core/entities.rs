use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ImageSource {
    RemoteUrl(String),
    InlineData { mime_type: String, bytes: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text parts only, joined without separator. Images are skipped.
    pub fn text_only(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f64,
    pub stream: bool,
    pub max_tokens: u32,
}

impl ModelConfig {
    /// Builds a config from caller-supplied values, replacing out-of-range
    /// temperature and non-positive max tokens with the defaults.
    pub fn new(
        model: impl Into<String>,
        temperature: Option<f64>,
        stream: bool,
        max_tokens: Option<i64>,
    ) -> Self {
        let temperature = match temperature {
            Some(t) if (0.0..=1.0).contains(&t) => t,
            _ => DEFAULT_TEMPERATURE,
        };
        let max_tokens = match max_tokens {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => DEFAULT_MAX_TOKENS,
        };
        Self {
            model: model.into(),
            temperature,
            stream,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub config: ModelConfig,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.messages.is_empty() {
            return Err(ValidationError("messages must not be empty".into()));
        }
        if self.config.model.trim().is_empty() {
            return Err(ValidationError("model must be a non-empty string".into()));
        }
        if self.messages.iter().all(|m| m.role == Role::System) {
            return Err(ValidationError(
                "at least one non-system message is required".into(),
            ));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Separates system messages from the conversation. System texts are
    /// joined with newlines; image parts in system messages are discarded.
    pub fn split_system(&self) -> (String, Vec<ChatMessage>) {
        let mut system = Vec::new();
        let mut rest = Vec::new();
        for m in &self.messages {
            if m.role == Role::System {
                system.push(m.content.text_only());
            } else {
                rest.push(m.clone());
            }
        }
        (system.join("\n"), rest)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalChunk {
    pub delta_text: String,
    pub finish_reason: Option<FinishReason>,
}

/// One item of a canonical stream. `Done` is the end-of-stream sentinel.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Chunk(CanonicalChunk),
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub const UNKNOWN: i64 = -1;

    pub fn unknown() -> Self {
        Self {
            prompt_tokens: Self::UNKNOWN,
            completion_tokens: Self::UNKNOWN,
            total_tokens: Self::UNKNOWN,
        }
    }

    /// Total is derived when the backend reports both counts but no total.
    pub fn from_counts(prompt: Option<i64>, completion: Option<i64>, total: Option<i64>) -> Self {
        let total = total.or(match (prompt, completion) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        });
        Self {
            prompt_tokens: prompt.unwrap_or(Self::UNKNOWN),
            completion_tokens: completion.unwrap_or(Self::UNKNOWN),
            total_tokens: total.unwrap_or(Self::UNKNOWN),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalResponse {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub owned_by: String,
}

/// Account usage. `None` fields mean the backend does not report them.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct UsageInfo {
    pub used: Option<f64>,
    pub total: Option<f64>,
}

impl UsageInfo {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.used.is_none() && self.total.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SpeechOptions {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}
