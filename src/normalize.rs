//! Multimodal content normalization.
//!
//! Every image part is turned into inline bytes with a media type, fetching
//! remote images when needed. Backends that fetch URLs themselves use
//! [`ContentNormalizer::normalize_messages_local`], which keeps `http(s)`
//! URLs as they are. Individual parts that cannot be recovered are dropped
//! and logged; they never fail the whole request. A final integrity pass
//! ([`validate_images`]) rejects requests that still carry an image without
//! data.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::future::join_all;
use reqwest::{header::CONTENT_TYPE, Client};

use crate::core::entities::{
    ChatMessage, ContentPart, ImageSource, MessageContent, ValidationError,
};
use crate::metrics::DROPPED_IMAGES_TOTAL;

const FALLBACK_IMAGE_MIME: &str = "image/jpeg";

pub struct ContentNormalizer {
    client: Client,
}

impl ContentNormalizer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Normalizes all messages. Remote fetches of the whole request run
    /// concurrently; output order follows input order.
    pub async fn normalize_messages(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        join_all(messages.into_iter().map(|m| self.normalize_message(m))).await
    }

    pub async fn normalize_message(&self, message: ChatMessage) -> ChatMessage {
        let ChatMessage { role, content } = message;
        let parts = match content {
            MessageContent::Text(text) => {
                return ChatMessage {
                    role,
                    content: MessageContent::Text(text),
                }
            }
            MessageContent::Parts(parts) => parts,
        };
        let normalized: Vec<ContentPart> =
            join_all(parts.into_iter().map(|p| self.normalize_part(p)))
                .await
                .into_iter()
                .flatten()
                .collect();
        ChatMessage {
            role,
            content: MessageContent::Parts(ensure_non_empty(normalized)),
        }
    }

    async fn normalize_part(&self, part: ContentPart) -> Option<ContentPart> {
        let source = match part {
            ContentPart::Text { .. } => return Some(part),
            ContentPart::Image { source } => source,
        };
        match source {
            ImageSource::InlineData { mime_type, bytes } => {
                Some(inline(normalize_mime(&mime_type), bytes))
            }
            ImageSource::RemoteUrl(url) => match scheme(&url).as_str() {
                "data" => from_data_url(&url),
                "http" | "https" => self.from_remote(&url).await,
                _ => dropped("unsupported_scheme", &url),
            },
        }
    }

    /// Same per-part rules as [`Self::normalize_messages`] without any
    /// network I/O: `http(s)` image URLs are kept for the backend to fetch.
    pub fn normalize_messages_local(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        messages
            .into_iter()
            .map(|ChatMessage { role, content }| {
                let content = match content {
                    MessageContent::Text(text) => MessageContent::Text(text),
                    MessageContent::Parts(parts) => MessageContent::Parts(ensure_non_empty(
                        parts.into_iter().filter_map(normalize_part_local).collect(),
                    )),
                };
                ChatMessage { role, content }
            })
            .collect()
    }

    async fn from_remote(&self, url: &str) -> Option<ContentPart> {
        match self.fetch_image(url).await {
            Ok((_, bytes)) if bytes.is_empty() => dropped("empty_body", url),
            Ok((mime, bytes)) => Some(inline(mime, bytes)),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "image fetch failed");
                dropped("fetch_failed", url)
            }
        }
    }

    async fn fetch_image(&self, url: &str) -> Result<(String, Vec<u8>), reqwest::Error> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let header_mime = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(normalize_mime)
            .filter(|m| m.starts_with("image/"));
        let bytes = resp.bytes().await?;
        let mime = header_mime.unwrap_or_else(|| mime_from_extension(url).to_string());
        Ok((mime, bytes.to_vec()))
    }
}

fn normalize_part_local(part: ContentPart) -> Option<ContentPart> {
    let source = match part {
        ContentPart::Text { .. } => return Some(part),
        ContentPart::Image { source } => source,
    };
    match source {
        ImageSource::InlineData { mime_type, bytes } => {
            Some(inline(normalize_mime(&mime_type), bytes))
        }
        ImageSource::RemoteUrl(url) => match scheme(&url).as_str() {
            "data" => from_data_url(&url),
            "http" | "https" => Some(ContentPart::Image {
                source: ImageSource::RemoteUrl(url),
            }),
            _ => dropped("unsupported_scheme", &url),
        },
    }
}

fn scheme(url: &str) -> String {
    url.split_once(':')
        .map(|(s, _)| s.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn from_data_url(url: &str) -> Option<ContentPart> {
    let Some((mime, payload)) = parse_data_url(url) else {
        return dropped("malformed_data_url", url);
    };
    if payload.is_empty() {
        return dropped("empty_payload", url);
    }
    match STANDARD.decode(payload) {
        Ok(bytes) if !bytes.is_empty() => Some(inline(normalize_mime(mime), bytes)),
        Ok(_) => dropped("empty_payload", url),
        Err(_) => dropped("invalid_base64", url),
    }
}

fn inline(mime_type: String, bytes: Vec<u8>) -> ContentPart {
    ContentPart::Image {
        source: ImageSource::InlineData { mime_type, bytes },
    }
}

fn dropped(reason: &'static str, url: &str) -> Option<ContentPart> {
    // data URLs can be megabytes long
    let shown: String = url.chars().take(64).collect();
    tracing::warn!(reason, url = %shown, "dropping image part");
    DROPPED_IMAGES_TOTAL.with_label_values(&[reason]).inc();
    None
}

/// Splits `data:<mime>;base64,<payload>` into mime and payload.
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.get(..5).filter(|p| p.eq_ignore_ascii_case("data:")).map(|_| &url[5..])?;
    let (header, payload) = rest.split_once(',')?;
    let mut params = header.split(';');
    let mime = params.next()?.trim();
    if mime.is_empty() || !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return None;
    }
    Some((mime, payload.trim()))
}

/// Lower-cases the media type, strips parameters and fixes the common
/// `image/jpg` alias.
pub fn normalize_mime(mime: &str) -> String {
    let base = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match base.as_str() {
        "" => FALLBACK_IMAGE_MIME.to_string(),
        "image/jpg" => "image/jpeg".to_string(),
        _ => base,
    }
}

fn mime_from_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => FALLBACK_IMAGE_MIME,
    }
}

fn ensure_non_empty(parts: Vec<ContentPart>) -> Vec<ContentPart> {
    if parts.is_empty() {
        vec![ContentPart::text("")]
    } else {
        parts
    }
}

/// Last-resort integrity check over a normalized request.
pub fn validate_images(messages: &[ChatMessage]) -> Result<(), ValidationError> {
    for (i, m) in messages.iter().enumerate() {
        let MessageContent::Parts(parts) = &m.content else {
            continue;
        };
        for part in parts {
            let empty = match part {
                ContentPart::Image {
                    source: ImageSource::InlineData { bytes, .. },
                } => bytes.is_empty(),
                ContentPart::Image {
                    source: ImageSource::RemoteUrl(url),
                } => {
                    url.trim().is_empty()
                        || parse_data_url(url.trim()).is_some_and(|(_, payload)| payload.is_empty())
                }
                ContentPart::Text { .. } => false,
            };
            if empty {
                return Err(ValidationError(format!(
                    "message {i} contains an image part without data"
                )));
            }
        }
    }
    Ok(())
}
