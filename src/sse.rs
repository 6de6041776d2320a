use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::api::openai_adapter::chunk_json;
use crate::core::entities::StreamEvent;
use crate::transcoder::ChunkStream;

/// Encodes a canonical chunk stream as OpenAI-style server-sent events,
/// terminated by `data: [DONE]`. One id and timestamp per stream.
pub fn to_axum_sse(
    model: String,
    stream: ChunkStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = OffsetDateTime::now_utc().unix_timestamp();

    let mapped = stream.map(move |item| {
        let event = match item {
            Ok(StreamEvent::Chunk(chunk)) => {
                Event::default().data(chunk_json(&id, created, &model, &chunk).to_string())
            }
            Ok(StreamEvent::Done) => Event::default().data("[DONE]"),
            Err(e) => {
                tracing::warn!(error = %e, "stream terminated with error");
                Event::default().data(e.to_json().to_string())
            }
        };
        Ok(event)
    });
    Sse::new(mapped).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}
