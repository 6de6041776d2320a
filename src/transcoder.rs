//! Native event stream -> canonical chunk stream.
//!
//! [`Transcoder`] is the pure two-state machine (`Streaming` -> `Done`).
//! [`transcode`] drives it over a backend transport on its own task and
//! forwards the canonical events through a bounded channel.

use futures_util::{stream::BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::core::entities::{CanonicalChunk, FinishReason, StreamEvent};
use crate::error::GatewayError;
use crate::metrics::{SKIPPED_FRAMES_TOTAL, STREAM_CHUNKS_TOTAL};

const CHANNEL_CAPACITY: usize = 32;

pub type ChunkStream = BoxStream<'static, Result<StreamEvent, GatewayError>>;

/// A backend event after backend-specific parsing.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeEvent {
    Delta(String),
    /// End of the response. An explicit `reason` wins over the token heuristic.
    Stop {
        reason: Option<FinishReason>,
        output_tokens: Option<i64>,
    },
    /// The backend reported an error inside the stream.
    Failure(String),
    /// Well-formed but irrelevant (pings, block starts, ...).
    Ignored,
}

/// Parses one transport frame. `None` marks a malformed frame.
pub trait EventDecoder: Send + 'static {
    type Frame: Send + 'static;

    fn decode(&mut self, frame: Self::Frame) -> Option<NativeEvent>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscoderState {
    Streaming,
    Done,
}

pub struct Transcoder {
    provider: &'static str,
    state: TranscoderState,
    text: String,
}

impl Transcoder {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            state: TranscoderState::Streaming,
            text: String::new(),
        }
    }

    pub fn state(&self) -> TranscoderState {
        self.state
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Forces the terminal state, e.g. when the consumer went away.
    pub fn abort(&mut self) {
        self.state = TranscoderState::Done;
    }

    /// Consumes one decoded event (`None` = malformed frame) and returns the
    /// canonical events to emit, in order.
    pub fn step(&mut self, event: Option<NativeEvent>) -> Result<Vec<StreamEvent>, GatewayError> {
        if self.state == TranscoderState::Done {
            return Ok(Vec::new());
        }
        let Some(event) = event else {
            SKIPPED_FRAMES_TOTAL.with_label_values(&[self.provider]).inc();
            tracing::debug!(provider = self.provider, "skipping malformed stream frame");
            return Ok(Vec::new());
        };
        match event {
            NativeEvent::Delta(delta) if !delta.is_empty() => {
                self.text.push_str(&delta);
                Ok(vec![StreamEvent::Chunk(CanonicalChunk {
                    delta_text: delta,
                    finish_reason: None,
                })])
            }
            NativeEvent::Delta(_) | NativeEvent::Ignored => Ok(Vec::new()),
            NativeEvent::Stop {
                reason,
                output_tokens,
            } => {
                self.state = TranscoderState::Done;
                let reason = reason.unwrap_or_else(|| finish_reason_for(output_tokens));
                Ok(vec![
                    StreamEvent::Chunk(CanonicalChunk {
                        delta_text: String::new(),
                        finish_reason: Some(reason),
                    }),
                    StreamEvent::Done,
                ])
            }
            NativeEvent::Failure(message) => {
                self.state = TranscoderState::Done;
                Err(GatewayError::upstream(self.provider, message))
            }
        }
    }
}

/// Best-effort mapping: a positive output-token count means the model
/// stopped on its own, anything else is treated as truncation.
pub fn finish_reason_for(output_tokens: Option<i64>) -> FinishReason {
    match output_tokens {
        Some(n) if n > 0 => FinishReason::Stop,
        _ => FinishReason::Length,
    }
}

/// Runs a release action exactly once when dropped.
pub struct ReleaseGuard {
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ReleaseGuard {
    pub fn new(on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

/// Spawns the transcoding loop. The transport (`frames`) and `release` are
/// owned by the task and dropped on every exit path: completion, upstream
/// error, consumer disconnect and cancellation.
pub fn transcode<S, D>(
    provider: &'static str,
    frames: S,
    mut decoder: D,
    cancel: CancellationToken,
    release: ReleaseGuard,
) -> ChunkStream
where
    S: Stream<Item = Result<D::Frame, GatewayError>> + Send + 'static,
    D: EventDecoder,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut frames = Box::pin(frames);
        let mut transcoder = Transcoder::new(provider);

        while transcoder.state() == TranscoderState::Streaming {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(provider, "stream cancelled by caller");
                    let _ = tx.send(Err(GatewayError::Cancelled)).await;
                    break;
                }
                _ = tx.closed() => {
                    tracing::debug!(provider, "stream consumer disconnected");
                    break;
                }
                next = frames.next() => next,
            };

            let emitted = match next {
                Some(Ok(frame)) => transcoder.step(decoder.decode(frame)),
                Some(Err(e)) => {
                    transcoder.abort();
                    Err(e)
                }
                None => {
                    transcoder.abort();
                    Err(GatewayError::protocol(
                        provider,
                        "stream ended before completion event",
                        None,
                    ))
                }
            };

            match emitted {
                Ok(events) => {
                    for event in events {
                        if matches!(event, StreamEvent::Chunk(_)) {
                            STREAM_CHUNKS_TOTAL.with_label_values(&[provider]).inc();
                        }
                        if tx.send(Ok(event)).await.is_err() {
                            transcoder.abort();
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(provider, error = %e, "stream terminated by upstream");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }

        // transport is released before the consumer observes end-of-stream
        drop(frames);
        drop(release);
    });
    ReceiverStream::new(rx).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Frames are plain strings: "d:<text>", "stop:<tokens>", "fail:<msg>",
    /// "ping"; anything else is malformed.
    struct TestDecoder;

    impl EventDecoder for TestDecoder {
        type Frame = String;

        fn decode(&mut self, frame: String) -> Option<NativeEvent> {
            if let Some(t) = frame.strip_prefix("d:") {
                return Some(NativeEvent::Delta(t.to_string()));
            }
            if let Some(n) = frame.strip_prefix("stop:") {
                return Some(NativeEvent::Stop {
                    reason: None,
                    output_tokens: n.parse().ok(),
                });
            }
            if let Some(m) = frame.strip_prefix("fail:") {
                return Some(NativeEvent::Failure(m.to_string()));
            }
            (frame == "ping").then_some(NativeEvent::Ignored)
        }
    }

    fn counter() -> (Arc<AtomicUsize>, ReleaseGuard) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let guard = ReleaseGuard::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, guard)
    }

    fn frames(items: &[&str]) -> impl Stream<Item = Result<String, GatewayError>> + Send + 'static {
        stream::iter(items.iter().map(|s| Ok(s.to_string())).collect::<Vec<_>>())
    }

    fn chunk(text: &str, reason: Option<FinishReason>) -> StreamEvent {
        StreamEvent::Chunk(CanonicalChunk {
            delta_text: text.to_string(),
            finish_reason: reason,
        })
    }

    #[test]
    fn step_accumulates_and_terminates() {
        let mut t = Transcoder::new("test");
        assert_eq!(
            t.step(Some(NativeEvent::Delta("He".into()))).unwrap(),
            vec![chunk("He", None)]
        );
        assert!(t.step(None).unwrap().is_empty());
        assert!(t.step(Some(NativeEvent::Delta(String::new()))).unwrap().is_empty());
        assert_eq!(
            t.step(Some(NativeEvent::Delta("llo".into()))).unwrap(),
            vec![chunk("llo", None)]
        );
        assert_eq!(t.text(), "Hello");

        let out = t
            .step(Some(NativeEvent::Stop {
                reason: None,
                output_tokens: Some(2),
            }))
            .unwrap();
        assert_eq!(out, vec![chunk("", Some(FinishReason::Stop)), StreamEvent::Done]);
        assert_eq!(t.state(), TranscoderState::Done);

        // nothing after the sentinel
        assert!(t.step(Some(NativeEvent::Delta("late".into()))).unwrap().is_empty());
        assert_eq!(t.text(), "Hello");
    }

    #[test]
    fn finish_reason_heuristic() {
        assert_eq!(finish_reason_for(Some(3)), FinishReason::Stop);
        assert_eq!(finish_reason_for(Some(0)), FinishReason::Length);
        assert_eq!(finish_reason_for(None), FinishReason::Length);

        let mut t = Transcoder::new("test");
        let out = t
            .step(Some(NativeEvent::Stop {
                reason: Some(FinishReason::Length),
                output_tokens: Some(10),
            }))
            .unwrap();
        assert_eq!(out[0], chunk("", Some(FinishReason::Length)));
    }

    #[tokio::test]
    async fn sentinel_is_emitted_once_and_transport_released() {
        let (released, guard) = counter();
        let stream = transcode(
            "test",
            frames(&["d:He", "garbage", "ping", "d:llo", "stop:2", "d:ignored", "stop:1"]),
            TestDecoder,
            CancellationToken::new(),
            guard,
        );
        let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(
            events,
            vec![
                chunk("He", None),
                chunk("llo", None),
                chunk("", Some(FinishReason::Stop)),
                StreamEvent::Done,
            ]
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_terminal() {
        let (released, guard) = counter();
        let stream = transcode(
            "test",
            frames(&["d:a", "fail:throttled", "d:b"]),
            TestDecoder,
            CancellationToken::new(),
            guard,
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(GatewayError::Upstream { .. })));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn truncated_transport_is_an_error() {
        let (released, guard) = counter();
        let stream = transcode(
            "test",
            frames(&["d:a"]),
            TestDecoder,
            CancellationToken::new(),
            guard,
        );
        let events: Vec<_> = stream.collect().await;
        assert!(matches!(events.last(), Some(Err(GatewayError::UpstreamProtocol { .. }))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consumer_disconnect_releases_transport() {
        let (released, guard) = counter();
        let endless = stream::repeat_with(|| Ok::<_, GatewayError>("d:x".to_string()));
        let mut stream = transcode("test", endless, TestDecoder, CancellationToken::new(), guard);
        assert!(stream.next().await.is_some());
        drop(stream);

        for _ in 0..100 {
            if released.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let (released, guard) = counter();
        let cancel = CancellationToken::new();
        let pending = stream::pending::<Result<String, GatewayError>>();
        let stream = transcode("test", pending, TestDecoder, cancel.clone(), guard);
        cancel.cancel();
        let events: Vec<_> = stream.collect().await;
        assert!(matches!(events.as_slice(), [Err(GatewayError::Cancelled)]));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
