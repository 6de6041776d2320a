//! AWS event-stream framing (`application/vnd.amazon.eventstream`).
//!
//! Each message is: total length (u32), headers length (u32), prelude CRC,
//! headers, payload, message CRC. All integers are big-endian. Both CRCs are
//! CRC-32 (IEEE); the prelude CRC covers the first 8 bytes and the message
//! CRC covers everything before it. A mismatch is a framing error.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;
const MIN_MESSAGE_LEN: usize = PRELUDE_LEN + MESSAGE_CRC_LEN;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

const HEADER_TRUE: u8 = 0;
const HEADER_FALSE: u8 = 1;
const HEADER_BYTE: u8 = 2;
const HEADER_SHORT: u8 = 3;
const HEADER_INT: u8 = 4;
const HEADER_LONG: u8 = 5;
const HEADER_BYTES: u8 = 6;
const HEADER_STRING: u8 = 7;
const HEADER_TIMESTAMP: u8 = 8;
const HEADER_UUID: u8 = 9;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed event-stream message: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventMessage {
    /// String-valued headers only.
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl EventMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn message_type(&self) -> &str {
        self.header(":message-type").unwrap_or("event")
    }
}

#[derive(Debug, Default)]
pub struct EventStreamCodec;

impl Decoder for EventStreamCodec {
    type Item = EventMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<EventMessage>, FrameError> {
        if src.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let mut prelude = &src[..8];
        let total = prelude.get_u32() as usize;
        let headers_len = prelude.get_u32() as usize;

        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&total) {
            return Err(FrameError::Malformed(format!("invalid message length {total}")));
        }
        if headers_len > total - MIN_MESSAGE_LEN {
            return Err(FrameError::Malformed(format!(
                "headers length {headers_len} exceeds message length {total}"
            )));
        }
        let prelude_crc = (&src[8..PRELUDE_LEN]).get_u32();
        if crc32fast::hash(&src[..8]) != prelude_crc {
            return Err(FrameError::Malformed("prelude CRC mismatch".into()));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let message_crc = (&src[total - MESSAGE_CRC_LEN..total]).get_u32();
        if crc32fast::hash(&src[..total - MESSAGE_CRC_LEN]) != message_crc {
            return Err(FrameError::Malformed("message CRC mismatch".into()));
        }

        let mut message = src.split_to(total).freeze();
        message.advance(PRELUDE_LEN);
        let headers = parse_headers(message.split_to(headers_len))?;
        let payload = message.split_to(total - MIN_MESSAGE_LEN - headers_len);
        Ok(Some(EventMessage { headers, payload }))
    }
}

fn take(buf: &mut Bytes, n: usize) -> Result<Bytes, FrameError> {
    if buf.remaining() < n {
        return Err(FrameError::Malformed("truncated header".into()));
    }
    Ok(buf.split_to(n))
}

fn parse_headers(mut buf: Bytes) -> Result<HashMap<String, String>, FrameError> {
    let mut headers = HashMap::new();
    while buf.has_remaining() {
        let name_len = take(&mut buf, 1)?.get_u8() as usize;
        let name = take(&mut buf, name_len)?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| FrameError::Malformed("header name is not UTF-8".into()))?;
        let value_type = take(&mut buf, 1)?.get_u8();
        match value_type {
            HEADER_TRUE | HEADER_FALSE => {}
            HEADER_BYTE => {
                take(&mut buf, 1)?;
            }
            HEADER_SHORT => {
                take(&mut buf, 2)?;
            }
            HEADER_INT => {
                take(&mut buf, 4)?;
            }
            HEADER_LONG | HEADER_TIMESTAMP => {
                take(&mut buf, 8)?;
            }
            HEADER_UUID => {
                take(&mut buf, 16)?;
            }
            HEADER_BYTES | HEADER_STRING => {
                let len = take(&mut buf, 2)?.get_u16() as usize;
                let value = take(&mut buf, len)?;
                if value_type == HEADER_STRING {
                    let value = String::from_utf8(value.to_vec()).map_err(|_| {
                        FrameError::Malformed(format!("header '{name}' is not UTF-8"))
                    })?;
                    headers.insert(name, value);
                }
            }
            other => {
                return Err(FrameError::Malformed(format!("unknown header type {other}")));
            }
        }
    }
    Ok(headers)
}
