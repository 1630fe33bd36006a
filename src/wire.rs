//! Wire protocol: tagged frames and JSON control payloads.
//!
//! Every unit of the multiplexed protocol is one frame, carried as a
//! single binary WebSocket message:
//!
//! ```text
//! [u8 kind] [u32 LE exchange id] [payload]
//! ```
//!
//! Frame kinds:
//! - `0x01`: Command — opens an exchange; payload = `"METHOD /path"` UTF-8
//! - `0x02`: Status — first response unit; payload = `u16 LE` status code
//! - `0x03`: Header — newline-joined `Key: Value` pairs, no trailing newline
//! - `0x04`: Body — opaque body bytes
//! - `0x05`: End — terminator for a request body or a response
//! - `0x06`: Error — connection-level control on exchange 0; payload =
//!   UTF-8 reason (`"no-client"` means the relay has no attached peer)
//!
//! Exchange id 0 is reserved for connection-level control frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one logical request/response exchange on a connection.
pub type ExchangeId = u32;

/// Reserved exchange id for connection-level control frames.
pub const CONTROL_EXCHANGE: ExchangeId = 0;

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Error reason sent by the relay when no editor peer is attached.
pub const NO_CLIENT_REASON: &str = "no-client";

/// Frame kind constants.
mod kind {
    pub const COMMAND: u8 = 0x01;
    pub const STATUS: u8 = 0x02;
    pub const HEADER: u8 = 0x03;
    pub const BODY: u8 = 0x04;
    pub const END: u8 = 0x05;
    pub const ERROR: u8 = 0x06;
}

/// Kind of a protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opens an exchange; payload is the command line.
    Command,
    /// First response unit; payload is a `u16 LE` status code.
    Status,
    /// Header block.
    Header,
    /// Opaque body bytes.
    Body,
    /// Terminator for a body or a response.
    End,
    /// Connection-level error (exchange 0).
    Error,
}

impl FrameKind {
    fn as_byte(self) -> u8 {
        match self {
            FrameKind::Command => kind::COMMAND,
            FrameKind::Status => kind::STATUS,
            FrameKind::Header => kind::HEADER,
            FrameKind::Body => kind::BODY,
            FrameKind::End => kind::END,
            FrameKind::Error => kind::ERROR,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            kind::COMMAND => Some(FrameKind::Command),
            kind::STATUS => Some(FrameKind::Status),
            kind::HEADER => Some(FrameKind::Header),
            kind::BODY => Some(FrameKind::Body),
            kind::END => Some(FrameKind::End),
            kind::ERROR => Some(FrameKind::Error),
            _ => None,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Message shorter than the 5-byte frame header.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    /// Payload exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    /// Unrecognized kind byte.
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),
    /// Status frame payload is not exactly two bytes.
    #[error("malformed status payload")]
    BadStatus,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Exchange this frame belongs to (0 = connection control).
    pub exchange: ExchangeId,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Command frame opening `exchange` with the given command line.
    pub fn command(exchange: ExchangeId, line: &str) -> Self {
        Self {
            kind: FrameKind::Command,
            exchange,
            payload: Bytes::copy_from_slice(line.as_bytes()),
        }
    }

    /// Status frame carrying a numeric status code.
    pub fn status(exchange: ExchangeId, code: u16) -> Self {
        Self {
            kind: FrameKind::Status,
            exchange,
            payload: Bytes::copy_from_slice(&code.to_le_bytes()),
        }
    }

    /// Header frame carrying a pre-joined header block.
    pub fn header(exchange: ExchangeId, block: &str) -> Self {
        Self {
            kind: FrameKind::Header,
            exchange,
            payload: Bytes::copy_from_slice(block.as_bytes()),
        }
    }

    /// Body frame carrying opaque bytes.
    pub fn body(exchange: ExchangeId, data: Bytes) -> Self {
        Self {
            kind: FrameKind::Body,
            exchange,
            payload: data,
        }
    }

    /// Terminator frame for `exchange`.
    pub fn end(exchange: ExchangeId) -> Self {
        Self {
            kind: FrameKind::End,
            exchange,
            payload: Bytes::new(),
        }
    }

    /// Connection-level error frame (always exchange 0).
    pub fn error(reason: &str) -> Self {
        Self {
            kind: FrameKind::Error,
            exchange: CONTROL_EXCHANGE,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Decode the status code of a Status frame.
    pub fn status_code(&self) -> Result<u16, WireError> {
        if self.kind != FrameKind::Status || self.payload.len() != 2 {
            return Err(WireError::BadStatus);
        }
        Ok(u16::from_le_bytes([self.payload[0], self.payload[1]]))
    }

    /// Encode this frame into a wire-format byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&self.exchange.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from one wire-format message.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the message is shorter than the frame
    /// header, oversized, or carries an unknown kind byte.
    pub fn decode(message: &[u8]) -> Result<Self, WireError> {
        if message.len() < 5 {
            return Err(WireError::TooShort(message.len()));
        }
        if message.len() - 5 > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(message.len() - 5));
        }
        let kind = FrameKind::from_byte(message[0]).ok_or(WireError::UnknownKind(message[0]))?;
        let exchange = u32::from_le_bytes([message[1], message[2], message[3], message[4]]);
        Ok(Self {
            kind,
            exchange,
            payload: Bytes::copy_from_slice(&message[5..]),
        })
    }
}

/// Handshake sent once per connection, immediately after connecting,
/// as a JSON text message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version string.
    pub version: String,
    /// Session identity correlating an agent with its editor sessions.
    pub id: String,
    /// Opaque shared key ("" when unset).
    #[serde(rename = "userKey", default)]
    pub user_key: String,
}

/// JSON payload exchanged on editor subscriber connections.
///
/// `ping`/`pong` carry no `resourceRef`; `open` does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyMessage {
    /// One of `ping`, `pong`, `open`.
    #[serde(rename = "messageType")]
    pub message_type: String,
    /// Connection-addressable locator of the resource to open.
    #[serde(rename = "resourceRef", skip_serializing_if = "Option::is_none", default)]
    pub resource_ref: Option<String>,
}

impl NotifyMessage {
    /// A keep-alive ping.
    pub fn ping() -> Self {
        Self {
            message_type: "ping".to_string(),
            resource_ref: None,
        }
    }

    /// A keep-alive pong.
    pub fn pong() -> Self {
        Self {
            message_type: "pong".to_string(),
            resource_ref: None,
        }
    }

    /// An open-notification for `resource_ref`.
    pub fn open(resource_ref: &str) -> Self {
        Self {
            message_type: "open".to_string(),
            resource_ref: Some(resource_ref.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let frame = Frame::command(7, "GET /a/b.txt");
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.exchange, 7);
        assert_eq!(&decoded.payload[..], b"GET /a/b.txt");
    }

    #[test]
    fn test_status_round_trip() {
        let frame = Frame::status(1, 404);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.status_code().unwrap(), 404);
    }

    #[test]
    fn test_end_has_empty_payload() {
        let frame = Frame::end(3);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.kind, FrameKind::End);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_error_frame_is_control() {
        let frame = Frame::error(NO_CLIENT_REASON);
        assert_eq!(frame.exchange, CONTROL_EXCHANGE);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(&decoded.payload[..], b"no-client");
    }

    #[test]
    fn test_too_short_rejected() {
        assert_eq!(Frame::decode(&[0x01, 0, 0]), Err(WireError::TooShort(3)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = Frame::end(1).encode();
        buf[0] = 0x7f;
        assert_eq!(Frame::decode(&buf), Err(WireError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_status_code_on_wrong_kind() {
        let frame = Frame::body(1, Bytes::from_static(b"xx"));
        assert_eq!(frame.status_code(), Err(WireError::BadStatus));
    }

    #[test]
    fn test_hello_json_field_names() {
        let hello = HelloMessage {
            version: "0.1".to_string(),
            id: "abc".to_string(),
            user_key: "k".to_string(),
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"userKey\":\"k\""));
        assert!(json.contains("\"version\":\"0.1\""));
    }

    #[test]
    fn test_notify_open_json() {
        let msg = NotifyMessage::open("wss://relay/fs/abc");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"messageType\":\"open\""));
        assert!(json.contains("\"resourceRef\""));

        let ping = serde_json::to_string(&NotifyMessage::ping()).unwrap();
        assert!(!ping.contains("resourceRef"));
    }
}
