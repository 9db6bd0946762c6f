//! Framed WebSocket protocol for the document push channel.
//!
//! Every frame is `version:u8 | type:u8 | length:u24 | payload`, with a JSON
//! payload since scene elements are open-ended JSON records. Clients subscribe
//! to one subject at a time and receive its current snapshot followed by every
//! stored update.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::scene::{Document, SubjectId};
use crate::source::DocumentUpdate;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB, the limit of the u24 length)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers carried in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Error = 0x04,

    Snapshot = 0x10,
    NotFound = 0x11,
    DocumentUpdated = 0x12,

    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Subscribe),
            0x02 => Ok(MessageType::Unsubscribe),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::Snapshot),
            0x11 => Ok(MessageType::NotFound),
            0x12 => Ok(MessageType::DocumentUpdated),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow a subject; replaces any previous subscription
    Subscribe { subject_id: SubjectId },
    /// Stop following the current subject
    Unsubscribe,
    /// Keepalive
    Ping { timestamp: u64 },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current stored document, sent right after a subscribe
    Snapshot { document: Document },
    /// The subscribed subject has no stored document
    NotFound { subject_id: SubjectId },
    /// A save landed for the subscribed subject
    DocumentUpdated { update: DocumentUpdate },
    Error {
        code: ErrorCode,
        message: String,
        subject_id: Option<SubjectId>,
    },
    Pong { timestamp: u64 },
}

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    StorageError,
    NotSubscribed,
}

/// Protocol codec for encoding/decoding frames
pub struct PushProtocol;

impl PushProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::Subscribe { .. } => MessageType::Subscribe,
            ClientMessage::Unsubscribe => MessageType::Unsubscribe,
            ClientMessage::Ping { .. } => MessageType::Ping,
        };
        encode_frame(msg_type, &serde_json::to_vec(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Snapshot { .. } => MessageType::Snapshot,
            ServerMessage::NotFound { .. } => MessageType::NotFound,
            ServerMessage::DocumentUpdated { .. } => MessageType::DocumentUpdated,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Pong { .. } => MessageType::Pong,
        };
        encode_frame(msg_type, &serde_json::to_vec(msg)?)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (_, payload) = decode_frame(data)?;
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (_, payload) = decode_frame(data)?;
        Ok(serde_json::from_slice(payload)?)
    }

    /// Create an error response message
    pub fn error_response(
        code: ErrorCode,
        message: impl Into<String>,
        subject_id: Option<SubjectId>,
    ) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
            subject_id,
        }
    }
}

fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

fn decode_frame(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat(
            "Message too short".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
