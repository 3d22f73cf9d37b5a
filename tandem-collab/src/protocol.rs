//! Binary wire protocol between clients and the sync server.
//!
//! Every WebSocket binary message is one frame:
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ msg_type │ payload                                  │
//! │ 1 byte   │ variable                                 │
//! └──────────┴──────────────────────────────────────────┘
//! ```
//!
//! Payloads by type:
//! - `auth`, `welcome`, `peer-joined`: bincode (serde, standard config)
//! - `sync-step-1`: yrs v1 state vector
//! - `sync-step-2`, `update`: yrs v1 update
//! - `awareness`: 16-byte client id (session UUID) followed by a JSON blob
//! - `peer-left`: 16-byte session UUID
//! - `error`: 1-byte [`ErrorCode`] followed by a UTF-8 message
//! - `ping`, `pong`: empty

use serde::{Deserialize, Serialize};
use tandem_core::DocumentId;
use uuid::Uuid;

use crate::presence::color_for_session;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame from the client: document, user, token
    Auth = 0,
    /// Yrs state vector for the sync handshake
    SyncStep1 = 1,
    /// Updates the receiver is missing
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Ephemeral presence
    Awareness = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Auth accepted; carries the caller's own session info
    Welcome = 9,
    /// Rejection or violation report
    Error = 10,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Self::Auth,
            1 => Self::SyncStep1,
            2 => Self::SyncStep2,
            3 => Self::Update,
            4 => Self::Awareness,
            5 => Self::PeerJoined,
            6 => Self::PeerLeft,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::Welcome,
            10 => Self::Error,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Reason attached to an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    Unauthorized = 1,
    AuthTimeout = 2,
    Forbidden = 3,
    RoomFull = 4,
    ProtocolViolation = 5,
    MalformedOperation = 6,
    ReadOnly = 7,
    StoreUnavailable = 8,
    Internal = 9,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => Self::Unauthorized,
            2 => Self::AuthTimeout,
            3 => Self::Forbidden,
            4 => Self::RoomFull,
            5 => Self::ProtocolViolation,
            6 => Self::MalformedOperation,
            7 => Self::ReadOnly,
            8 => Self::StoreUnavailable,
            9 => Self::Internal,
            other => return Err(ProtocolError::UnknownErrorCode(other)),
        })
    }
}

/// Attach request carried by the `auth` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub document_id: DocumentId,
    pub user_id: String,
    pub token: String,
}

/// Session identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub session_id: Uuid,
    pub user_id: String,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
    pub read_only: bool,
}

impl PeerInfo {
    pub fn new(session_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            name: name.into(),
            color: color_for_session(session_id),
            read_only: false,
        }
    }
}

/// Presence update: last-write-wins per client id.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessUpdate {
    /// Session UUID of the owner
    pub client_id: Uuid,
    /// `null` means the presence was cleared
    pub state: serde_json::Value,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Auth(AuthRequest),
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(AwarenessUpdate),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    Ping,
    Pong,
    Welcome(PeerInfo),
    Error { code: ErrorCode, message: String },
}

impl Frame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Auth(_) => MessageType::Auth,
            Frame::SyncStep1(_) => MessageType::SyncStep1,
            Frame::SyncStep2(_) => MessageType::SyncStep2,
            Frame::Update(_) => MessageType::Update,
            Frame::Awareness(_) => MessageType::Awareness,
            Frame::PeerJoined(_) => MessageType::PeerJoined,
            Frame::PeerLeft(_) => MessageType::PeerLeft,
            Frame::Ping => MessageType::Ping,
            Frame::Pong => MessageType::Pong,
            Frame::Welcome(_) => MessageType::Welcome,
            Frame::Error { .. } => MessageType::Error,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![self.message_type() as u8];
        match self {
            Frame::Auth(req) => out.extend(encode_bincode(req)?),
            Frame::SyncStep1(bytes) | Frame::SyncStep2(bytes) | Frame::Update(bytes) => {
                out.extend_from_slice(bytes)
            }
            Frame::Awareness(update) => {
                out.extend_from_slice(update.client_id.as_bytes());
                let json = serde_json::to_vec(&update.state)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                out.extend(json);
            }
            Frame::PeerJoined(info) | Frame::Welcome(info) => out.extend(encode_bincode(info)?),
            Frame::PeerLeft(session_id) => out.extend_from_slice(session_id.as_bytes()),
            Frame::Ping | Frame::Pong => {}
            Frame::Error { code, message } => {
                out.push(*code as u8);
                out.extend_from_slice(message.as_bytes());
            }
        }
        Ok(out)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let frame = match MessageType::from_u8(tag)? {
            MessageType::Auth => Frame::Auth(decode_bincode(payload)?),
            MessageType::SyncStep1 => Frame::SyncStep1(payload.to_vec()),
            MessageType::SyncStep2 => Frame::SyncStep2(payload.to_vec()),
            MessageType::Update => Frame::Update(payload.to_vec()),
            MessageType::Awareness => {
                let (client_id, json) = split_uuid(payload)?;
                let state = serde_json::from_slice(json)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                Frame::Awareness(AwarenessUpdate { client_id, state })
            }
            MessageType::PeerJoined => Frame::PeerJoined(decode_bincode(payload)?),
            MessageType::PeerLeft => {
                let (session_id, rest) = split_uuid(payload)?;
                if !rest.is_empty() {
                    return Err(ProtocolError::Deserialization(
                        "trailing bytes after peer-left id".into(),
                    ));
                }
                Frame::PeerLeft(session_id)
            }
            MessageType::Ping => Frame::Ping,
            MessageType::Pong => Frame::Pong,
            MessageType::Welcome => Frame::Welcome(decode_bincode(payload)?),
            MessageType::Error => {
                let (&code, message) = payload
                    .split_first()
                    .ok_or_else(|| ProtocolError::Deserialization("missing error code".into()))?;
                Frame::Error {
                    code: ErrorCode::from_u8(code)?,
                    message: String::from_utf8_lossy(message).into_owned(),
                }
            }
        };
        Ok(frame)
    }
}

fn encode_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_bincode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn split_uuid(payload: &[u8]) -> Result<(Uuid, &[u8]), ProtocolError> {
    if payload.len() < 16 {
        return Err(ProtocolError::Deserialization(format!(
            "expected 16-byte client id, got {} bytes",
            payload.len()
        )));
    }
    let (id, rest) = payload.split_at(16);
    let id = Uuid::from_slice(id).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok((id, rest))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("Unknown error code {0}")]
    UnknownErrorCode(u8),
    #[error("Unexpected {got:?} frame while {state}")]
    UnexpectedFrame { got: MessageType, state: &'static str },
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
