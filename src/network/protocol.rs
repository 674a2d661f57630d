//! Protocol Messages
//!
//! Wire format for client-broker communication over WebSocket.
//! Control messages are serialized as JSON for debugging ease; the flat frame
//! structs also have a binary (bincode) form.

use serde::{Deserialize, Serialize};

// =============================================================================
// FRAMES
// =============================================================================

/// One compressed outbound update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFrame {
    /// Stream sequence of the carried envelope
    pub sequence: u64,
    /// Codec used for `payload`
    pub encoding: String,
    /// Compressed envelope bytes
    pub payload: Vec<u8>,
}

/// One compressed inbound control intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFrame {
    /// Sending client
    pub client_id: String,
    /// Codec used for `payload`
    pub encoding: String,
    /// Compressed intent bytes
    pub payload: Vec<u8>,
}

/// Summary returned when a client closes its intent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntentStreamAck {
    /// Intents the broker accepted
    pub accepted: u64,
    /// Intents rejected, undecodable or timed out
    pub rejected: u64,
}

impl DiffFrame {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl IntentFrame {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection.
    Hello(HelloRequest),

    /// Compressed control intent.
    Intent(IntentFrame),

    /// Acknowledge a processed stream sequence.
    Ack { sequence: u64 },

    /// No more intents; the server answers with `IntentAck`.
    EndIntents,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Connection handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Requested client id (ignored when a token is required).
    #[serde(default)]
    pub client_id: Option<String>,
    /// HS256 token.
    #[serde(default)]
    pub token: Option<String>,
    /// Client version for compatibility checks.
    #[serde(default)]
    pub client_version: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Welcome(WelcomeInfo),

    /// Paced, compressed update.
    Diff(DiffFrame),

    /// Intent stream summary.
    IntentAck(IntentStreamAck),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ErrorInfo),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Handshake result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeInfo {
    /// Client id the connection is bound to (also the stream subscriber id).
    pub client_id: String,
    /// Codec used for diff and intent frames.
    pub encoding: String,
    /// Outbound frames per second.
    pub outbound_rate_hz: u32,
    /// Server version.
    pub server_version: String,
}

/// Error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// First message was not a hello.
    NotAuthenticated,
    /// Token has expired.
    TokenExpired,
    /// Invalid token (signature, format, claims).
    InvalidToken,
    /// Malformed message or unsupported encoding.
    InvalidArgument,
    /// The broker disconnected the client.
    PermissionDenied,
    /// The stream was cancelled.
    Canceled,
    /// The stream deadline passed.
    DeadlineExceeded,
    /// Server at capacity.
    ServerOverloaded,
    /// Transport failure.
    Unavailable,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error message with the given code.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorInfo {
            code,
            message: message.into(),
        })
    }
}
