//! Wire message types.
//!
//! Handshake requests/responses, close signals and data all travel on the
//! same ephemeral channel, so everything is one tagged `Message` enum.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::descriptor::{EndpointDescriptor, NodeId, NodeIdentity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ConnectionRequest(Handshake),
    ConnectionResponse(Handshake),
    Close(CloseSignal),
    /// Payload of the non-reliable stream discipline.
    Data(DataFrame),
    /// Opaque frame owned by the reliability engine.
    Reliable(DataFrame),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ConnectionRequest(_) => "connection_request",
            Message::ConnectionResponse(_) => "connection_response",
            Message::Close(_) => "close",
            Message::Data(_) => "data",
            Message::Reliable(_) => "reliable",
        }
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Message::Data(DataFrame {
            payload: payload.into(),
        })
    }

    pub fn reliable(payload: impl Into<Bytes>) -> Self {
        Message::Reliable(DataFrame {
            payload: payload.into(),
        })
    }

    pub fn close_request() -> Self {
        Message::Close(CloseSignal {
            kind: CloseKind::Request,
        })
    }

    pub fn close_ack() -> Self {
        Message::Close(CloseSignal {
            kind: CloseKind::Ack,
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Opaque admission token presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub subject: NodeId,
    #[serde(with = "base64_bytes")]
    pub token: Bytes,
}

/// Body shared by `ConnectionRequest` and `ConnectionResponse`.
///
/// Optional wire fields default when absent: current protocol version, no
/// credential, not reliable, direct transport not supported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Peers drop handshakes carrying any other version.
    #[serde(default = "current_version")]
    pub version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    /// The sender's ephemeral channel -- where the peer must send from now on.
    pub ephemeral: EndpointDescriptor,
    pub sender: NodeIdentity,
    #[serde(default)]
    pub reliable: bool,
    #[serde(default)]
    pub direct: bool,
    /// On responses: the initiator's ephemeral channel id being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

fn current_version() -> u16 {
    crate::PROTOCOL_VERSION
}

// ============================================================================
// Close
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseKind {
    Request,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignal {
    pub kind: CloseKind,
}

// ============================================================================
// Data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize/deserialize bytes as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
