//! Overlay Protocol -- descriptors, wire types, message codec.
//!
//! Every transport message is one [`Message`].
//! 4-byte big-endian length prefix + serde JSON.

pub mod codec;
pub mod descriptor;
pub mod messages;
pub mod params;

pub use codec::{data_capacity, decode_message, encode_message, MessageCodec};
pub use descriptor::{ChannelType, EndpointDescriptor, NodeId, NodeIdentity, SocketAddress};
pub use messages::*;
pub use params::{ProtocolParams, CURRENT_PARAMS, PARAMS_V1};

/// Wire protocol version carried in every `Handshake`.
pub const PROTOCOL_VERSION: u16 = PARAMS_V1.version;

/// Hard ceiling on a single encoded message, whatever the transport allows.
pub const MAX_MESSAGE_BYTES: usize = PARAMS_V1.max_message_bytes;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
