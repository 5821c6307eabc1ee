//! Addressing value types -- channel descriptors, node identities, socket addresses.
//!
//! Identity is structural: a descriptor is `{namespace, channel id, channel type}`,
//! the human-readable name rides along but never takes part in equality.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::ProtocolError;

/// Ephemeral channel ids are 16 random bytes, hex encoded.
const EPHEMERAL_ID_BYTES: usize = 16;

// ============================================================================
// Node identity
// ============================================================================

/// Node identifier (SHA-256 of the node's public key or seed).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive a node id from public key material.
    pub fn from_public_key(key: &[u8]) -> Self {
        Self(Sha256::digest(key).into())
    }

    /// A fresh, random node id (for tests and throwaway nodes).
    pub fn random() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_public_key(&seed)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidNodeId(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ProtocolError::InvalidNodeId(format!("{} bytes", b.len())))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..12])
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Snapshot of a node as advertised during the handshake.
///
/// Two identities are the same node when their ids match; hints and
/// capabilities are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    /// Opaque routing hints (substrate-specific endpoint strings).
    #[serde(default)]
    pub routing_hints: Vec<String>,
    /// Advertised capabilities, e.g. "direct".
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl NodeIdentity {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            routing_hints: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.routing_hints.push(hint.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

// ============================================================================
// Channel descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Unicast,
    SecureUnicast,
    Propagate,
}

impl ChannelType {
    /// Secure channels require a credential on every handshake.
    pub fn requires_credential(&self) -> bool {
        matches!(self, ChannelType::SecureUnicast)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Unicast => "unicast",
            ChannelType::SecureUnicast => "secure_unicast",
            ChannelType::Propagate => "propagate",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An addressable logical channel inside an overlay namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    namespace_id: String,
    channel_id: String,
    channel_type: ChannelType,
    #[serde(default)]
    name: String,
}

impl EndpointDescriptor {
    pub fn new(
        namespace_id: impl Into<String>,
        channel_id: impl Into<String>,
        channel_type: ChannelType,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            channel_id: channel_id.into(),
            channel_type,
            name: String::new(),
        }
    }

    /// A fresh per-connection channel in `namespace_id`.
    pub fn ephemeral(namespace_id: impl Into<String>, channel_type: ChannelType) -> Self {
        let id: [u8; EPHEMERAL_ID_BYTES] = rand::random();
        Self::new(namespace_id, hex::encode(id), channel_type).with_name("ephemeral")
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A zero-length channel id cannot be bound or resolved.
    pub fn is_valid(&self) -> bool {
        !self.channel_id.is_empty()
    }

    /// Whether a resolved handle for `other` can serve this descriptor.
    pub fn matches(&self, other: &EndpointDescriptor) -> bool {
        self.channel_id == other.channel_id && self.channel_type == other.channel_type
    }
}

impl PartialEq for EndpointDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.namespace_id == other.namespace_id
            && self.channel_id == other.channel_id
            && self.channel_type == other.channel_type
    }
}

impl Eq for EndpointDescriptor {}

impl Hash for EndpointDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace_id.hash(state);
        self.channel_id.hash(state);
        self.channel_type.hash(state);
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({})",
            self.namespace_id, self.channel_id, self.channel_type
        )
    }
}

// ============================================================================
// Socket address
// ============================================================================

/// A connectable address: a descriptor, optionally pinned to one node.
///
/// Node ids are compared only when both addresses carry one; the hash covers
/// the descriptor alone so that pinned and unpinned forms land in the same
/// bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketAddress {
    pub descriptor: EndpointDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeIdentity>,
}

impl SocketAddress {
    pub fn new(descriptor: EndpointDescriptor) -> Self {
        Self {
            descriptor,
            node: None,
        }
    }

    pub fn pinned(descriptor: EndpointDescriptor, node: NodeIdentity) -> Self {
        Self {
            descriptor,
            node: Some(node),
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node.as_ref().map(|n| n.node_id)
    }
}

impl PartialEq for SocketAddress {
    fn eq(&self, other: &Self) -> bool {
        if self.descriptor != other.descriptor {
            return false;
        }
        match (self.node_id(), other.node_id()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl Eq for SocketAddress {}

impl Hash for SocketAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.descriptor.hash(state);
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}@{}", self.descriptor, node.node_id),
            None => write!(f, "{}", self.descriptor),
        }
    }
}

impl From<EndpointDescriptor> for SocketAddress {
    fn from(descriptor: EndpointDescriptor) -> Self {
        Self::new(descriptor)
    }
}
