//! Channel service seam -- the message substrate this layer is built on.
//!
//! The substrate delivers discrete, size-bounded messages on a best-effort
//! basis. It binds input channels to descriptors (push delivery through a
//! listener callback) and resolves descriptors to transport handles
//! asynchronously. Resolution may report nothing, once, or several times;
//! callers de-duplicate.

use bytes::Bytes;
use overlay_protocol::{encode_message, EndpointDescriptor, Message, NodeId, NodeIdentity};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SocketError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("no route to {0}")]
    Unresolvable(String),
    #[error("descriptor already bound: {0}")]
    DescriptorInUse(String),
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("channel service unavailable: {0}")]
    Unavailable(String),
}

/// Receives every message delivered to an input channel.
///
/// Called serially per channel, possibly concurrently across channels.
/// Implementations must not block.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, frame: Bytes);
}

impl<F> MessageListener for F
where
    F: Fn(Bytes) + Send + Sync + 'static,
{
    fn on_message(&self, frame: Bytes) {
        self(frame)
    }
}

/// Receives resolved transport handles for an outstanding resolution.
pub trait ResolutionListener: Send + Sync + 'static {
    fn on_resolved(&self, handle: Arc<dyn TransportHandle>);
}

/// A resolved, reusable send capability to one destination.
pub trait TransportHandle: Send + Sync + fmt::Debug {
    /// The descriptor this handle delivers to.
    fn destination(&self) -> &EndpointDescriptor;

    /// Send one message. Success means "handed to the substrate", not delivered.
    fn send(&self, frame: Bytes) -> Result<(), ChannelError>;

    /// Largest frame `send` accepts.
    fn max_message_size(&self) -> usize;

    /// Release the handle. Idempotent.
    fn close(&self);

    /// Whether this handle bypasses substrate routing.
    fn is_direct(&self) -> bool {
        false
    }
}

/// A bound inbound channel. Dropping it without `close` leaks the binding
/// until the service notices; callers close explicitly.
pub trait InputChannel: Send + Sync {
    fn descriptor(&self) -> &EndpointDescriptor;

    /// Unbind. Idempotent; no delivery starts after it returns.
    fn close(&self);
}

/// The substrate collaborator.
pub trait ChannelService: Send + Sync + 'static {
    fn create_input_channel(
        &self,
        descriptor: &EndpointDescriptor,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn InputChannel>, ChannelError>;

    /// Start resolving `descriptor` (optionally pinned to `target`). Results
    /// arrive on `listener` zero or more times.
    fn resolve_output_channel(
        &self,
        descriptor: &EndpointDescriptor,
        target: Option<NodeId>,
        listener: Arc<dyn ResolutionListener>,
    ) -> Result<(), ChannelError>;

    /// A handle that reaches `node` without substrate routing, if possible.
    fn direct_transport(
        &self,
        descriptor: &EndpointDescriptor,
        node: &NodeIdentity,
    ) -> Result<Arc<dyn TransportHandle>, ChannelError>;
}

/// Encode `msg` and send it as one frame on `handle`.
pub fn send_message(handle: &dyn TransportHandle, msg: &Message) -> Result<()> {
    let frame = encode_message(msg)?;
    let max = handle.max_message_size();
    if frame.len() > max {
        return Err(SocketError::TransportFailure(ChannelError::MessageTooLarge {
            size: frame.len(),
            max,
        }));
    }
    handle.send(frame)?;
    Ok(())
}
