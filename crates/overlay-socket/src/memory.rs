//! In-process channel service.
//!
//! A `MemoryNetwork` is the shared substrate; every node gets its own
//! `MemoryChannelService` view of it. Each bound input channel owns an
//! unbounded queue drained by one delivery task, so delivery is serial per
//! channel and concurrent across channels. Resolution runs on a spawned task
//! and reports a handle `1 + redundant_resolutions` times when the
//! descriptor is bound, and stays silent otherwise.
//!
//! Fault model (applied per routed send):
//!
//! | Fault       | Knob        |
//! |-------------|-------------|
//! | Loss        | `loss`      |
//! | Duplication | `duplicate` |
//!
//! Direct transports bypass the fault model.

use bytes::Bytes;
use overlay_protocol::{EndpointDescriptor, NodeId, NodeIdentity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::channel::{
    ChannelError, ChannelService, InputChannel, MessageListener, ResolutionListener,
    TransportHandle,
};

/// Fault and sizing knobs for the in-memory substrate.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Probability in `[0.0, 1.0]` that a routed frame is silently dropped.
    pub loss: f64,
    /// Probability in `[0.0, 1.0]` that a routed frame is delivered twice.
    pub duplicate: f64,
    /// Extra resolution events fired after the first.
    pub redundant_resolutions: usize,
    /// Largest frame a transport handle accepts.
    pub max_message_size: usize,
    /// Whether `direct_transport` is offered.
    pub direct: bool,
    /// Delay before a resolution is reported.
    pub resolution_delay: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            redundant_resolutions: 0,
            max_message_size: 64 * 1024,
            direct: false,
            resolution_delay: Duration::ZERO,
        }
    }
}

/// Counters for everything the substrate routed.
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    resolutions: AtomicU64,
}

/// Point-in-time copy of the substrate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Frames accepted by `send` (including ones later dropped).
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    /// Resolution events reported to listeners.
    pub resolutions: u64,
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    owner: NodeId,
}

struct NetworkInner {
    config: MemoryConfig,
    routes: RwLock<HashMap<EndpointDescriptor, Route>>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Shared in-process substrate.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                routes: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// A channel service acting on behalf of `identity`.
    pub fn node(&self, identity: NodeIdentity) -> MemoryChannelService {
        MemoryChannelService {
            network: self.clone(),
            identity,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> NetworkStats {
        let c = &self.inner.counters;
        NetworkStats {
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            duplicated: c.duplicated.load(Ordering::Relaxed),
            resolutions: c.resolutions.load(Ordering::Relaxed),
        }
    }

    /// Number of currently bound descriptors.
    pub fn bound_count(&self) -> usize {
        self.inner.routes.read().len()
    }

    pub fn is_bound(&self, descriptor: &EndpointDescriptor) -> bool {
        self.inner.routes.read().contains_key(descriptor)
    }

    fn owner_of(&self, descriptor: &EndpointDescriptor) -> Option<NodeId> {
        self.inner.routes.read().get(descriptor).map(|r| r.owner)
    }

    fn unbind(&self, descriptor: &EndpointDescriptor, id: u64) {
        let mut routes = self.inner.routes.write();
        if routes.get(descriptor).is_some_and(|r| r.id == id) {
            routes.remove(descriptor);
        }
    }

    fn deliver(
        &self,
        descriptor: &EndpointDescriptor,
        frame: Bytes,
        faults: bool,
    ) -> Result<(), ChannelError> {
        let counters = &self.inner.counters;
        let config = &self.inner.config;
        let routes = self.inner.routes.read();
        let route = routes.get(descriptor).ok_or(ChannelError::Closed)?;
        counters.sent.fetch_add(1, Ordering::Relaxed);

        if faults && config.loss > 0.0 && rand::random::<f64>() < config.loss {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let twice = faults && config.duplicate > 0.0 && rand::random::<f64>() < config.duplicate;
        if twice {
            counters.duplicated.fetch_add(1, Ordering::Relaxed);
            route
                .tx
                .send(frame.clone())
                .map_err(|_| ChannelError::Closed)?;
        }
        route.tx.send(frame).map_err(|_| ChannelError::Closed)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("bound", &self.bound_count())
            .field("stats", &self.stats())
            .finish()
    }
}

/// One node's view of a `MemoryNetwork`.
#[derive(Clone)]
pub struct MemoryChannelService {
    network: MemoryNetwork,
    identity: NodeIdentity,
}

impl MemoryChannelService {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn transport(
        &self,
        destination: &EndpointDescriptor,
        direct: bool,
    ) -> Arc<dyn TransportHandle> {
        Arc::new(MemoryTransport {
            destination: destination.clone(),
            network: self.network.clone(),
            max_message_size: self.network.inner.config.max_message_size,
            direct,
            closed: AtomicBool::new(false),
        })
    }
}

fn runtime() -> Result<Handle, ChannelError> {
    Handle::try_current().map_err(|e| ChannelError::Unavailable(e.to_string()))
}

impl ChannelService for MemoryChannelService {
    fn create_input_channel(
        &self,
        descriptor: &EndpointDescriptor,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn InputChannel>, ChannelError> {
        if !descriptor.is_valid() {
            return Err(ChannelError::Unresolvable(descriptor.to_string()));
        }
        let handle = runtime()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let id = self.network.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut routes = self.network.inner.routes.write();
            if routes.contains_key(descriptor) {
                return Err(ChannelError::DescriptorInUse(descriptor.to_string()));
            }
            routes.insert(
                descriptor.clone(),
                Route {
                    id,
                    tx,
                    owner: self.identity.node_id,
                },
            );
        }

        let closed = Arc::new(AtomicBool::new(false));
        let stop = closed.clone();
        handle.spawn(async move {
            while let Some(frame) = rx.recv().await {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                listener.on_message(frame);
            }
        });

        tracing::debug!(channel = %descriptor, node = ?self.identity.node_id, "input channel bound");
        Ok(Box::new(MemoryInputChannel {
            descriptor: descriptor.clone(),
            id,
            network: self.network.clone(),
            closed,
        }))
    }

    fn resolve_output_channel(
        &self,
        descriptor: &EndpointDescriptor,
        target: Option<NodeId>,
        listener: Arc<dyn ResolutionListener>,
    ) -> Result<(), ChannelError> {
        if !descriptor.is_valid() {
            return Err(ChannelError::Unresolvable(descriptor.to_string()));
        }
        let handle = runtime()?;
        let service = self.clone();
        let descriptor = descriptor.clone();

        handle.spawn(async move {
            let config = &service.network.inner.config;
            if !config.resolution_delay.is_zero() {
                tokio::time::sleep(config.resolution_delay).await;
            }
            let owner = match service.network.owner_of(&descriptor) {
                Some(owner) => owner,
                None => {
                    tracing::debug!(channel = %descriptor, "nothing advertised, resolution silent");
                    return;
                }
            };
            if target.is_some_and(|t| t != owner) {
                tracing::debug!(channel = %descriptor, "advertised by another node, resolution silent");
                return;
            }
            for _ in 0..=config.redundant_resolutions {
                service
                    .network
                    .inner
                    .counters
                    .resolutions
                    .fetch_add(1, Ordering::Relaxed);
                listener.on_resolved(service.transport(&descriptor, false));
            }
        });
        Ok(())
    }

    fn direct_transport(
        &self,
        descriptor: &EndpointDescriptor,
        node: &NodeIdentity,
    ) -> Result<Arc<dyn TransportHandle>, ChannelError> {
        if !self.network.inner.config.direct {
            return Err(ChannelError::Unavailable("direct transport disabled".into()));
        }
        match self.network.owner_of(descriptor) {
            Some(owner) if owner == node.node_id => Ok(self.transport(descriptor, true)),
            _ => Err(ChannelError::Unresolvable(descriptor.to_string())),
        }
    }
}

struct MemoryInputChannel {
    descriptor: EndpointDescriptor,
    id: u64,
    network: MemoryNetwork,
    closed: Arc<AtomicBool>,
}

impl InputChannel for MemoryInputChannel {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the route's sender ends the delivery task.
        self.network.unbind(&self.descriptor, self.id);
        tracing::debug!(channel = %self.descriptor, "input channel closed");
    }
}

impl Drop for MemoryInputChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
struct MemoryTransport {
    destination: EndpointDescriptor,
    network: MemoryNetwork,
    max_message_size: usize,
    direct: bool,
    closed: AtomicBool,
}

impl TransportHandle for MemoryTransport {
    fn destination(&self) -> &EndpointDescriptor {
        &self.destination
    }

    fn send(&self, frame: Bytes) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if frame.len() > self.max_message_size {
            return Err(ChannelError::MessageTooLarge {
                size: frame.len(),
                max: self.max_message_size,
            });
        }
        self.network.deliver(&self.destination, frame, !self.direct)
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_direct(&self) -> bool {
        self.direct
    }
}
