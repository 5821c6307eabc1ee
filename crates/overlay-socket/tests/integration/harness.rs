//! Test harness for in-process overlay-socket integration tests.
//!
//! Provides TestNet (a shared memory substrate), TestNodeBuilder (settings,
//! credentials, engine) and TestNode (one identity plus its socket context),
//! and a FakeEngine whose backlog the test controls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use overlay_protocol::{ChannelType, EndpointDescriptor, Message, NodeId, NodeIdentity, SocketAddress};
use overlay_socket::channel::send_message;
use overlay_socket::memory::NetworkStats;
use overlay_socket::{
    Acceptor, Connection, ConnectionState, EngineFactory, EngineSettings, MemoryConfig,
    MemoryNetwork, ReliabilityEngine, SharedSecretCredentials, SocketContext, SocketSettings,
    TransportHandle,
};
use parking_lot::Mutex;

pub const NAMESPACE: &str = "it";

pub fn descriptor(id: &str, channel_type: ChannelType) -> EndpointDescriptor {
    EndpointDescriptor::new(NAMESPACE, id, channel_type)
}

pub struct TestNet {
    pub network: MemoryNetwork,
}

#[allow(dead_code)]
impl TestNet {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            network: MemoryNetwork::new(config),
        }
    }

    pub fn node(&self, name: &str) -> TestNodeBuilder<'_> {
        TestNodeBuilder::new(self, name)
    }

    pub fn stats(&self) -> NetworkStats {
        self.network.stats()
    }
}

/// Builder for configuring a TestNode.
pub struct TestNodeBuilder<'a> {
    net: &'a TestNet,
    name: String,
    settings: SocketSettings,
    secret: Option<String>,
    engines: Option<Arc<dyn EngineFactory>>,
}

#[allow(dead_code)]
impl<'a> TestNodeBuilder<'a> {
    fn new(net: &'a TestNet, name: &str) -> Self {
        Self {
            net,
            name: name.to_string(),
            settings: SocketSettings::default(),
            secret: None,
            engines: None,
        }
    }

    pub fn reliable(mut self, reliable: bool) -> Self {
        self.settings.reliable = reliable;
        self
    }

    pub fn direct(mut self, direct: bool) -> Self {
        self.settings.direct = direct;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.settings.close_timeout = timeout;
        self
    }

    pub fn backlog(mut self, backlog: usize) -> Self {
        self.settings.backlog = backlog;
        self
    }

    pub fn input_queue_capacity(mut self, capacity: usize) -> Self {
        self.settings.input_queue_capacity = capacity;
        self
    }

    pub fn output_buffer_max(mut self, size: usize) -> Self {
        self.settings.output_buffer_max = size;
        self
    }

    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    pub fn engines(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn build(self) -> TestNode {
        let identity = NodeIdentity::new(NodeId::random()).with_hint(self.name);
        let mut ctx = SocketContext::new(
            Arc::new(self.net.network.node(identity.clone())),
            identity.clone(),
            NAMESPACE,
        )
        .with_settings(self.settings);
        if let Some(secret) = self.secret {
            ctx = ctx.with_credentials(Arc::new(SharedSecretCredentials::new(
                secret,
                identity.node_id,
            )));
        }
        if let Some(engines) = self.engines {
            ctx = ctx.with_engines(engines);
        }
        TestNode { identity, ctx }
    }
}

/// One node: an identity and the context its sockets are built from.
pub struct TestNode {
    pub identity: NodeIdentity,
    pub ctx: SocketContext,
}

#[allow(dead_code)]
impl TestNode {
    pub fn listen(&self, id: &str) -> anyhow::Result<Acceptor> {
        Ok(Acceptor::bind(
            self.ctx.clone(),
            descriptor(id, ChannelType::Unicast),
        )?)
    }

    pub fn listen_on(&self, descriptor: EndpointDescriptor) -> anyhow::Result<Acceptor> {
        Ok(Acceptor::bind(self.ctx.clone(), descriptor)?)
    }

    /// Well-known `id` on this node, pinned to it.
    pub fn address(&self, id: &str) -> SocketAddress {
        SocketAddress::pinned(descriptor(id, ChannelType::Unicast), self.identity.clone())
    }

    pub fn connection(&self) -> Connection {
        Connection::new(self.ctx.clone())
    }

    pub async fn dial(
        &self,
        target: &SocketAddress,
        timeout: Duration,
    ) -> overlay_socket::Result<Connection> {
        Connection::dial(self.ctx.clone(), target, timeout).await
    }
}

/// Listen on `id` at `server`, dial it from `client`, and accept.
/// Returns `(client side, server side, acceptor)`.
pub async fn connected_pair(
    client: &TestNode,
    server: &TestNode,
    id: &str,
) -> anyhow::Result<(Connection, Connection, Acceptor)> {
    let acceptor = server.listen(id)?;
    let target = server.address(id);
    let (dialed, accepted) = tokio::join!(
        client.dial(&target, Duration::from_secs(5)),
        acceptor.accept(Duration::from_secs(5)),
    );
    Ok((dialed?, accepted?, acceptor))
}

/// Read until `len` bytes arrived, end-of-stream, or `timeout` on one read.
pub async fn read_exact(conn: &Connection, len: usize, timeout: Duration) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 1024];
    while out.len() < len {
        let n = conn.read(&mut buf, timeout).await?;
        if n == 0 {
            anyhow::bail!("end of stream after {} of {} bytes", out.len(), len);
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Read everything up to end-of-stream.
pub async fn read_to_end(conn: &Connection, timeout: Duration) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = conn.read(&mut buf, timeout).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Poll until `conn` reaches `state`, or fail after `timeout`.
pub async fn wait_state(
    conn: &Connection,
    state: ConnectionState,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if conn.state() == state {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {} (have {})", state, conn.state());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Fake reliability engine
// ============================================================================

/// Records every send, forwards it unchanged, and reports whatever backlog
/// the test sets.
pub struct FakeEngine {
    pub sent: Mutex<Vec<Bytes>>,
    pub pending: AtomicUsize,
    pub closed: AtomicBool,
    transport: Arc<dyn TransportHandle>,
}

#[allow(dead_code)]
impl FakeEngine {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::SeqCst);
    }
}

impl ReliabilityEngine for FakeEngine {
    fn send(&self, payload: Bytes) -> overlay_socket::Result<()> {
        self.sent.lock().push(payload.clone());
        send_message(&*self.transport, &Message::reliable(payload))
    }

    fn receive(&self, frame: Bytes) -> Vec<Bytes> {
        vec![frame]
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeEngineFactory {
    pub engines: Mutex<Vec<Arc<FakeEngine>>>,
}

#[allow(dead_code)]
impl FakeEngineFactory {
    /// The most recently created engine.
    pub fn last(&self) -> Option<Arc<FakeEngine>> {
        self.engines.lock().last().cloned()
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create(
        &self,
        transport: Arc<dyn TransportHandle>,
        _settings: &EngineSettings,
    ) -> overlay_socket::Result<Arc<dyn ReliabilityEngine>> {
        let engine = Arc::new(FakeEngine {
            sent: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            transport,
        });
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }
}
