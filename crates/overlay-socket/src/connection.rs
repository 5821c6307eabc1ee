//! Connection -- handshake state machine, demultiplexer and close protocol.
//!
//! Every connection owns one ephemeral input channel. Handshake responses,
//! close signals and data for the connection all arrive on it, and the
//! `Dispatcher` classifies them in this order:
//!
//! 1. `Close` request / ack; a request during connect waits for `Connected`
//! 2. `ConnectionResponse`, only while `Connecting`
//! 3. `Data` / `Reliable`, held until the link exists, then delivered
//!
//! State transitions:
//!
//! ```text
//! Unbound --bind--> Bound --connect--> Connecting --response--> Connected
//!                     ^                    |                       |
//!                     +------ timeout -----+                close / remote close
//!                                                                  v
//!                                                   Closed <--- Closing
//! ```
//!
//! Responder-side connections are built by the acceptor and go from Bound
//! straight to Connected once their response has been handed to the
//! substrate.

use bytes::Bytes;
use overlay_protocol::{
    data_capacity, decode_message, ChannelType, CloseKind, EndpointDescriptor, Handshake, Message,
    NodeIdentity, SocketAddress, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{send_message, ChannelError, InputChannel, MessageListener, TransportHandle};
use crate::error::{Result, SocketError};
use crate::reliable::ReliabilityEngine;
use crate::resolve::resolve_transport;
use crate::stream::{InputStream, OutputStream};
use crate::time::{deadline_after, wait_until};
use crate::SocketContext;

/// How often close linger re-checks the engine's unacknowledged count.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Bound,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unbound => "unbound",
            ConnectionState::Bound => "bound",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Link: everything that exists once the peer is known
// ============================================================================

enum Discipline {
    Unreliable(OutputStream),
    Reliable(Arc<dyn ReliabilityEngine>),
}

struct Link {
    remote: NodeIdentity,
    remote_ephemeral: EndpointDescriptor,
    transport: Arc<dyn TransportHandle>,
    input: InputStream,
    discipline: Discipline,
    writes_closed: AtomicBool,
}

impl Link {
    fn is_reliable(&self) -> bool {
        matches!(self.discipline, Discipline::Reliable(_))
    }

    fn deliver(&self, msg: Message) {
        match (msg, &self.discipline) {
            (Message::Data(frame), Discipline::Unreliable(_)) => {
                self.input.enqueue(frame.payload);
            }
            (Message::Reliable(frame), Discipline::Reliable(engine)) => {
                for payload in engine.receive(frame.payload) {
                    self.input.enqueue(payload);
                }
            }
            (other, _) => {
                tracing::debug!(kind = other.kind(), "frame does not match negotiated mode, ignored")
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.writes_closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        match &self.discipline {
            Discipline::Unreliable(out) => out.write(data),
            Discipline::Reliable(_) if data.is_empty() => Ok(()),
            Discipline::Reliable(engine) => engine.send(Bytes::copy_from_slice(data)),
        }
    }

    fn flush(&self) -> Result<()> {
        if self.writes_closed.load(Ordering::Acquire) {
            return Err(SocketError::Closed);
        }
        match &self.discipline {
            Discipline::Unreliable(out) => out.flush(),
            Discipline::Reliable(_) => Ok(()),
        }
    }

    /// Refuse further writes, discarding anything still buffered.
    fn hard_close_output(&self) {
        self.writes_closed.store(true, Ordering::Release);
        if let Discipline::Unreliable(out) = &self.discipline {
            out.hard_close();
        }
    }

    fn shutdown(&self) {
        self.hard_close_output();
        if let Discipline::Reliable(engine) = &self.discipline {
            engine.close();
        }
        self.transport.close();
    }
}

async fn drain(engine: &dyn ReliabilityEngine) {
    while engine.pending() > 0 {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

/// Admission check shared by both ends of the handshake. The version must
/// match ours, a presented credential must name the sender and validate, and
/// secure channels require one.
pub(crate) fn check_admission(
    ctx: &SocketContext,
    handshake: &Handshake,
    secure: bool,
) -> Result<()> {
    if handshake.version != PROTOCOL_VERSION {
        return Err(SocketError::HandshakeRejected("protocol version mismatch"));
    }
    match &handshake.credential {
        Some(credential) if credential.subject != handshake.sender.node_id => {
            Err(SocketError::HandshakeRejected("credential names another node"))
        }
        Some(credential) if !ctx.credentials.validate(credential) => {
            Err(SocketError::HandshakeRejected("credential invalid"))
        }
        None if secure => Err(SocketError::HandshakeRejected("secure channel without credential")),
        _ => Ok(()),
    }
}

/// Direct path when both sides offer it, otherwise resolve `ephemeral`.
async fn open_transport(
    ctx: &SocketContext,
    ephemeral: &EndpointDescriptor,
    node: &NodeIdentity,
    peer_direct: bool,
    deadline: Option<Instant>,
    operation: &'static str,
) -> Result<Arc<dyn TransportHandle>> {
    if ctx.settings.direct && peer_direct {
        match ctx.channels.direct_transport(ephemeral, node) {
            Ok(transport) => return Ok(transport),
            Err(e) => tracing::debug!(error = %e, "direct transport unavailable, resolving"),
        }
    }
    resolve_transport(ctx, ephemeral, Some(node.node_id), deadline, operation).await
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Default)]
struct HandshakeState {
    target: Option<overlay_protocol::NodeId>,
    response: Option<Handshake>,
}

#[derive(Default)]
struct CloseState {
    request_sent: bool,
    ack_received: bool,
}

struct Inner {
    ctx: SocketContext,
    state: Mutex<ConnectionState>,
    local: Mutex<Option<EndpointDescriptor>>,
    channel: Mutex<Option<Box<dyn InputChannel>>>,
    handshake: Mutex<HandshakeState>,
    handshake_event: Notify,
    close: Mutex<CloseState>,
    close_event: Notify,
    link: OnceLock<Link>,
    /// Data that arrived before the link existed.
    held: Mutex<VecDeque<Message>>,
    /// A close request that arrived while `Connecting`; replayed once connected.
    close_pending: AtomicBool,
    /// Set once `close()` has been called on this end.
    closed_locally: AtomicBool,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
    }

    fn local_descriptor(&self) -> Option<EndpointDescriptor> {
        self.local.lock().clone()
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Close(signal) => match signal.kind {
                CloseKind::Request => self.on_close_request(),
                CloseKind::Ack => {
                    self.close.lock().ack_received = true;
                    self.close_event.notify_waiters();
                }
            },
            Message::ConnectionResponse(response) => self.on_response(response),
            Message::ConnectionRequest(_) => {
                tracing::debug!("connection request on an ephemeral channel ignored")
            }
            data => self.on_data(data),
        }
    }

    fn on_response(&self, response: Handshake) {
        let state = self.state();
        if state != ConnectionState::Connecting {
            tracing::debug!(%state, "connection response outside connect ignored");
            return;
        }
        let Some(local) = self.local_descriptor() else {
            return;
        };
        if response
            .reply_to
            .as_deref()
            .is_some_and(|id| id != local.channel_id())
        {
            tracing::debug!("connection response for another channel ignored");
            return;
        }
        if let Err(e) = check_admission(&self.ctx, &response, local.channel_type().requires_credential()) {
            tracing::debug!(sender = ?response.sender.node_id, error = %e, "connection response ignored");
            return;
        }

        let mut handshake = self.handshake.lock();
        if handshake
            .target
            .is_some_and(|target| target != response.sender.node_id)
        {
            tracing::debug!(
                sender = ?response.sender.node_id,
                "connection response from unexpected node ignored"
            );
            return;
        }
        if handshake.response.is_some() {
            tracing::debug!("duplicate connection response ignored");
            return;
        }
        handshake.response = Some(response);
        drop(handshake);
        self.handshake_event.notify_waiters();
    }

    fn on_data(&self, msg: Message) {
        let mut held = self.held.lock();
        if let Some(link) = self.link.get() {
            link.deliver(msg);
            return;
        }
        match self.state() {
            ConnectionState::Bound | ConnectionState::Connecting => {
                if held.len() < self.ctx.settings.input_queue_capacity {
                    held.push_back(msg);
                } else {
                    tracing::debug!("early data dropped, hold queue full");
                }
            }
            state => tracing::debug!(%state, "data without a link ignored"),
        }
    }

    fn on_close_request(self: &Arc<Self>) {
        let (previous, link) = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == ConnectionState::Connecting {
                // Replayed by `establish` once connected.
                self.close_pending.store(true, Ordering::Release);
                tracing::debug!("close request during connect, deferred");
                return;
            }
            let Some(link) = self.link.get() else {
                tracing::debug!(state = %previous, "close request without a link ignored");
                return;
            };
            if previous == ConnectionState::Connected {
                *state = ConnectionState::Closing;
            }
            (previous, link)
        };

        match previous {
            ConnectionState::Connected => {
                tracing::info!(remote = %link.remote.node_id, "peer closed connection");
                link.input.soft_close();
                link.hard_close_output();
                let inner = self.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move { inner.finish_remote_close().await });
                    }
                    Err(_) => {
                        inner.send_signal(link, Message::close_ack());
                        inner.set_state(ConnectionState::Closed);
                        inner.release();
                    }
                }
            }
            ConnectionState::Closing => {
                // Simultaneous close: ack now, keep waiting for ours.
                link.input.soft_close();
                self.send_signal(link, Message::close_ack());
            }
            state => tracing::debug!(%state, "close request ignored"),
        }
    }

    async fn finish_remote_close(self: Arc<Self>) {
        if let Some(link) = self.link.get() {
            if let Discipline::Reliable(engine) = &link.discipline {
                let deadline = deadline_after(self.ctx.settings.close_timeout);
                if wait_until(deadline, drain(engine.as_ref()), "close").await.is_err() {
                    tracing::debug!(pending = engine.pending(), "acking close with data unacknowledged");
                }
            }
            self.send_signal(link, Message::close_ack());
        }
        self.set_state(ConnectionState::Closed);
        self.release();
        tracing::debug!("remote close complete");
    }

    fn send_signal(&self, link: &Link, msg: Message) {
        if let Err(e) = send_message(&*link.transport, &msg) {
            tracing::debug!(error = %e, kind = msg.kind(), "close signal not sent");
        }
    }

    /// Send our close request at most once. Returns whether it went out.
    fn send_close_request(&self, link: &Link) -> bool {
        let mut close = self.close.lock();
        if close.request_sent {
            return false;
        }
        close.request_sent = true;
        drop(close);
        match send_message(&*link.transport, &Message::close_request()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "close request not sent");
                false
            }
        }
    }

    async fn wait_close_ack(&self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let notified = self.close_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.close.lock().ack_received || self.state() == ConnectionState::Closed {
                return Ok(());
            }
            wait_until(deadline, notified, "close").await?;
        }
    }

    async fn wait_response(&self, deadline: Option<Instant>) -> Result<Handshake> {
        loop {
            let notified = self.handshake_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() != ConnectionState::Connecting {
                return Err(SocketError::Closed);
            }
            if let Some(response) = self.handshake.lock().response.take() {
                return Ok(response);
            }
            wait_until(deadline, notified, "connect").await?;
        }
    }

    /// Resolves once the connection reaches `Closed`.
    async fn closed(&self) {
        loop {
            let notified = self.close_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Run a close request deferred during connect. Call after `Connected`.
    fn replay_pending_close(self: &Arc<Self>) {
        if self.close_pending.swap(false, Ordering::AcqRel) {
            self.on_close_request();
        }
    }

    async fn establish(
        self: &Arc<Self>,
        address: &SocketAddress,
        local: &EndpointDescriptor,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let well_known =
            resolve_transport(ctx, &address.descriptor, address.node_id(), deadline, "connect")
                .await?;

        let request = Handshake {
            version: PROTOCOL_VERSION,
            credential: ctx.credentials.current(),
            ephemeral: local.clone(),
            sender: ctx.identity.clone(),
            reliable: ctx.settings.reliable,
            direct: ctx.settings.direct,
            reply_to: None,
        };
        let response = match send_message(&*well_known, &Message::ConnectionRequest(request)) {
            Ok(()) => self.wait_response(deadline).await,
            Err(e) => Err(e),
        };
        // Everything after the request travels on ephemeral channels.
        well_known.close();
        let response = response?;

        let transport = open_transport(
            ctx,
            &response.ephemeral,
            &response.sender,
            response.direct,
            deadline,
            "connect",
        )
        .await?;
        self.install_link(
            response.sender.clone(),
            response.ephemeral.clone(),
            transport,
            response.reliable,
        )?;

        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            drop(state);
            self.release();
            return Err(SocketError::Closed);
        }
        *state = ConnectionState::Connected;
        drop(state);

        tracing::info!(
            local = %local,
            remote = %response.ephemeral,
            node = ?response.sender.node_id,
            reliable = response.reliable,
            "connected"
        );
        self.replay_pending_close();
        Ok(())
    }

    fn abandon_connect(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Bound;
            }
        }
        *self.handshake.lock() = HandshakeState::default();
        self.held.lock().clear();
        self.close_pending.store(false, Ordering::Release);
    }

    fn install_link(
        &self,
        remote: NodeIdentity,
        remote_ephemeral: EndpointDescriptor,
        transport: Arc<dyn TransportHandle>,
        reliable: bool,
    ) -> Result<()> {
        let settings = &self.ctx.settings;
        let (input, discipline) = if reliable {
            match self.ctx.engines.create(transport.clone(), &settings.engine) {
                Ok(engine) => (InputStream::unbounded(), Discipline::Reliable(engine)),
                Err(e) => {
                    transport.close();
                    return Err(e);
                }
            }
        } else {
            if data_capacity(transport.max_message_size()) == 0 {
                transport.close();
                return Err(SocketError::invalid(format!(
                    "transport message size {} too small for data frames",
                    transport.max_message_size()
                )));
            }
            (
                InputStream::bounded(settings.input_queue_capacity),
                Discipline::Unreliable(OutputStream::for_transport(
                    transport.clone(),
                    settings.output_buffer_max,
                )),
            )
        };
        let link = Link {
            remote,
            remote_ephemeral,
            transport,
            input,
            discipline,
            writes_closed: AtomicBool::new(false),
        };

        let mut held = self.held.lock();
        if let Err(link) = self.link.set(link) {
            link.shutdown();
            return Err(SocketError::invalid("connection already has a transport"));
        }
        if let Some(link) = self.link.get() {
            for msg in held.drain(..) {
                link.deliver(msg);
            }
        }
        Ok(())
    }

    /// Transport failure while connected: tear down without a close handshake.
    fn abort(&self, error: &ChannelError) {
        tracing::warn!(error = %error, "transport failed, tearing connection down");
        self.set_state(ConnectionState::Closed);
        if let Some(link) = self.link.get() {
            link.input.soft_close();
        }
        self.release();
    }

    /// Release both channels. Idempotent.
    fn release(&self) {
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        if let Some(link) = self.link.get() {
            link.shutdown();
        }
        self.handshake_event.notify_waiters();
        self.close_event.notify_waiters();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Delivery callback for the ephemeral channel.
struct Dispatcher {
    inner: Weak<Inner>,
}

impl MessageListener for Dispatcher {
    fn on_message(&self, frame: Bytes) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match decode_message(&frame) {
            Ok(msg) => inner.dispatch(msg),
            Err(e) => tracing::debug!(error = %e, "undecodable frame dropped"),
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// One end of a virtual circuit. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(ctx: SocketContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                state: Mutex::new(ConnectionState::Unbound),
                local: Mutex::new(None),
                channel: Mutex::new(None),
                handshake: Mutex::new(HandshakeState::default()),
                handshake_event: Notify::new(),
                close: Mutex::new(CloseState::default()),
                close_event: Notify::new(),
                link: OnceLock::new(),
                held: Mutex::new(VecDeque::new()),
                close_pending: AtomicBool::new(false),
                closed_locally: AtomicBool::new(false),
            }),
        }
    }

    /// Bind a fresh unicast ephemeral channel.
    pub fn bind(&self) -> Result<()> {
        self.bind_with_type(ChannelType::Unicast)
    }

    pub fn bind_with_type(&self, channel_type: ChannelType) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        match *state {
            ConnectionState::Unbound => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(SocketError::Closed),
            _ => return Err(SocketError::AlreadyBound),
        }

        let descriptor = EndpointDescriptor::ephemeral(inner.ctx.namespace_id.clone(), channel_type);
        let listener = Arc::new(Dispatcher {
            inner: Arc::downgrade(inner),
        });
        let channel = inner.ctx.channels.create_input_channel(&descriptor, listener)?;

        *inner.local.lock() = Some(descriptor.clone());
        *inner.channel.lock() = Some(channel);
        *state = ConnectionState::Bound;
        tracing::debug!(channel = %descriptor, "bound");
        Ok(())
    }

    /// Bind a channel of the target's type and connect to it.
    pub async fn dial(ctx: SocketContext, address: &SocketAddress, timeout: Duration) -> Result<Self> {
        let conn = Connection::new(ctx);
        conn.bind_with_type(address.descriptor.channel_type())?;
        conn.connect(address, timeout).await?;
        Ok(conn)
    }

    /// Run the initiator handshake against `address`. A zero timeout waits
    /// forever. On failure the connection is back in `Bound` and can retry.
    pub async fn connect(&self, address: &SocketAddress, timeout: Duration) -> Result<()> {
        if !address.descriptor.is_valid() {
            return Err(SocketError::invalid("target descriptor has an empty channel id"));
        }
        let inner = &self.inner;
        let local = {
            let mut state = inner.state.lock();
            match *state {
                ConnectionState::Bound => {}
                ConnectionState::Unbound => return Err(SocketError::NotBound),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(SocketError::Closed)
                }
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(SocketError::invalid("connect already in progress or done"))
                }
            }
            let local = inner.local_descriptor().ok_or(SocketError::NotBound)?;
            let secure = local.channel_type().requires_credential()
                || address.descriptor.channel_type().requires_credential();
            if secure && inner.ctx.credentials.current().is_none() {
                return Err(SocketError::invalid("secure channel requires a credential"));
            }
            *state = ConnectionState::Connecting;
            local
        };
        inner.handshake.lock().target = address.node_id();

        tracing::debug!(target = %address, local = %local, "connecting");
        let deadline = deadline_after(timeout);
        let result = tokio::select! {
            r = inner.establish(address, &local, deadline) => r,
            _ = inner.closed() => Err(SocketError::Closed),
        };
        if let Err(e) = &result {
            tracing::debug!(target = %address, error = %e, "connect failed");
            inner.abandon_connect();
        }
        result
    }

    /// Write bytes through the negotiated discipline. A transport failure
    /// tears the connection down before it is returned.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let link = self.writable_link()?;
        match link.write(data) {
            Err(SocketError::TransportFailure(e)) => {
                self.inner.abort(&e);
                Err(SocketError::TransportFailure(e))
            }
            other => other,
        }
    }

    pub fn flush(&self) -> Result<()> {
        let link = self.writable_link()?;
        match link.flush() {
            Err(SocketError::TransportFailure(e)) => {
                self.inner.abort(&e);
                Err(SocketError::TransportFailure(e))
            }
            other => other,
        }
    }

    fn writable_link(&self) -> Result<&Link> {
        match self.inner.state() {
            ConnectionState::Connected => self.inner.link.get().ok_or(SocketError::NotConnected),
            ConnectionState::Closing | ConnectionState::Closed => Err(SocketError::Closed),
            _ => Err(SocketError::NotConnected),
        }
    }

    /// Read into `buf`; `Ok(0)` is end-of-stream after a remote close. After
    /// a local `close()` has finished, reads fail with `Closed`. `None` uses
    /// the configured read timeout, zero waits forever.
    pub async fn read(
        &self,
        buf: &mut [u8],
        timeout: impl Into<Option<Duration>>,
    ) -> Result<usize> {
        let timeout = timeout
            .into()
            .unwrap_or(self.inner.ctx.settings.read_timeout);
        let torn_down = self.inner.closed_locally.load(Ordering::Acquire)
            && self.inner.state() == ConnectionState::Closed;
        match self.inner.link.get() {
            Some(_) if torn_down => Err(SocketError::Closed),
            Some(link) => link.input.read(buf, timeout).await,
            None => match self.inner.state() {
                ConnectionState::Closing | ConnectionState::Closed => Err(SocketError::Closed),
                _ => Err(SocketError::NotConnected),
            },
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// When connected: stop writes, let reliable output drain (bounded by the
    /// close timeout), send one close request, wait for the ack (bounded
    /// again), release both channels. Either wait expiring is reported as
    /// `Timeout` after teardown has finished.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let previous = {
            let mut state = inner.state.lock();
            let previous = *state;
            *state = match previous {
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
                ConnectionState::Connected => ConnectionState::Closing,
                _ => ConnectionState::Closed,
            };
            previous
        };
        inner.closed_locally.store(true, Ordering::Release);

        let link = match (previous, inner.link.get()) {
            (ConnectionState::Connected, Some(link)) => link,
            _ => {
                inner.set_state(ConnectionState::Closed);
                inner.release();
                tracing::debug!(state = %previous, "released unconnected socket");
                return Ok(());
            }
        };

        let close_timeout = inner.ctx.settings.close_timeout;
        let mut timed_out = false;

        link.writes_closed.store(true, Ordering::Release);
        match &link.discipline {
            Discipline::Unreliable(out) => {
                if let Err(e) = out.close() {
                    tracing::debug!(error = %e, "final flush failed");
                }
            }
            Discipline::Reliable(engine) => {
                let deadline = deadline_after(close_timeout);
                if wait_until(deadline, drain(engine.as_ref()), "close").await.is_err() {
                    tracing::warn!(
                        pending = engine.pending(),
                        "close linger expired with unacknowledged data"
                    );
                    timed_out = true;
                }
            }
        }

        if inner.send_close_request(link)
            && inner
                .wait_close_ack(deadline_after(close_timeout))
                .await
                .is_err()
        {
            tracing::debug!(remote = %link.remote_ephemeral, "no close ack from peer");
            timed_out = true;
        }

        inner.set_state(ConnectionState::Closed);
        link.input.close();
        inner.release();
        tracing::info!(remote = %link.remote_ephemeral, "connection closed");

        if timed_out {
            Err(SocketError::timeout("close"))
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Our ephemeral channel, pinned to this node.
    pub fn local_address(&self) -> Option<SocketAddress> {
        self.inner
            .local_descriptor()
            .map(|d| SocketAddress::pinned(d, self.inner.ctx.identity.clone()))
    }

    /// The peer's ephemeral channel, pinned to the peer node.
    pub fn remote_address(&self) -> Option<SocketAddress> {
        self.inner
            .link
            .get()
            .map(|l| SocketAddress::pinned(l.remote_ephemeral.clone(), l.remote.clone()))
    }

    pub fn remote_identity(&self) -> Option<NodeIdentity> {
        self.inner.link.get().map(|l| l.remote.clone())
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.link.get().is_some_and(Link::is_reliable)
    }

    pub fn is_direct(&self) -> bool {
        self.inner
            .link
            .get()
            .is_some_and(|l| l.transport.is_direct())
    }

    /// Inbound fragments dropped because the input queue was full.
    pub fn input_dropped(&self) -> u64 {
        self.inner.link.get().map_or(0, |l| l.input.dropped())
    }

    /// Build the responder side for an admitted request: bind an ephemeral
    /// channel, reach the initiator's, and send the response.
    pub(crate) async fn respond(
        ctx: &SocketContext,
        request: &Handshake,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        let conn = Connection::new(ctx.clone());
        conn.bind_with_type(request.ephemeral.channel_type())?;
        let inner = &conn.inner;
        let local = inner.local_descriptor().ok_or(SocketError::NotBound)?;

        let transport = open_transport(
            ctx,
            &request.ephemeral,
            &request.sender,
            request.direct,
            deadline,
            "accept",
        )
        .await?;
        let reliable = request.reliable && ctx.settings.reliable;
        inner.install_link(
            request.sender.clone(),
            request.ephemeral.clone(),
            transport.clone(),
            reliable,
        )?;

        let response = Handshake {
            version: PROTOCOL_VERSION,
            credential: ctx.credentials.current(),
            ephemeral: local.clone(),
            sender: ctx.identity.clone(),
            reliable,
            direct: ctx.settings.direct,
            reply_to: Some(request.ephemeral.channel_id().to_string()),
        };
        send_message(&*transport, &Message::ConnectionResponse(response))?;
        inner.set_state(ConnectionState::Connected);

        tracing::info!(
            local = %local,
            remote = %request.ephemeral,
            node = ?request.sender.node_id,
            reliable,
            "accepted connection"
        );
        Ok(conn)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("local", &self.inner.local_descriptor())
            .field("remote", &self.inner.link.get().map(|l| &l.remote_ephemeral))
            .finish()
    }
}
