//! Acceptor -- listens on a well-known descriptor and hands out
//! responder-side connections.
//!
//! Delivery on the well-known channel only decodes and enqueues. Handshakes
//! run on at most `handshake_workers` tasks; each one reserves a backlog
//! slot before it answers, so a full backlog drops the request instead of
//! blocking anything.

use bytes::Bytes;
use overlay_protocol::{decode_message, EndpointDescriptor, Handshake, Message, SocketAddress, CURRENT_PARAMS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, InputChannel};
use crate::connection::{check_admission, Connection};
use crate::error::{Result, SocketError};
use crate::registry::InFlightRegistry;
use crate::time::{deadline_after, wait_until};
use crate::SocketContext;

pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

struct AcceptorInner {
    descriptor: EndpointDescriptor,
    channel: Mutex<Option<Box<dyn InputChannel>>>,
    backlog_tx: mpsc::Sender<Connection>,
    backlog_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    registry: InFlightRegistry,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Drop for AcceptorInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
    }
}

/// Everything a handshake worker needs; cloned into each worker task.
#[derive(Clone)]
struct Handshaker {
    ctx: SocketContext,
    secure: bool,
    backlog: mpsc::Sender<Connection>,
    registry: InFlightRegistry,
    shutdown: CancellationToken,
}

impl Handshaker {
    fn admit(&self, request: &Handshake) -> bool {
        if !request.ephemeral.is_valid() {
            tracing::debug!("connection request without an ephemeral channel");
            return false;
        }
        if let Err(e) = check_admission(&self.ctx, request, self.secure) {
            tracing::debug!(sender = ?request.sender.node_id, error = %e, "connection request dropped");
            return false;
        }
        true
    }

    async fn handle(self, request: Handshake) {
        if !self.admit(&request) {
            return;
        }
        let key = SocketAddress::pinned(request.ephemeral.clone(), request.sender.clone());
        if !self.registry.try_register(&key) {
            tracing::debug!(initiator = %key, "duplicate connection request ignored");
            return;
        }

        let slot = match self.backlog.clone().try_reserve_owned() {
            Ok(slot) => slot,
            Err(_) => {
                tracing::warn!(initiator = %key, "backlog full, connection request dropped");
                self.registry.release(&key);
                return;
            }
        };

        let deadline = deadline_after(self.ctx.settings.connect_timeout);
        let result = tokio::select! {
            r = Connection::respond(&self.ctx, &request, deadline) => r,
            _ = self.shutdown.cancelled() => Err(SocketError::Closed),
        };
        match result {
            Ok(conn) if !self.shutdown.is_cancelled() => {
                tracing::debug!(initiator = %key, "connection queued for accept");
                slot.send(conn);
            }
            Ok(_) => tracing::debug!(initiator = %key, "acceptor closed during handshake"),
            Err(e) => {
                tracing::debug!(initiator = %key, error = %e, "handshake failed");
                self.registry.release(&key);
            }
        }
    }
}

async fn run_workers(
    handshaker: Handshaker,
    mut requests: mpsc::Receiver<Handshake>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    loop {
        let request = tokio::select! {
            _ = handshaker.shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = handshaker.shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let worker = handshaker.clone();
        tokio::spawn(async move {
            worker.handle(request).await;
            drop(permit);
        });
    }
    tracing::debug!("handshake dispatcher stopped");
}

impl Acceptor {
    /// Listen on `descriptor` with the configured backlog.
    pub fn bind(ctx: SocketContext, descriptor: EndpointDescriptor) -> Result<Self> {
        let backlog = ctx.settings.backlog;
        Self::bind_with_backlog(ctx, descriptor, backlog)
    }

    pub fn bind_with_backlog(
        ctx: SocketContext,
        descriptor: EndpointDescriptor,
        backlog: usize,
    ) -> Result<Self> {
        if !descriptor.is_valid() {
            return Err(SocketError::invalid("listen descriptor has an empty channel id"));
        }
        if backlog == 0 {
            return Err(SocketError::invalid("backlog must be at least 1"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SocketError::TransportFailure(ChannelError::Unavailable(
                "acceptor needs a tokio runtime".into(),
            ))
        })?;

        let workers = ctx.settings.handshake_workers.max(1);
        let ttl = match ctx.settings.connect_timeout {
            t if t.is_zero() => Duration::from_millis(CURRENT_PARAMS.connect_timeout_ms),
            t => t,
        };
        let (backlog_tx, backlog_rx) = mpsc::channel(backlog);
        let (request_tx, request_rx) = mpsc::channel::<Handshake>(backlog + workers);
        let registry = InFlightRegistry::new(ttl);
        let shutdown = CancellationToken::new();

        let listener = move |frame: Bytes| match decode_message(&frame) {
            Ok(Message::ConnectionRequest(request)) => {
                if request_tx.try_send(request).is_err() {
                    tracing::debug!("handshake queue full, connection request dropped");
                }
            }
            Ok(other) => tracing::debug!(kind = other.kind(), "non-request traffic on listen channel"),
            Err(e) => tracing::debug!(error = %e, "undecodable frame on listen channel"),
        };
        let channel = ctx
            .channels
            .create_input_channel(&descriptor, Arc::new(listener))?;

        let handshaker = Handshaker {
            secure: descriptor.channel_type().requires_credential(),
            ctx,
            backlog: backlog_tx.clone(),
            registry: registry.clone(),
            shutdown: shutdown.clone(),
        };
        runtime.spawn(run_workers(handshaker, request_rx, workers));

        tracing::info!(channel = %descriptor, backlog, workers, "listening");
        Ok(Self {
            inner: Arc::new(AcceptorInner {
                descriptor,
                channel: Mutex::new(Some(channel)),
                backlog_tx,
                backlog_rx: tokio::sync::Mutex::new(backlog_rx),
                registry,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Take the next accepted connection. A zero timeout waits forever.
    pub async fn accept(&self, timeout: Duration) -> Result<Connection> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SocketError::Closed);
        }
        let next = async {
            let mut rx = inner.backlog_rx.lock().await;
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => None,
                conn = rx.recv() => conn,
            }
        };
        match wait_until(deadline_after(timeout), next, "accept").await? {
            Some(conn) => {
                tracing::info!(channel = %inner.descriptor, remote = ?conn.remote_address(), "accepted");
                Ok(conn)
            }
            None => Err(SocketError::Closed),
        }
    }

    /// Stop listening and drop queued connections. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();
        if let Some(channel) = inner.channel.lock().take() {
            channel.close();
        }

        let mut rx = inner.backlog_rx.lock().await;
        rx.close();
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        inner.registry.clear();
        tracing::info!(channel = %inner.descriptor, dropped, "acceptor closed");
    }

    pub fn local_address(&self) -> &EndpointDescriptor {
        &self.inner.descriptor
    }

    /// Connections queued or being answered into a reserved slot.
    pub fn backlog_len(&self) -> usize {
        let tx = &self.inner.backlog_tx;
        tx.max_capacity() - tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("descriptor", &self.inner.descriptor)
            .field("backlog_len", &self.backlog_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
