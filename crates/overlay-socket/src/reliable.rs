//! Reliability engines.
//!
//! A connection that negotiates reliable delivery hands every write to a
//! `ReliabilityEngine` and feeds it every inbound `Reliable` frame. The
//! engine owns sequencing, acknowledgement and retransmission; the
//! connection only sees in-order payloads coming out of `receive`.
//!
//! `WindowEngine` is the default: Go-Back-N with cumulative ACKs.
//!
//! Frame layout inside a `Reliable` message payload:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | kind:1 | seq:4 (BE u32) | payload (DATA)  |
//! +--------+----------------+-----------------+
//! ```
//!
//! For ACK frames `seq` is the next sequence number the receiver expects.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use overlay_protocol::{data_capacity, Message, CURRENT_PARAMS};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{send_message, ChannelError, TransportHandle};
use crate::error::{Result, SocketError};

pub trait ReliabilityEngine: Send + Sync {
    /// Accept one application write. Errors are fatal for the connection.
    fn send(&self, payload: Bytes) -> Result<()>;

    /// Feed one inbound engine frame; returns payloads now deliverable, in order.
    fn receive(&self, frame: Bytes) -> Vec<Bytes>;

    /// Outbound payload units not yet acknowledged.
    fn pending(&self) -> usize;

    /// Stop timers and release resources. Idempotent.
    fn close(&self);
}

/// Builds an engine for a freshly negotiated reliable connection.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(
        &self,
        transport: Arc<dyn TransportHandle>,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn ReliabilityEngine>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Segments in flight before sends queue up.
    pub window: usize,
    pub retransmit: Duration,
    pub max_retransmit: Duration,
    /// Consecutive timeouts before the path is declared dead.
    pub max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window: CURRENT_PARAMS.window,
            retransmit: Duration::from_millis(CURRENT_PARAMS.retransmit_ms),
            max_retransmit: Duration::from_millis(CURRENT_PARAMS.max_retransmit_ms),
            max_retries: CURRENT_PARAMS.max_retries,
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Data { seq: u32, payload: Bytes },
    Ack { next: u32 },
}

impl Frame {
    fn encode(&self) -> Bytes {
        match self {
            Frame::Data { seq, payload } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
                buf.put_u8(KIND_DATA);
                buf.put_u32(*seq);
                buf.extend_from_slice(payload);
                buf.freeze()
            }
            Frame::Ack { next } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN);
                buf.put_u8(KIND_ACK);
                buf.put_u32(*next);
                buf.freeze()
            }
        }
    }

    fn decode(mut raw: Bytes) -> Option<Frame> {
        if raw.len() < HEADER_LEN {
            return None;
        }
        let kind = raw.get_u8();
        let seq = raw.get_u32();
        match kind {
            KIND_DATA => Some(Frame::Data { seq, payload: raw }),
            KIND_ACK => Some(Frame::Ack { next: seq }),
            _ => None,
        }
    }
}

/// `a < b` in wrap-around sequence space.
fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) <= u32::MAX / 2
}

// ============================================================================
// Go-Back-N engine
// ============================================================================

struct Sender {
    next_seq: u32,
    /// Sent, unacknowledged `(seq, encoded frame)`, oldest first.
    in_flight: VecDeque<(u32, Bytes)>,
    /// Segments waiting for window space.
    queued: VecDeque<Bytes>,
    rto: Duration,
    retries: u32,
    deadline: Option<Instant>,
    failed: bool,
}

struct EngineState {
    sender: Sender,
    rcv_nxt: u32,
    closed: bool,
}

struct EngineInner {
    transport: Arc<dyn TransportHandle>,
    settings: EngineSettings,
    segment_size: usize,
    state: Mutex<EngineState>,
    timer: Notify,
}

/// Go-Back-N sliding-window engine.
pub struct WindowEngine {
    inner: Arc<EngineInner>,
}

impl WindowEngine {
    /// Start an engine on `transport`. Needs a tokio runtime for its
    /// retransmission timer.
    pub fn start(transport: Arc<dyn TransportHandle>, settings: EngineSettings) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        let segment_size = data_capacity(transport.max_message_size()).saturating_sub(HEADER_LEN);
        if segment_size == 0 {
            return Err(SocketError::invalid(format!(
                "transport message size {} too small for reliable frames",
                transport.max_message_size()
            )));
        }
        let settings = EngineSettings {
            window: settings.window.max(1),
            ..settings
        };

        let inner = Arc::new(EngineInner {
            transport,
            settings,
            segment_size,
            state: Mutex::new(EngineState {
                sender: Sender {
                    next_seq: 0,
                    in_flight: VecDeque::new(),
                    queued: VecDeque::new(),
                    rto: settings.retransmit,
                    retries: 0,
                    deadline: None,
                    failed: false,
                },
                rcv_nxt: 0,
                closed: false,
            }),
            timer: Notify::new(),
        });
        runtime.spawn(retransmit_loop(Arc::downgrade(&inner)));
        Ok(Self { inner })
    }

    /// Largest payload carried by one frame; bigger writes are segmented.
    pub fn segment_size(&self) -> usize {
        self.inner.segment_size
    }
}

impl EngineInner {
    /// Move queued segments into the window while there is room.
    fn pump(&self, state: &mut EngineState) -> Result<()> {
        let sender = &mut state.sender;
        while sender.in_flight.len() < self.settings.window {
            let Some(payload) = sender.queued.pop_front() else {
                break;
            };
            let seq = sender.next_seq;
            sender.next_seq = seq.wrapping_add(1);
            let frame = Frame::Data { seq, payload }.encode();
            self.transmit(&frame)?;
            sender.in_flight.push_back((seq, frame));
            if sender.deadline.is_none() {
                sender.deadline = Some(Instant::now() + sender.rto);
                self.timer.notify_one();
            }
        }
        Ok(())
    }

    fn transmit(&self, frame: &Bytes) -> Result<()> {
        send_message(&*self.transport, &Message::reliable(frame.clone()))
    }

    fn on_ack(&self, state: &mut EngineState, next: u32) {
        let sender = &mut state.sender;
        let mut acked = 0;
        while let Some((seq, _)) = sender.in_flight.front() {
            if seq_lt(*seq, next) {
                sender.in_flight.pop_front();
                acked += 1;
            } else {
                break;
            }
        }
        if acked == 0 {
            return;
        }
        sender.retries = 0;
        sender.rto = self.settings.retransmit;
        sender.deadline = if sender.in_flight.is_empty() {
            None
        } else {
            Some(Instant::now() + sender.rto)
        };
        if let Err(e) = self.pump(state) {
            tracing::debug!(error = %e, "send after ack failed");
        }
    }

    /// Timer expiry: go back and resend the whole window.
    fn on_timeout(&self) {
        let mut state = self.state.lock();
        let sender = &mut state.sender;
        match sender.deadline {
            Some(at) if at <= Instant::now() && !sender.in_flight.is_empty() => {}
            _ => return,
        }

        sender.retries += 1;
        if sender.retries > self.settings.max_retries {
            tracing::warn!(
                destination = %self.transport.destination(),
                retries = sender.retries - 1,
                unacked = sender.in_flight.len() + sender.queued.len(),
                "retransmission limit reached, path declared dead"
            );
            sender.failed = true;
            sender.in_flight.clear();
            sender.queued.clear();
            sender.deadline = None;
            return;
        }

        tracing::debug!(
            window = sender.in_flight.len(),
            retry = sender.retries,
            rto_ms = sender.rto.as_millis() as u64,
            "retransmitting window"
        );
        for (_, frame) in sender.in_flight.iter() {
            if let Err(e) = send_message(&*self.transport, &Message::reliable(frame.clone())) {
                tracing::debug!(error = %e, "retransmit failed");
                break;
            }
        }
        sender.rto = (sender.rto * 2).min(self.settings.max_retransmit);
        sender.deadline = Some(Instant::now() + sender.rto);
    }
}

async fn retransmit_loop(engine: Weak<EngineInner>) {
    loop {
        let Some(inner) = engine.upgrade() else {
            return;
        };
        let deadline = {
            let state = inner.state.lock();
            if state.closed {
                return;
            }
            state.sender.deadline
        };
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => inner.on_timeout(),
                    _ = inner.timer.notified() => {}
                }
            }
            None => inner.timer.notified().await,
        }
    }
}

impl ReliabilityEngine for WindowEngine {
    fn send(&self, payload: Bytes) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.closed {
            return Err(SocketError::Closed);
        }
        if state.sender.failed {
            return Err(ChannelError::Unavailable("retransmission limit reached".into()).into());
        }
        let mut payload = payload;
        while !payload.is_empty() {
            let n = payload.len().min(inner.segment_size);
            state.sender.queued.push_back(payload.split_to(n));
        }
        inner.pump(&mut state)
    }

    fn receive(&self, frame: Bytes) -> Vec<Bytes> {
        let inner = &self.inner;
        let Some(frame) = Frame::decode(frame) else {
            tracing::debug!("malformed reliable frame ignored");
            return Vec::new();
        };
        let mut state = inner.state.lock();
        if state.closed {
            return Vec::new();
        }
        match frame {
            Frame::Ack { next } => {
                inner.on_ack(&mut state, next);
                Vec::new()
            }
            Frame::Data { seq, payload } => {
                let mut delivered = Vec::new();
                if seq == state.rcv_nxt {
                    state.rcv_nxt = seq.wrapping_add(1);
                    delivered.push(payload);
                }
                // Out-of-order and duplicate segments are discarded; the
                // cumulative ACK is repeated either way.
                let ack = Frame::Ack {
                    next: state.rcv_nxt,
                }
                .encode();
                if let Err(e) = inner.transmit(&ack) {
                    tracing::debug!(error = %e, "ack send failed");
                }
                delivered
            }
        }
    }

    fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state.sender.in_flight.len() + state.sender.queued.len()
    }

    fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.sender.in_flight.clear();
        state.sender.queued.clear();
        state.sender.deadline = None;
        drop(state);
        self.inner.timer.notify_one();
    }
}

impl Drop for WindowEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for `WindowEngine`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowEngineFactory;

impl EngineFactory for WindowEngineFactory {
    fn create(
        &self,
        transport: Arc<dyn TransportHandle>,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn ReliabilityEngine>> {
        Ok(Arc::new(WindowEngine::start(transport, *settings)?))
    }
}
