//! Byte streams over a message transport.
//!
//! `OutputStream` buffers writes and emits `Data` messages no larger than
//! its buffer; `InputStream` is the bounded fragment queue the demultiplexer
//! feeds and `read` drains. Without a reliability engine these give
//! same-queue FIFO and nothing more: fragments arriving at a full input
//! queue are dropped.

use bytes::{Bytes, BytesMut};
use overlay_protocol::{data_capacity, Message};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::channel::{send_message, TransportHandle};
use crate::error::{Result, SocketError};
use crate::time::{deadline_after, wait_until};

// ============================================================================
// Input
// ============================================================================

#[derive(Default)]
struct InputState {
    queue: VecDeque<Bytes>,
    /// Partially consumed fragment.
    current: Bytes,
    eof: bool,
    dropped: u64,
}

pub struct InputStream {
    state: Mutex<InputState>,
    capacity: Option<usize>,
    readable: Notify,
}

impl InputStream {
    /// Queue holding at most `capacity` fragments.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// Queue without a fragment bound (reliable mode).
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(InputState::default()),
            capacity,
            readable: Notify::new(),
        }
    }

    /// Queue one fragment. Returns `false` if it was dropped because the
    /// queue is full. A no-op after end-of-stream.
    pub fn enqueue(&self, fragment: Bytes) -> bool {
        if fragment.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if state.eof {
            return true;
        }
        if self.capacity.is_some_and(|cap| state.queue.len() >= cap) {
            state.dropped += 1;
            tracing::debug!(
                len = fragment.len(),
                dropped = state.dropped,
                "input queue full, fragment dropped"
            );
            return false;
        }
        state.queue.push_back(fragment);
        drop(state);
        self.readable.notify_waiters();
        true
    }

    /// Mark end-of-stream; queued data stays readable.
    pub fn soft_close(&self) {
        self.state.lock().eof = true;
        self.readable.notify_waiters();
    }

    /// Discard queued data and mark end-of-stream.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.queue.clear();
            state.current = Bytes::new();
            state.eof = true;
        }
        self.readable.notify_waiters();
    }

    pub fn is_eof(&self) -> bool {
        self.state.lock().eof
    }

    /// Fragments dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Bytes readable without waiting.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.current.len() + state.queue.iter().map(Bytes::len).sum::<usize>()
    }

    /// Read into `buf`. Returns 0 at end-of-stream; waits up to `timeout`
    /// (zero waits forever) for data.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.current.is_empty() {
                    if let Some(next) = state.queue.pop_front() {
                        state.current = next;
                    }
                }
                if !state.current.is_empty() {
                    let n = buf.len().min(state.current.len());
                    let chunk = state.current.split_to(n);
                    buf[..n].copy_from_slice(&chunk);
                    return Ok(n);
                }
                if state.eof {
                    return Ok(0);
                }
            }

            wait_until(deadline, notified, "read").await?;
        }
    }
}

// ============================================================================
// Output
// ============================================================================

struct OutputState {
    buf: BytesMut,
    closed: bool,
}

pub struct OutputStream {
    transport: Arc<dyn TransportHandle>,
    buffer_size: usize,
    state: Mutex<OutputState>,
}

impl OutputStream {
    pub fn new(transport: Arc<dyn TransportHandle>, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            transport,
            buffer_size,
            state: Mutex::new(OutputState {
                buf: BytesMut::with_capacity(buffer_size),
                closed: false,
            }),
        }
    }

    /// Size the buffer from what one message on `transport` can carry,
    /// capped at `max_buffer`.
    pub fn for_transport(transport: Arc<dyn TransportHandle>, max_buffer: usize) -> Self {
        let size = data_capacity(transport.max_message_size()).min(max_buffer);
        Self::new(transport, size)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes buffered and not yet sent.
    pub fn pending(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SocketError::Closed);
        }
        if data.len() >= self.buffer_size {
            self.flush_locked(&mut state)?;
            for chunk in data.chunks(self.buffer_size) {
                self.send_chunk(Bytes::copy_from_slice(chunk))?;
            }
            return Ok(());
        }
        if state.buf.len() + data.len() > self.buffer_size {
            self.flush_locked(&mut state)?;
        }
        state.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SocketError::Closed);
        }
        self.flush_locked(&mut state)
    }

    /// Flush and refuse further writes. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.flush_locked(&mut state)
    }

    /// Discard buffered data and refuse further writes.
    pub fn hard_close(&self) {
        let mut state = self.state.lock();
        state.buf.clear();
        state.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn flush_locked(&self, state: &mut OutputState) -> Result<()> {
        if state.buf.is_empty() {
            return Ok(());
        }
        let chunk = state.buf.split().freeze();
        self.send_chunk(chunk)
    }

    fn send_chunk(&self, chunk: Bytes) -> Result<()> {
        send_message(&*self.transport, &Message::data(chunk))
    }
}
