//! Resolution de-duplication.
//!
//! The substrate may report a descriptor several times, or report handles
//! for something else entirely. A `ResolutionSlot` keeps the first handle
//! that matches the expected `{channel_id, channel_type}` and closes the
//! rest, including everything that arrives after the waiter has given up.

use overlay_protocol::{EndpointDescriptor, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{ResolutionListener, TransportHandle};
use crate::error::{Result, SocketError};
use crate::time::wait_until;
use crate::SocketContext;

enum SlotState {
    Waiting,
    Resolved(Arc<dyn TransportHandle>),
    Taken,
    Abandoned,
}

pub(crate) struct ResolutionSlot {
    expected: EndpointDescriptor,
    state: Mutex<SlotState>,
    resolved: Notify,
}

impl ResolutionSlot {
    pub(crate) fn new(expected: EndpointDescriptor) -> Arc<Self> {
        Arc::new(Self {
            expected,
            state: Mutex::new(SlotState::Waiting),
            resolved: Notify::new(),
        })
    }

    /// Wait for the winning handle.
    pub(crate) async fn wait(
        &self,
        deadline: Option<Instant>,
        operation: &'static str,
    ) -> Result<Arc<dyn TransportHandle>> {
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                match std::mem::replace(&mut *state, SlotState::Taken) {
                    SlotState::Resolved(handle) => return Ok(handle),
                    SlotState::Waiting => *state = SlotState::Waiting,
                    SlotState::Taken => return Err(SocketError::invalid("resolution already taken")),
                    SlotState::Abandoned => {
                        *state = SlotState::Abandoned;
                        return Err(SocketError::Closed);
                    }
                }
            }

            wait_until(deadline, notified, operation).await?;
        }
    }

    /// Stop accepting handles; closes any handle not yet taken.
    pub(crate) fn abandon(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SlotState::Abandoned);
        if let SlotState::Resolved(handle) = previous {
            handle.close();
        }
        self.resolved.notify_waiters();
    }
}

impl ResolutionListener for ResolutionSlot {
    fn on_resolved(&self, handle: Arc<dyn TransportHandle>) {
        if !self.expected.matches(handle.destination()) {
            tracing::debug!(
                expected = %self.expected,
                got = %handle.destination(),
                "ignoring non-matching resolution"
            );
            handle.close();
            return;
        }

        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Resolved(handle);
            drop(state);
            self.resolved.notify_waiters();
        } else {
            drop(state);
            tracing::debug!(channel = %self.expected, "redundant resolution closed");
            handle.close();
        }
    }
}

/// Resolve `descriptor` and return the first matching handle before `deadline`.
pub(crate) async fn resolve_transport(
    ctx: &SocketContext,
    descriptor: &EndpointDescriptor,
    target: Option<NodeId>,
    deadline: Option<Instant>,
    operation: &'static str,
) -> Result<Arc<dyn TransportHandle>> {
    let slot = ResolutionSlot::new(descriptor.clone());
    let _guard = AbandonOnDrop(slot.clone());
    ctx.channels
        .resolve_output_channel(descriptor, target, slot.clone())?;
    slot.wait(deadline, operation).await
}

/// Abandons the slot however the resolving future ends, including when it
/// is dropped mid-wait.
struct AbandonOnDrop(Arc<ResolutionSlot>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}
