//! In-flight handshake registry.
//!
//! Keyed by the initiator's ephemeral `SocketAddress`. The substrate may
//! deliver one connection request several times; only the first one to
//! register is handled. Entries expire after a TTL so a registry that misses
//! a `release` cannot grow without bound.

use overlay_protocol::SocketAddress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct InFlightRegistry {
    entries: Arc<Mutex<HashMap<SocketAddress, Instant>>>,
    ttl: Duration,
}

impl InFlightRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Claim `address`. Returns `false` if it is already claimed and unexpired.
    pub fn try_register(&self, address: &SocketAddress) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        if entries.contains_key(address) {
            return false;
        }
        entries.insert(address.clone(), now + self.ttl);
        true
    }

    pub fn release(&self, address: &SocketAddress) {
        self.entries.lock().remove(address);
    }

    pub fn contains(&self, address: &SocketAddress) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(address)
            .is_some_and(|expires| *expires > now)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
