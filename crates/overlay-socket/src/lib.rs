//! Overlay sockets -- connection-oriented byte streams over an unreliable,
//! descriptor-addressed message substrate.
//!
//! A `Connection` runs a handshake over a well-known channel, moves to a
//! pair of per-connection ephemeral channels, and then carries bytes either
//! through a reliability engine or as plain best-effort `Data` messages.
//! An `Acceptor` owns the well-known channel and hands out responder-side
//! connections from a bounded backlog.

pub mod acceptor;
pub mod channel;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod memory;
pub mod registry;
pub mod reliable;
pub mod stream;

mod resolve;
mod time;

use overlay_protocol::NodeIdentity;
use std::path::PathBuf;
use std::sync::Arc;

pub use acceptor::Acceptor;
pub use channel::{ChannelError, ChannelService, InputChannel, TransportHandle};
pub use config::{SocketConfig, SocketSettings};
pub use connection::{Connection, ConnectionState};
pub use credential::{CredentialProvider, OpenAdmission, SharedSecretCredentials};
pub use error::{Result, SocketError};
pub use memory::{MemoryChannelService, MemoryConfig, MemoryNetwork};
pub use reliable::{EngineFactory, EngineSettings, ReliabilityEngine, WindowEngineFactory};

/// Everything a socket needs from its node, passed in at construction.
#[derive(Clone)]
pub struct SocketContext {
    pub channels: Arc<dyn ChannelService>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub engines: Arc<dyn EngineFactory>,
    pub identity: NodeIdentity,
    pub namespace_id: String,
    pub settings: SocketSettings,
}

impl SocketContext {
    /// Open admission, the default window engine and default settings.
    pub fn new(
        channels: Arc<dyn ChannelService>,
        identity: NodeIdentity,
        namespace_id: impl Into<String>,
    ) -> Self {
        Self {
            channels,
            credentials: Arc::new(OpenAdmission),
            engines: Arc::new(WindowEngineFactory),
            identity,
            namespace_id: namespace_id.into(),
            settings: SocketSettings::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_engines(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_settings(mut self, settings: SocketSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketContext")
            .field("node", &self.identity.node_id)
            .field("namespace_id", &self.namespace_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
