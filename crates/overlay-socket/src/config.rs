//! Configuration types for overlay-socket.
//! Parsed from ~/.overlay-socket/config.toml.

use overlay_protocol::CURRENT_PARAMS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SocketError};
use crate::memory::MemoryConfig;
use crate::reliable::EngineSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SocketConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub socket: SocketSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub substrate: SubstrateSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Shared admission secret; empty means open admission.
    #[serde(default)]
    pub secret: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            secret: String::new(),
        }
    }
}

/// Timeouts are signed so that a negative value in a file is caught by
/// `validate` instead of failing to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: i64,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: i64,
    #[serde(default)]
    pub read_timeout_ms: i64,
    #[serde(default = "default_true")]
    pub reliable: bool,
    #[serde(default)]
    pub direct: bool,
    #[serde(default = "default_output_buffer_max")]
    pub output_buffer_max: usize,
    #[serde(default = "default_input_queue_capacity")]
    pub input_queue_capacity: usize,
    #[serde(default = "default_backlog")]
    pub backlog: usize,
    #[serde(default = "default_handshake_workers")]
    pub handshake_workers: usize,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            close_timeout_ms: default_close_timeout(),
            read_timeout_ms: 0,
            reliable: true,
            direct: false,
            output_buffer_max: default_output_buffer_max(),
            input_queue_capacity: default_input_queue_capacity(),
            backlog: default_backlog(),
            handshake_workers: default_handshake_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_retransmit")]
    pub retransmit_ms: i64,
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit_ms: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            window: default_window(),
            retransmit_ms: default_retransmit(),
            max_retransmit_ms: default_max_retransmit(),
            max_retries: default_max_retries(),
        }
    }
}

/// Knobs for the in-memory substrate the binary runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateSection {
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub duplicate: f64,
    #[serde(default)]
    pub redundant_resolutions: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub direct: bool,
}

impl Default for SubstrateSection {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            redundant_resolutions: 0,
            max_message_size: default_max_message_size(),
            direct: false,
        }
    }
}

// Default value functions
fn default_namespace() -> String {
    "default".into()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> i64 {
    CURRENT_PARAMS.connect_timeout_ms as i64
}
fn default_close_timeout() -> i64 {
    CURRENT_PARAMS.close_timeout_ms as i64
}
fn default_output_buffer_max() -> usize {
    CURRENT_PARAMS.output_buffer_max
}
fn default_input_queue_capacity() -> usize {
    CURRENT_PARAMS.input_queue_capacity
}
fn default_backlog() -> usize {
    CURRENT_PARAMS.backlog
}
fn default_handshake_workers() -> usize {
    CURRENT_PARAMS.handshake_workers
}
fn default_window() -> usize {
    CURRENT_PARAMS.window
}
fn default_retransmit() -> i64 {
    CURRENT_PARAMS.retransmit_ms as i64
}
fn default_max_retransmit() -> i64 {
    CURRENT_PARAMS.max_retransmit_ms as i64
}
fn default_max_retries() -> u32 {
    CURRENT_PARAMS.max_retries
}
fn default_max_message_size() -> usize {
    64 * 1024
}

/// Validated, typed settings every socket runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketSettings {
    /// Zero waits forever.
    pub connect_timeout: Duration,
    /// Linger bound, applied separately to the drain and the ack wait.
    pub close_timeout: Duration,
    /// Default for `Connection::read`; zero waits forever.
    pub read_timeout: Duration,
    pub reliable: bool,
    pub direct: bool,
    pub output_buffer_max: usize,
    pub input_queue_capacity: usize,
    pub backlog: usize,
    pub handshake_workers: usize,
    pub engine: EngineSettings,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(CURRENT_PARAMS.connect_timeout_ms),
            close_timeout: Duration::from_millis(CURRENT_PARAMS.close_timeout_ms),
            read_timeout: Duration::ZERO,
            reliable: true,
            direct: false,
            output_buffer_max: CURRENT_PARAMS.output_buffer_max,
            input_queue_capacity: CURRENT_PARAMS.input_queue_capacity,
            backlog: CURRENT_PARAMS.backlog,
            handshake_workers: CURRENT_PARAMS.handshake_workers,
            engine: EngineSettings::default(),
        }
    }
}

fn millis(field: &str, value: i64) -> Result<Duration> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| SocketError::invalid(format!("{field} must not be negative (got {value})")))
}

fn positive(field: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(SocketError::invalid(format!("{field} must be at least 1")));
    }
    Ok(value)
}

fn probability(field: &str, value: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SocketError::invalid(format!(
            "{field} must be within [0, 1] (got {value})"
        )));
    }
    Ok(value)
}

impl SocketConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: SocketConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Check ranges and convert to typed settings.
    pub fn validate(&self) -> Result<SocketSettings> {
        let s = &self.socket;
        let e = &self.engine;
        let retransmit = millis("engine.retransmit_ms", e.retransmit_ms)?;
        let max_retransmit = millis("engine.max_retransmit_ms", e.max_retransmit_ms)?;
        if retransmit.is_zero() {
            return Err(SocketError::invalid("engine.retransmit_ms must be at least 1"));
        }
        if max_retransmit < retransmit {
            return Err(SocketError::invalid(
                "engine.max_retransmit_ms must not be below engine.retransmit_ms",
            ));
        }

        Ok(SocketSettings {
            connect_timeout: millis("socket.connect_timeout_ms", s.connect_timeout_ms)?,
            close_timeout: millis("socket.close_timeout_ms", s.close_timeout_ms)?,
            read_timeout: millis("socket.read_timeout_ms", s.read_timeout_ms)?,
            reliable: s.reliable,
            direct: s.direct,
            output_buffer_max: positive("socket.output_buffer_max", s.output_buffer_max)?,
            input_queue_capacity: positive("socket.input_queue_capacity", s.input_queue_capacity)?,
            backlog: positive("socket.backlog", s.backlog)?,
            handshake_workers: positive("socket.handshake_workers", s.handshake_workers)?,
            engine: EngineSettings {
                window: positive("engine.window", e.window)?,
                retransmit,
                max_retransmit,
                max_retries: e.max_retries,
            },
        })
    }

    /// In-memory substrate parameters from the `[substrate]` section.
    pub fn memory_config(&self) -> Result<MemoryConfig> {
        let sub = &self.substrate;
        Ok(MemoryConfig {
            loss: probability("substrate.loss", sub.loss)?,
            duplicate: probability("substrate.duplicate", sub.duplicate)?,
            redundant_resolutions: sub.redundant_resolutions,
            max_message_size: positive("substrate.max_message_size", sub.max_message_size)?,
            direct: sub.direct,
            ..MemoryConfig::default()
        })
    }
}
