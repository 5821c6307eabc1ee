//! Protocol parameter sets -- timing and sizing both peers must agree on.
//!
//! Per-socket knobs (buffer sizes, backlog, timeouts) are node-local and can
//! be overridden in configuration; the values here are their defaults. The
//! message ceiling and the engine timing are protocol-level.

/// A named, versioned set of protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Wire protocol version.
    pub version: u16,

    // -- Handshake / close --
    /// Default deadline for `connect` (resolution + handshake), milliseconds.
    pub connect_timeout_ms: u64,
    /// Default linger: drain wait and close-ack wait, each, milliseconds.
    pub close_timeout_ms: u64,

    // -- Streams --
    /// Upper bound on the non-reliable output buffer in bytes.
    pub output_buffer_max: usize,
    /// Fragments the non-reliable input queue holds before dropping.
    pub input_queue_capacity: usize,
    /// Hard ceiling on one encoded message.
    pub max_message_bytes: usize,

    // -- Acceptor --
    /// Default accept backlog.
    pub backlog: usize,
    /// Handshake worker tasks per acceptor.
    pub handshake_workers: usize,

    // -- Reliability engine --
    /// Go-Back-N window in segments.
    pub window: usize,
    /// Initial retransmission timeout, milliseconds.
    pub retransmit_ms: u64,
    /// Back-off ceiling for the retransmission timeout, milliseconds.
    pub max_retransmit_ms: u64,
    /// Consecutive timeouts before the engine declares the path dead.
    pub max_retries: u32,
}

/// Version 1 parameters.
///
/// Sized for an in-datacenter or LAN overlay; the retransmit timer assumes
/// sub-100ms round trips and backs off to 4s.
pub const PARAMS_V1: ProtocolParams = ProtocolParams {
    version: 1,

    connect_timeout_ms: 10_000,
    close_timeout_ms: 5_000,

    output_buffer_max: 16 * 1024,
    input_queue_capacity: 100,
    max_message_bytes: 1024 * 1024,

    backlog: 50,
    handshake_workers: 4,

    window: 16,
    retransmit_ms: 250,
    max_retransmit_ms: 4_000,
    max_retries: 8,
};

/// The parameter set in force.
pub const CURRENT_PARAMS: &ProtocolParams = &PARAMS_V1;
