//! Integration test entry point for overlay-socket.
//!
//! Run with: cargo test --test integration

mod harness;
mod acceptor;
mod handshake;
mod streams;
