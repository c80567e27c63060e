//! Protocol module - wire formats for the broker session and the sandbox RPC
//!
//! This module provides:
//! - Delimiter-terminated JSON framing over async byte streams
//! - Broker packets with per-direction method allow-lists
//! - Sandbox request/reply/handshake messages
//!
//! The protocol module does NOT:
//! - Own connections or correlate requests (that's the session/environment job)
//! - Interpret sandbox results

pub mod frame;
pub mod packet;
pub mod sandbox;

// Re-exports for convenience
pub use frame::{
    decode_json, encode_json, FrameReader, FrameWriter, BROKER_DELIMITER, SANDBOX_DELIMITER,
};
pub use packet::{InMethod, InPacket, OutMethod, OutPacket, Packet, ResultAction};
pub use sandbox::{Handshake, SandboxReply, SandboxRequest};
