//! Session module - the referee's single connection to the broker
//!
//! This module handles:
//! - The `set` handshake identifying this session
//! - Correlated pulls (`select` -> `select_result`) by request id
//! - Fire-and-forget pushes (output, test progress, results, errors)
//! - Dispatching inbound `cancel`/`get_status` to registered callbacks
//!
//! The session module does NOT:
//! - Decide what to run (that's the referee's and handlers' job)
//! - Retry or reconnect; a lost connection ends the session

pub mod client;

pub use client::{SessionClient, SessionIdentity, WeakSessionClient};
