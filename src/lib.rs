//! Code-execution referee
//!
//! Bridges an editor broker and a pool of sandbox subprocesses: pulls the
//! submitted code, runs or checks it in sandboxes, and streams output and the
//! final verdict back to the broker.

pub mod config;
pub mod covercode;
pub mod environment;
pub mod error;
pub mod fixture;
pub mod handlers;
pub mod protocol;
pub mod referee;
pub mod representation;
pub mod session;
pub mod signals;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::RefereeConfig;
pub use referee::Referee;
