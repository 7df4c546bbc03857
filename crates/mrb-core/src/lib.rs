//! Core transfer-admission and session-lifecycle logic for the Media Relay Bot.
//!
//! This crate is intentionally transport-agnostic. The remote messaging service
//! (authentication handshake, wire encoding) lives behind ports (traits) in
//! [`ports`], implemented by adapter crates. What lives here is the hard part:
//! a bounded pool of live authenticated sessions shared across many users, a
//! no-queue admission gate over concurrent transfers, and the reference-counted
//! busy state that keeps the two honest with each other.

pub mod admission;
pub mod busy;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod pool;
pub mod ports;
pub mod reaper;
pub mod transfer;

pub use errors::{Error, Result};
