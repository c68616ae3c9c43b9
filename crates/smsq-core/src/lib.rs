//! Core domain + application logic for the campaign dispatch engine.
//!
//! This crate is intentionally framework-agnostic. The carrier, the durable
//! store and the HTTP surface live behind ports (traits) implemented in
//! adapter crates.

pub mod campaign;
pub mod config;
pub mod control;
pub mod conversation;
pub mod correlator;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod message;
pub mod messaging;
pub mod ports;
pub mod queue;
pub mod resolver;
pub mod runtime;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
