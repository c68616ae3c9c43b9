//! Outbound carrier abstraction.

pub mod port;
pub mod throttled;
pub mod types;
