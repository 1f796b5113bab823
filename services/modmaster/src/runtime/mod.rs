//! Runtime support for the connection supervisor

pub mod reconnect;

pub use reconnect::{Backoff, ReconnectPolicy};
