//! modmaster shared library
//!
//! Provides the ambient pieces used by the modmaster binaries:
//! - logging initialisation
//! - layered configuration loading
//! - shutdown signal handling

pub mod config_loader;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use error::{CommonError, Result};
