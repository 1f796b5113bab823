//! Error handling for the Modbus master service
//!
//! Precondition errors (not connected, unsupported kind, invalid input) and
//! transport errors are returned from reads; connection attempt errors only
//! surface as status and log events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::read::ReadResult;
use crate::transport::TransportError;

/// Modbus master error type
#[derive(Error, Debug)]
pub enum ModmasterError {
    /// No client handle is currently held
    #[error("modbus client not connected")]
    NotConnected,

    /// Read function outside the four supported kinds
    #[error("unsupported read kind: {0}")]
    UnsupportedReadKind(String),

    /// Request or configuration value out of range
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Error reported by the protocol transport
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background work could not be scheduled
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for the Modbus master
pub type Result<T> = std::result::Result<T, ModmasterError>;

impl ModmasterError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ModmasterError::InvalidInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModmasterError::Config(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        ModmasterError::Runtime(msg.into())
    }

    /// True when a transport call reported that the link itself is unusable
    ///
    /// A missing client is a precondition failure, not a broken link.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ModmasterError::Transport(err) => err.is_connection_error(),
            _ => false,
        }
    }

    /// Coarse classification reported alongside failed reads
    pub fn kind(&self) -> ErrorKind {
        if self.is_connection_error() {
            ErrorKind::Connection
        } else {
            ErrorKind::Modbus
        }
    }
}

impl From<common::CommonError> for ModmasterError {
    fn from(err: common::CommonError) -> Self {
        ModmasterError::Config(err.to_string())
    }
}

/// Coarse error class attached to a failed [`ReadResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Connection,
    Modbus,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Modbus => write!(f, "modbus"),
        }
    }
}

/// Failed read: the stamped result plus the error that caused it
#[derive(Error, Debug)]
#[error("{error}")]
pub struct ReadFailure {
    pub result: ReadResult,
    #[source]
    pub error: ModmasterError,
}

impl ReadFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
