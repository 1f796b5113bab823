//! Protocol transport boundary
//!
//! The service only talks to [`ModbusClient`]; wire encoding and socket or
//! serial I/O live behind it. [`TokioModbusFactory`] builds the real client
//! on top of `tokio-modbus`; tests substitute scripted clients.

mod tokio_client;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ServiceConfig;
use crate::core::read::RegisterType;

pub use tokio_client::{serial_devices, SerialDevice, TokioModbusClient, TokioModbusFactory};

/// Errors raised by a transport client
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Exception response from the device
    #[error("modbus exception: {0}")]
    Exception(String),

    /// Malformed or mismatched frame
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("use of closed network connection")]
    Closed,

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("invalid transport configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// True when the link itself is gone and the client must be reopened
    pub fn is_connection_error(&self) -> bool {
        match self {
            TransportError::Closed => return true,
            TransportError::Io(err) => {
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::NotConnected
                ) {
                    return true;
                }
            },
            _ => {},
        }
        let msg = self.to_string().to_lowercase();
        msg.contains("broken pipe")
            || msg.contains("connection reset")
            || msg.contains("use of closed network connection")
            || msg.contains("eof")
    }
}

/// A single-connection Modbus master
///
/// Methods take `&self` so a shared handle can serve concurrent callers;
/// implementations serialize access to the underlying link internally.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    async fn set_unit_id(&self, unit_id: u8) -> Result<(), TransportError>;

    async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_registers(
        &self,
        address: u16,
        quantity: u16,
        register_type: RegisterType,
    ) -> Result<Vec<u16>, TransportError>;
}

/// Builds an unopened client for a configuration
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &ServiceConfig) -> Result<Arc<dyn ModbusClient>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kinds_are_connection_errors() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(TransportError::Io(io::Error::from(kind)).is_connection_error());
        }
        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied))
            .is_connection_error());
    }

    #[test]
    fn test_closed_and_message_matching() {
        assert!(TransportError::Closed.is_connection_error());
        assert!(TransportError::Protocol("unexpected EOF in frame".into()).is_connection_error());
        assert!(
            TransportError::Io(io::Error::other("write: broken pipe")).is_connection_error()
        );
    }

    #[test]
    fn test_application_errors_are_not_connection_errors() {
        assert!(!TransportError::Exception("IllegalDataAddress".into()).is_connection_error());
        assert!(!TransportError::Timeout(Duration::from_millis(1000)).is_connection_error());
        assert!(!TransportError::Config("bad url".into()).is_connection_error());
        assert_eq!(
            TransportError::Timeout(Duration::from_millis(250)).to_string(),
            "request timed out after 250ms"
        );
    }
}
