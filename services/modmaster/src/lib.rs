//! Modbus master service
//!
//! Connection supervision with capped exponential backoff, register reads
//! with typed decoding, a bounded traffic log and a drop-on-full event
//! stream for dashboards and terminal front ends.

pub mod config;
pub mod core;
pub mod error;
pub mod runtime;
pub mod service;
pub mod transport;

pub use crate::config::{
    AddressBase, DecoderConfig, DecoderType, Endianness, Parity, Protocol, ServiceConfig,
    ValueBase, WordOrder,
};
pub use crate::core::{
    ConnectionStatus, DecodedValue, Direction, Event, EventHub, LogEntry, NumericValue, ReadKind,
    ReadRequest, ReadResult, Stats,
};
pub use crate::error::{ErrorKind, ModmasterError, ReadFailure, Result};
pub use crate::service::{Service, ServiceOptions};
pub use crate::transport::{ClientFactory, ModbusClient, TransportError};
