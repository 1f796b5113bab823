//! Core data path: decoding, log buffering, events and read types

pub mod decoders;
pub mod events;
pub mod logs;
pub mod read;

pub use decoders::{decode_values, decode_with_config, DecodeError, DecodedValue, NumericValue};
pub use events::{Event, EventBus, EventHub};
pub use logs::{Direction, LogBuffer, LogEntry};
pub use read::{ConnectionStatus, ReadKind, ReadRequest, ReadResult, RegisterType, Stats};
