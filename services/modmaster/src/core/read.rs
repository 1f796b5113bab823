//! Read request/result types and running statistics

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::decoders::DecodedValue;
use crate::error::{ErrorKind, ModmasterError};

/// The four readable data classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadKind {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl ReadKind {
    pub const ALL: [ReadKind; 4] = [
        ReadKind::Coils,
        ReadKind::DiscreteInputs,
        ReadKind::HoldingRegisters,
        ReadKind::InputRegisters,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReadKind::Coils => "coils",
            ReadKind::DiscreteInputs => "discrete_inputs",
            ReadKind::HoldingRegisters => "holding_registers",
            ReadKind::InputRegisters => "input_registers",
        }
    }

    /// Two-digit Modbus function code, as shown in traffic logs
    pub fn function_code(self) -> &'static str {
        match self {
            ReadKind::Coils => "01",
            ReadKind::DiscreteInputs => "02",
            ReadKind::HoldingRegisters => "03",
            ReadKind::InputRegisters => "04",
        }
    }
}

impl fmt::Display for ReadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadKind {
    type Err = ModmasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coils" | "coil" | "01" | "1" => Ok(ReadKind::Coils),
            "discrete_inputs" | "discrete" | "02" | "2" => Ok(ReadKind::DiscreteInputs),
            "holding_registers" | "holding" | "03" | "3" => Ok(ReadKind::HoldingRegisters),
            "input_registers" | "input" | "04" | "4" => Ok(ReadKind::InputRegisters),
            _ => Err(ModmasterError::UnsupportedReadKind(s.to_string())),
        }
    }
}

/// Register table addressed by a word read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub kind: ReadKind,
    pub address: u16,
    pub quantity: u16,
    /// Unit id override; 0 uses the configured default
    #[serde(default)]
    pub unit_id: u8,
}

impl ReadRequest {
    pub fn new(kind: ReadKind, address: u16, quantity: u16) -> Self {
        Self {
            kind,
            address,
            quantity,
            unit_id: 0,
        }
    }

    pub fn with_unit(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }
}

/// Outcome of one read, also broadcast as a `data` or `error` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub kind: ReadKind,
    pub address: u16,
    pub quantity: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bool_values: Vec<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reg_values: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decoded: Vec<DecodedValue>,
    pub latency_ms: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ReadResult {
    /// Empty result echoing the request, before any values are filled in
    pub fn for_request(request: &ReadRequest) -> Self {
        Self {
            kind: request.kind,
            address: request.address,
            quantity: request.quantity,
            bool_values: Vec::new(),
            reg_values: Vec::new(),
            decoded: Vec::new(),
            latency_ms: 0,
            completed_at: Utc::now(),
            error_message: None,
            error_kind: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub read_count: u64,
    pub error_count: u64,
    pub last_latency_ms: u64,
}

impl Stats {
    pub fn record_success(&mut self, latency_ms: u64) {
        self.read_count += 1;
        self.last_latency_ms = latency_ms;
    }

    pub fn record_error(&mut self, latency_ms: u64) {
        self.error_count += 1;
        self.last_latency_ms = latency_ms;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_read_kind_parsing() {
        assert_eq!("coils".parse::<ReadKind>().unwrap(), ReadKind::Coils);
        assert_eq!("03".parse::<ReadKind>().unwrap(), ReadKind::HoldingRegisters);
        assert_eq!(" 4 ".parse::<ReadKind>().unwrap(), ReadKind::InputRegisters);
        assert_eq!(
            "discrete_inputs".parse::<ReadKind>().unwrap(),
            ReadKind::DiscreteInputs
        );

        let err = "05".parse::<ReadKind>().unwrap_err();
        assert!(matches!(err, ModmasterError::UnsupportedReadKind(_)));
        assert_eq!(err.to_string(), "unsupported read kind: 05");
    }

    #[test]
    fn test_function_codes() {
        let codes: Vec<&str> = ReadKind::ALL.iter().map(|k| k.function_code()).collect();
        assert_eq!(codes, vec!["01", "02", "03", "04"]);
    }

    #[test]
    fn test_request_json_defaults_unit() {
        let req: ReadRequest =
            serde_json::from_str(r#"{"kind":"holding_registers","address":16,"quantity":2}"#)
                .unwrap();
        assert_eq!(req, ReadRequest::new(ReadKind::HoldingRegisters, 16, 2));
    }

    #[test]
    fn test_result_json_omits_empty_fields() {
        let mut result = ReadResult::for_request(&ReadRequest::new(ReadKind::Coils, 0, 2));
        result.bool_values = vec![true, false];
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "coils");
        assert_eq!(json["boolValues"][0], true);
        assert!(json.get("regValues").is_none());
        assert!(json.get("errorMessage").is_none());
        assert!(json.get("latencyMs").is_some());
    }

    #[test]
    fn test_stats_counters() {
        let mut stats = Stats::default();
        stats.record_success(12);
        stats.record_error(30);
        assert_eq!(
            stats,
            Stats {
                read_count: 1,
                error_count: 1,
                last_latency_ms: 30
            }
        );
    }
}
