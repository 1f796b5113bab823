//! Configuration model for the Modbus master
//!
//! The JSON field names match what the web dashboard posts back, so a
//! configuration round-trips through the UI unchanged.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModmasterError, Result};

/// Standard Modbus TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Prefix for environment overrides, e.g. `MODMASTER_TCP__HOST`
pub const ENV_PREFIX: &str = "MODMASTER_";

// ============================================================================
// Transport selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Rtu,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Rtu => write!(f, "rtu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "none"),
            Parity::Even => write!(f, "even"),
            Parity::Odd => write!(f, "odd"),
        }
    }
}

impl FromStr for Parity {
    type Err = ModmasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            other => Err(ModmasterError::invalid_input(format!(
                "unsupported parity: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    pub device: String,
    pub speed: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            speed: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

// ============================================================================
// Addressing and display bases
// ============================================================================

/// Whether address 0 or address 1 names the first element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AddressBase {
    #[default]
    Zero,
    One,
}

impl AddressBase {
    /// Translate a user-facing address to the address sent on the wire
    ///
    /// One-based address 0 has no predecessor and passes through unchanged.
    pub fn to_wire(self, address: u16) -> u16 {
        match self {
            AddressBase::One if address > 0 => address - 1,
            _ => address,
        }
    }
}

impl TryFrom<u8> for AddressBase {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(AddressBase::Zero),
            1 => Ok(AddressBase::One),
            other => Err(format!("address base must be 0 or 1, got {}", other)),
        }
    }
}

impl From<AddressBase> for u8 {
    fn from(base: AddressBase) -> Self {
        match base {
            AddressBase::Zero => 0,
            AddressBase::One => 1,
        }
    }
}

/// Numeric base used when rendering addresses and register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ValueBase {
    #[default]
    Dec,
    Hex,
}

impl ValueBase {
    pub fn label(self) -> &'static str {
        match self {
            ValueBase::Dec => "dec",
            ValueBase::Hex => "hex",
        }
    }

    pub fn format_address(self, address: u32) -> String {
        match self {
            ValueBase::Hex => format!("0x{:04x}", address),
            ValueBase::Dec => address.to_string(),
        }
    }

    pub fn format_value(self, value: u16) -> String {
        match self {
            ValueBase::Hex => format!("0x{:04x}", value),
            ValueBase::Dec => value.to_string(),
        }
    }
}

impl TryFrom<u8> for ValueBase {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            10 => Ok(ValueBase::Dec),
            16 => Ok(ValueBase::Hex),
            other => Err(format!("value base must be 10 or 16, got {}", other)),
        }
    }
}

impl From<ValueBase> for u8 {
    fn from(base: ValueBase) -> Self {
        match base {
            ValueBase::Dec => 10,
            ValueBase::Hex => 16,
        }
    }
}

impl FromStr for ValueBase {
    type Err = ModmasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "10" | "dec" | "decimal" => Ok(ValueBase::Dec),
            "16" | "hex" | "hexadecimal" => Ok(ValueBase::Hex),
            other => Err(ModmasterError::invalid_input(format!(
                "unsupported base: {}",
                other
            ))),
        }
    }
}

/// Format a decoded float the way the value table shows it
pub fn format_float(value: f32) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value.abs() >= 1e21 {
        format!("{:.3e}", value)
    } else {
        format!("{:.3}", value)
    }
}

/// Parse a user-entered address, decimal or `0x`-prefixed hex
pub fn parse_address(input: &str) -> Result<u16> {
    let value = input.trim().to_lowercase();
    if value.is_empty() {
        return Err(ModmasterError::invalid_input("address cannot be empty"));
    }
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    match parsed {
        Ok(address) if address <= u32::from(u16::MAX) => Ok(address as u16),
        _ => Err(ModmasterError::invalid_input("address must be 0-65535")),
    }
}

// ============================================================================
// Decoders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
}

impl DecoderType {
    /// Canonical decode order
    pub const ALL: [DecoderType; 5] = [
        DecoderType::Uint16,
        DecoderType::Int16,
        DecoderType::Uint32,
        DecoderType::Int32,
        DecoderType::Float32,
    ];

    /// Registers consumed by one value of this type
    pub fn register_count(self) -> usize {
        match self {
            DecoderType::Uint16 | DecoderType::Int16 => 1,
            DecoderType::Uint32 | DecoderType::Int32 | DecoderType::Float32 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecoderType::Uint16 => "uint16",
            DecoderType::Int16 => "int16",
            DecoderType::Uint32 => "uint32",
            DecoderType::Int32 => "int32",
            DecoderType::Float32 => "float32",
        }
    }

    /// CLI flag name for this type
    pub fn flag(self) -> &'static str {
        match self {
            DecoderType::Uint16 => "u16",
            DecoderType::Int16 => "i16",
            DecoderType::Uint32 => "u32",
            DecoderType::Int32 => "i32",
            DecoderType::Float32 => "f32",
        }
    }
}

impl fmt::Display for DecoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WordOrder {
    #[default]
    HighFirst,
    LowFirst,
}

/// Decoding rule for one numeric type
///
/// Word order only matters for the 32-bit types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoderConfig {
    #[serde(rename = "type")]
    pub decoder_type: DecoderType,
    pub endianness: Endianness,
    pub word_order: WordOrder,
    pub enabled: bool,
}

impl DecoderConfig {
    /// Disabled, big-endian, high-word-first
    pub fn new(decoder_type: DecoderType) -> Self {
        Self {
            decoder_type,
            endianness: Endianness::Big,
            word_order: WordOrder::HighFirst,
            enabled: false,
        }
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    /// Parse a CLI decoder spec such as `le,lf` on top of `defaults`
    ///
    /// The result is always enabled. Options: `be`, `le`, `hf`, `lf`.
    pub fn from_spec(spec: &str, defaults: DecoderConfig) -> Result<Self> {
        let spec = spec.trim().to_lowercase();
        if spec.is_empty() {
            return Err(ModmasterError::invalid_input(
                "decoder flag requires a value",
            ));
        }
        let mut decoder = defaults.enabled();
        for part in spec.split([',', ' ']).filter(|p| !p.is_empty()) {
            match part {
                "be" => decoder.endianness = Endianness::Big,
                "le" => decoder.endianness = Endianness::Little,
                "hf" => decoder.word_order = WordOrder::HighFirst,
                "lf" => decoder.word_order = WordOrder::LowFirst,
                other => {
                    return Err(ModmasterError::invalid_input(format!(
                        "unsupported decoder option: {}",
                        other
                    )))
                },
            }
        }
        Ok(decoder)
    }

    /// Inverse of [`DecoderConfig::from_spec`]
    pub fn spec(&self) -> String {
        let endian = match self.endianness {
            Endianness::Big => "be",
            Endianness::Little => "le",
        };
        if self.decoder_type.register_count() == 1 {
            return endian.to_string();
        }
        let order = match self.word_order {
            WordOrder::HighFirst => "hf",
            WordOrder::LowFirst => "lf",
        };
        format!("{},{}", endian, order)
    }
}

// ============================================================================
// Service configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub protocol: Protocol,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub address_base: AddressBase,
    pub address_format: ValueBase,
    pub value_base: ValueBase,
    pub serial: SerialConfig,
    pub tcp: TcpConfig,
    pub decoders: Vec<DecoderConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            unit_id: 1,
            timeout_ms: 1000,
            address_base: AddressBase::Zero,
            address_format: ValueBase::Dec,
            value_base: ValueBase::Dec,
            serial: SerialConfig::default(),
            tcp: TcpConfig::default(),
            decoders: DecoderType::ALL
                .iter()
                .map(|t| DecoderConfig::new(*t))
                .collect(),
        }
    }
}

impl ServiceConfig {
    /// Load defaults, then `path` (if any), then `MODMASTER_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: ServiceConfig =
            common::config_loader::load_layered(&ServiceConfig::default(), path, ENV_PREFIX)?;
        // A file listing only some decoders replaces the whole default list
        config.fill_missing_decoders();
        config.validate()?;
        Ok(config)
    }

    /// Add a disabled default decoder for every type the set lacks
    pub fn fill_missing_decoders(&mut self) {
        for decoder_type in DecoderType::ALL {
            if self.decoder(decoder_type).is_none() {
                self.decoders.push(DecoderConfig::new(decoder_type));
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `tcp://host:port` or `rtu://device`
    pub fn connection_url(&self) -> String {
        match self.protocol {
            Protocol::Tcp => format!("tcp://{}:{}", self.tcp.host, self.tcp.port),
            Protocol::Rtu => format!("rtu://{}", self.serial.device),
        }
    }

    /// One-line description used in connect attempt logs
    pub fn connection_summary(&self) -> String {
        match self.protocol {
            Protocol::Tcp => format!("{} timeout={}ms", self.connection_url(), self.timeout_ms),
            Protocol::Rtu => format!(
                "{} speed={} data={} stop={} parity={} timeout={}ms",
                self.connection_url(),
                self.serial.speed,
                self.serial.data_bits,
                self.serial.stop_bits,
                self.serial.parity,
                self.timeout_ms,
            ),
        }
    }

    pub fn decoder(&self, decoder_type: DecoderType) -> Option<&DecoderConfig> {
        self.decoders
            .iter()
            .find(|d| d.decoder_type == decoder_type)
    }

    /// Replace the decoder for its type, appending when absent
    pub fn set_decoder(&mut self, decoder: DecoderConfig) {
        match self
            .decoders
            .iter_mut()
            .find(|d| d.decoder_type == decoder.decoder_type)
        {
            Some(slot) => *slot = decoder,
            None => self.decoders.push(decoder),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ModmasterError::config("timeoutMs must be greater than 0"));
        }
        match self.protocol {
            Protocol::Tcp => {
                if self.tcp.host.trim().is_empty() {
                    return Err(ModmasterError::config("tcp.host cannot be empty"));
                }
                if self.tcp.port == 0 {
                    return Err(ModmasterError::config("tcp.port cannot be 0"));
                }
            },
            Protocol::Rtu => {
                if self.serial.device.trim().is_empty() {
                    return Err(ModmasterError::config("serial.device cannot be empty"));
                }
                if self.serial.speed == 0 {
                    return Err(ModmasterError::config("serial.speed cannot be 0"));
                }
                if !(5..=8).contains(&self.serial.data_bits) {
                    return Err(ModmasterError::config("serial.dataBits must be 5-8"));
                }
                if !(1..=2).contains(&self.serial.stop_bits) {
                    return Err(ModmasterError::config("serial.stopBits must be 1 or 2"));
                }
            },
        }
        for decoder_type in DecoderType::ALL {
            let count = self
                .decoders
                .iter()
                .filter(|d| d.decoder_type == decoder_type)
                .count();
            if count == 0 {
                return Err(ModmasterError::config(format!(
                    "missing decoder configuration for {}",
                    decoder_type
                )));
            }
            if count > 1 {
                return Err(ModmasterError::config(format!(
                    "duplicate decoder configuration for {}",
                    decoder_type
                )));
            }
        }
        Ok(())
    }

    /// Reconstruct the command line that yields this configuration
    ///
    /// Only options that differ from the defaults are listed.
    pub fn invocation(&self) -> String {
        let defaults = ServiceConfig::default();
        let mut parts: Vec<String> = vec!["modmaster".to_string()];
        let mut push = |flag: &str, value: String| {
            parts.push(flag.to_string());
            parts.push(value);
        };

        match self.protocol {
            Protocol::Rtu => {
                push("--serial", self.serial.device.clone());
                if self.serial.speed != defaults.serial.speed {
                    push("--speed", self.serial.speed.to_string());
                }
                if self.serial.data_bits != defaults.serial.data_bits {
                    push("--databits", self.serial.data_bits.to_string());
                }
                if self.serial.parity != defaults.serial.parity {
                    push("--parity", self.serial.parity.to_string());
                }
                if self.serial.stop_bits != defaults.serial.stop_bits {
                    push("--stopbits", self.serial.stop_bits.to_string());
                }
            },
            Protocol::Tcp => {
                if self.tcp.host != defaults.tcp.host {
                    push("--host", self.tcp.host.clone());
                }
                if self.tcp.port != defaults.tcp.port {
                    push("--port", self.tcp.port.to_string());
                }
            },
        }
        if self.unit_id != defaults.unit_id {
            push("--unit-id", self.unit_id.to_string());
        }
        if self.timeout_ms != defaults.timeout_ms {
            push("--timeout", self.timeout_ms.to_string());
        }
        if self.address_base != defaults.address_base {
            push("--address-base", u8::from(self.address_base).to_string());
        }
        if self.address_format != defaults.address_format {
            push("--address-format", self.address_format.label().to_string());
        }
        if self.value_base != defaults.value_base {
            push("--value-base", self.value_base.label().to_string());
        }
        for decoder_type in DecoderType::ALL {
            if let Some(decoder) = self.decoder(decoder_type).filter(|d| d.enabled) {
                push(&format!("--{}", decoder_type.flag()), decoder.spec());
            }
        }
        parts.join(" ")
    }
}
