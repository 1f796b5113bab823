//! Register decoding
//!
//! Maps a window of raw 16-bit registers to typed values under a
//! [`DecoderConfig`]. 16-bit types read the first register as-is; 32-bit
//! types take the first two registers, apply word order, then lay out each
//! register's bytes according to the endianness before reading the four
//! bytes as a big-endian word.

use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::config::{DecoderConfig, DecoderType, Endianness, ValueBase, WordOrder};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("insufficient data: need {needed} registers, have {available}")]
    InsufficientData { needed: usize, available: usize },
}

/// Decoded number, serialized as a bare JSON number
///
/// The variant is not recoverable from the number alone; [`DecodedValue`]
/// uses its `type` field to pick it when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NumericValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl NumericValue {
    /// Render for display; unsigned integers honour the value base
    pub fn display(&self, base: ValueBase) -> String {
        match (self, base) {
            (NumericValue::U16(v), _) => base.format_value(*v),
            (NumericValue::U32(v), ValueBase::Hex) => format!("0x{:08x}", v),
            (NumericValue::U32(v), ValueBase::Dec) => v.to_string(),
            (NumericValue::I16(v), _) => v.to_string(),
            (NumericValue::I32(v), _) => v.to_string(),
            (NumericValue::F32(v), _) => crate::config::format_float(*v),
        }
    }

    /// Rebuild a value of `decoder_type` from a wire number
    ///
    /// `None` stands for a non-finite float, which JSON carries as `null`.
    fn from_wire(decoder_type: DecoderType, raw: Option<f64>) -> Option<Self> {
        let Some(v) = raw else {
            return (decoder_type == DecoderType::Float32).then_some(NumericValue::F32(f32::NAN));
        };
        let integral = v.fract() == 0.0;
        match decoder_type {
            DecoderType::Uint16 if integral && (0.0..=f64::from(u16::MAX)).contains(&v) => {
                Some(NumericValue::U16(v as u16))
            },
            DecoderType::Int16
                if integral && (f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&v) =>
            {
                Some(NumericValue::I16(v as i16))
            },
            DecoderType::Uint32 if integral && (0.0..=f64::from(u32::MAX)).contains(&v) => {
                Some(NumericValue::U32(v as u32))
            },
            DecoderType::Int32
                if integral && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&v) =>
            {
                Some(NumericValue::I32(v as i32))
            },
            DecoderType::Float32 => Some(NumericValue::F32(v as f32)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodedValue {
    #[serde(rename = "type")]
    pub decoder_type: DecoderType,
    pub value: NumericValue,
}

impl<'de> Deserialize<'de> for DecodedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "type")]
            decoder_type: DecoderType,
            value: Option<f64>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let value = NumericValue::from_wire(wire.decoder_type, wire.value).ok_or_else(|| {
            de::Error::custom(format!(
                "value {:?} does not fit {}",
                wire.value,
                wire.decoder_type.as_str()
            ))
        })?;
        Ok(DecodedValue {
            decoder_type: wire.decoder_type,
            value,
        })
    }
}

/// Decode every enabled decoder over `regs`
///
/// Output follows the fixed type order uint16, int16, uint32, int32, float32.
/// The first enabled configuration for a type wins. Decoders whose register
/// requirement is not met are skipped.
pub fn decode_values(regs: &[u16], decoders: &[DecoderConfig]) -> Vec<DecodedValue> {
    DecoderType::ALL
        .iter()
        .filter_map(|t| {
            decoders
                .iter()
                .find(|d| d.decoder_type == *t && d.enabled)
        })
        .filter_map(|d| decode_with_config(regs, d).ok())
        .collect()
}

/// Decode the start of `regs` with a single configuration
pub fn decode_with_config(
    regs: &[u16],
    decoder: &DecoderConfig,
) -> Result<DecodedValue, DecodeError> {
    let needed = decoder.decoder_type.register_count();
    if regs.len() < needed {
        return Err(DecodeError::InsufficientData {
            needed,
            available: regs.len(),
        });
    }

    let value = match decoder.decoder_type {
        DecoderType::Uint16 => NumericValue::U16(regs[0]),
        DecoderType::Int16 => NumericValue::I16(regs[0] as i16),
        DecoderType::Uint32 => NumericValue::U32(assemble_u32(
            [regs[0], regs[1]],
            decoder.endianness,
            decoder.word_order,
        )),
        DecoderType::Int32 => NumericValue::I32(assemble_u32(
            [regs[0], regs[1]],
            decoder.endianness,
            decoder.word_order,
        ) as i32),
        DecoderType::Float32 => NumericValue::F32(f32::from_bits(assemble_u32(
            [regs[0], regs[1]],
            decoder.endianness,
            decoder.word_order,
        ))),
    };

    Ok(DecodedValue {
        decoder_type: decoder.decoder_type,
        value,
    })
}

/// Build a 32-bit word from a register pair
pub fn assemble_u32(pair: [u16; 2], endianness: Endianness, word_order: WordOrder) -> u32 {
    let [first, second] = match word_order {
        WordOrder::HighFirst => pair,
        WordOrder::LowFirst => [pair[1], pair[0]],
    };
    let register_bytes = |reg: u16| match endianness {
        Endianness::Big => reg.to_be_bytes(),
        Endianness::Little => reg.to_le_bytes(),
    };
    let [a, b] = register_bytes(first);
    let [c, d] = register_bytes(second);
    u32::from_be_bytes([a, b, c, d])
}
