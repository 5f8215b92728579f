//! Conversion between raw 16-bit holding registers and typed tag values.
//!
//! Both directions are pure. Sub-word kinds (`Boolean`, `Byte`) encode by
//! read-modify-write against the previous register word so that neighbouring
//! tags packed into the same register keep their bits.
//!
//! Numeric values that do not fit a register are rejected, never wrapped or
//! saturated.

use thiserror::Error;

use crate::tag::{ByteSelector, SemanticType, TagKind};
use crate::value::TagValue;

/// Error type for encoding a value into a register word.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: SemanticType,
        actual: SemanticType,
    },
    #[error("Value {value} does not fit a 16-bit register")]
    OutOfRange { value: String },
    #[error("Value {0} is not finite")]
    NotFinite(f32),
}

/// Decode the typed value of `kind` from a raw register word.
pub fn decode(raw: u16, kind: &TagKind) -> TagValue {
    match *kind {
        TagKind::Boolean { bit } => TagValue::Boolean((raw >> bit) & 1 != 0),
        TagKind::Byte(ByteSelector::Low) => TagValue::Byte((raw & 0xFF) as u8),
        TagKind::Byte(ByteSelector::High) => TagValue::Byte((raw >> 8) as u8),
        TagKind::Float => TagValue::Float(raw as f32),
        TagKind::Int32 => TagValue::Int32(raw as i32),
        TagKind::Int16 => TagValue::Int16(raw as i16),
    }
}

/// Encode `value` into the register word to write, starting from `previous`.
pub fn encode(value: &TagValue, previous: u16, kind: &TagKind) -> Result<u16, CodecError> {
    match (*kind, *value) {
        (TagKind::Boolean { bit }, TagValue::Boolean(set)) => {
            let mask = 1u16 << bit;
            Ok(if set { previous | mask } else { previous & !mask })
        }
        (TagKind::Byte(ByteSelector::Low), TagValue::Byte(b)) => {
            Ok((previous & 0xFF00) | u16::from(b))
        }
        (TagKind::Byte(ByteSelector::High), TagValue::Byte(b)) => {
            Ok((previous & 0x00FF) | (u16::from(b) << 8))
        }
        (TagKind::Int16, TagValue::Int16(x)) => Ok(x as u16),
        (TagKind::Int32, TagValue::Int32(x)) => {
            u16::try_from(x).map_err(|_| CodecError::OutOfRange {
                value: x.to_string(),
            })
        }
        (TagKind::Float, TagValue::Float(x)) => {
            if !x.is_finite() {
                return Err(CodecError::NotFinite(x));
            }
            let rounded = x.round();
            if !(0.0..=f32::from(u16::MAX)).contains(&rounded) {
                return Err(CodecError::OutOfRange {
                    value: x.to_string(),
                });
            }
            Ok(rounded as u16)
        }
        (kind, value) => Err(CodecError::TypeMismatch {
            expected: kind.semantic_type(),
            actual: value.semantic_type(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_boolean_bits() {
        let raw = 0b1000_0000_0000_0101;
        assert_eq!(decode(raw, &TagKind::Boolean { bit: 0 }), TagValue::Boolean(true));
        assert_eq!(decode(raw, &TagKind::Boolean { bit: 1 }), TagValue::Boolean(false));
        assert_eq!(decode(raw, &TagKind::Boolean { bit: 2 }), TagValue::Boolean(true));
        assert_eq!(decode(raw, &TagKind::Boolean { bit: 15 }), TagValue::Boolean(true));
    }

    #[test]
    fn test_byte_split() {
        let raw = 0x1234;
        assert_eq!(
            decode(raw, &TagKind::Byte(ByteSelector::Low)),
            TagValue::Byte(0x34)
        );
        assert_eq!(
            decode(raw, &TagKind::Byte(ByteSelector::High)),
            TagValue::Byte(0x12)
        );
    }

    #[test]
    fn test_boolean_round_trip_preserves_other_bits() {
        // Stride through the word space; every bit index per word.
        for raw in (0..=u16::MAX).step_by(97).chain([0, 0xFFFF, 0xAAAA, 0x5555]) {
            for bit in 0..16u8 {
                let kind = TagKind::Boolean { bit };
                let value = decode(raw, &kind);
                assert_eq!(encode(&value, raw, &kind), Ok(raw), "raw={raw:#06x} bit={bit}");
            }
        }
    }

    #[test]
    fn test_boolean_encode_touches_only_its_bit() {
        let kind = TagKind::Boolean { bit: 4 };
        assert_eq!(encode(&TagValue::Boolean(true), 0xFF00, &kind), Ok(0xFF10));
        assert_eq!(encode(&TagValue::Boolean(false), 0xFFFF, &kind), Ok(0xFFEF));
    }

    #[test]
    fn test_byte_encode_keeps_other_half() {
        assert_eq!(
            encode(&TagValue::Byte(0xAB), 0x1234, &TagKind::Byte(ByteSelector::Low)),
            Ok(0x12AB)
        );
        assert_eq!(
            encode(&TagValue::Byte(0xAB), 0x1234, &TagKind::Byte(ByteSelector::High)),
            Ok(0xAB34)
        );
    }

    #[test]
    fn test_word_types_pass_through() {
        assert_eq!(decode(0xFFFF, &TagKind::Int16), TagValue::Int16(-1));
        assert_eq!(decode(0xFFFF, &TagKind::Int32), TagValue::Int32(65535));
        assert_eq!(decode(1234, &TagKind::Float), TagValue::Float(1234.0));

        assert_eq!(encode(&TagValue::Int16(-1), 0, &TagKind::Int16), Ok(0xFFFF));
        assert_eq!(encode(&TagValue::Int32(99), 0x5555, &TagKind::Int32), Ok(99));
        assert_eq!(encode(&TagValue::Float(41.6), 0, &TagKind::Float), Ok(42));
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        assert!(matches!(
            encode(&TagValue::Int32(70_000), 0, &TagKind::Int32),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(&TagValue::Int32(-1), 0, &TagKind::Int32),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(&TagValue::Float(-3.0), 0, &TagKind::Float),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(&TagValue::Float(f32::NAN), 0, &TagKind::Float),
            Err(CodecError::NotFinite(_))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        assert_eq!(
            encode(&TagValue::Int16(1), 0, &TagKind::Boolean { bit: 0 }),
            Err(CodecError::TypeMismatch {
                expected: SemanticType::Boolean,
                actual: SemanticType::Int16,
            })
        );
    }
}
