//! Typed tag values and their OPC UA representation.

use opcua::types::{DataTypeId, Variant};
use std::fmt;

use crate::tag::SemanticType;

/// A decoded tag value, typed per [`SemanticType`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagValue {
    Float(f32),
    Int32(i32),
    Byte(u8),
    Int16(i16),
    Boolean(bool),
}

impl TagValue {
    pub fn semantic_type(&self) -> SemanticType {
        match self {
            TagValue::Float(_) => SemanticType::Float,
            TagValue::Int32(_) => SemanticType::Int32,
            TagValue::Byte(_) => SemanticType::Byte,
            TagValue::Int16(_) => SemanticType::Int16,
            TagValue::Boolean(_) => SemanticType::Boolean,
        }
    }

    /// Convert to an OPC UA Variant.
    pub fn to_variant(&self) -> Variant {
        match *self {
            TagValue::Float(x) => Variant::Float(x),
            TagValue::Int32(x) => Variant::Int32(x),
            TagValue::Byte(x) => Variant::Byte(x),
            TagValue::Int16(x) => Variant::Int16(x),
            TagValue::Boolean(x) => Variant::Boolean(x),
        }
    }

    /// Convert an OPC UA Variant written by a client into a value of `expected` type.
    ///
    /// Returns `None` when the variant does not carry exactly that type.
    pub fn from_variant(variant: &Variant, expected: SemanticType) -> Option<Self> {
        match (expected, variant) {
            (SemanticType::Float, Variant::Float(x)) => Some(TagValue::Float(*x)),
            (SemanticType::Int32, Variant::Int32(x)) => Some(TagValue::Int32(*x)),
            (SemanticType::Byte, Variant::Byte(x)) => Some(TagValue::Byte(*x)),
            (SemanticType::Int16, Variant::Int16(x)) => Some(TagValue::Int16(*x)),
            (SemanticType::Boolean, Variant::Boolean(x)) => Some(TagValue::Boolean(*x)),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Float(x) => write!(f, "{}", x),
            TagValue::Int32(x) => write!(f, "{}", x),
            TagValue::Byte(x) => write!(f, "{}", x),
            TagValue::Int16(x) => write!(f, "{}", x),
            TagValue::Boolean(x) => write!(f, "{}", x),
        }
    }
}

/// OPC UA data type of variables holding this semantic type.
pub fn data_type_id(ty: SemanticType) -> DataTypeId {
    match ty {
        SemanticType::Float => DataTypeId::Float,
        SemanticType::Int32 => DataTypeId::Int32,
        SemanticType::Byte => DataTypeId::Byte,
        SemanticType::Int16 => DataTypeId::Int16,
        SemanticType::Boolean => DataTypeId::Boolean,
    }
}
