//! Tag model: one mapped point between a holding register and an OPC UA variable.

use opcua::types::NodeId;
use std::fmt;
use std::str::FromStr;

use crate::value::TagValue;

/// Semantic type of a tag, as named in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticType {
    /// `float` - OPC UA Float
    Float,
    /// `int` - OPC UA Int32
    Int32,
    /// `byte` - OPC UA Byte, one half of a register
    Byte,
    /// `word` - OPC UA Int16
    Int16,
    /// `boolean` - OPC UA Boolean, one bit of a register
    Boolean,
}

impl SemanticType {
    /// Return the configuration name for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Float => "float",
            SemanticType::Int32 => "int",
            SemanticType::Byte => "byte",
            SemanticType::Int16 => "word",
            SemanticType::Boolean => "boolean",
        }
    }
}

impl FromStr for SemanticType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(SemanticType::Float),
            "int" => Ok(SemanticType::Int32),
            "byte" => Ok(SemanticType::Byte),
            "word" => Ok(SemanticType::Int16),
            "boolean" => Ok(SemanticType::Boolean),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of a 16-bit register a byte tag occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteSelector {
    /// Bits 0-7
    Low,
    /// Bits 8-15
    High,
}

/// Semantic type together with its sub-word location.
///
/// Only `Boolean` carries a bit index and only `Byte` carries a byte selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Float,
    Int32,
    Int16,
    Byte(ByteSelector),
    /// `bit` is in 0..=15.
    Boolean { bit: u8 },
}

impl TagKind {
    pub fn semantic_type(&self) -> SemanticType {
        match self {
            TagKind::Float => SemanticType::Float,
            TagKind::Int32 => SemanticType::Int32,
            TagKind::Int16 => SemanticType::Int16,
            TagKind::Byte(_) => SemanticType::Byte,
            TagKind::Boolean { .. } => SemanticType::Boolean,
        }
    }

    /// Bits of the register this kind occupies.
    ///
    /// Two tags on the same address conflict when their masks intersect.
    pub fn claim_mask(&self) -> u16 {
        match self {
            TagKind::Boolean { bit } => 1u16 << *bit,
            TagKind::Byte(ByteSelector::Low) => 0x00FF,
            TagKind::Byte(ByteSelector::High) => 0xFF00,
            TagKind::Float | TagKind::Int32 | TagKind::Int16 => 0xFFFF,
        }
    }

    /// Value a freshly created variable of this kind holds.
    pub fn zero_value(&self) -> TagValue {
        match self {
            TagKind::Float => TagValue::Float(0.0),
            TagKind::Int32 => TagValue::Int32(0),
            TagKind::Int16 => TagValue::Int16(0),
            TagKind::Byte(_) => TagValue::Byte(0),
            TagKind::Boolean { .. } => TagValue::Boolean(false),
        }
    }
}

/// Modbus object table a tag is mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusType {
    /// Holding registers (read/write, 16-bit)
    HoldingRegister,
    /// Input registers (read-only, 16-bit)
    InputRegister,
    /// Discrete output coils
    Coil,
    /// Discrete input contacts
    DiscreteInput,
}

impl ModbusType {
    /// Return the configuration name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModbusType::HoldingRegister => "holding_register",
            ModbusType::InputRegister => "input_register",
            ModbusType::Coil => "coil",
            ModbusType::DiscreteInput => "discrete_input",
        }
    }

    /// Whether the synchronization engine can serve this register type.
    pub fn is_supported(&self) -> bool {
        matches!(self, ModbusType::HoldingRegister)
    }
}

impl FromStr for ModbusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holding_register" => Ok(ModbusType::HoldingRegister),
            "input_register" => Ok(ModbusType::InputRegister),
            "coil" => Ok(ModbusType::Coil),
            "discrete_input" => Ok(ModbusType::DiscreteInput),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ModbusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mapped point, tied to exactly one OPC UA variable node.
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub modbus_address: u16,
    pub modbus_type: ModbusType,
    /// Propagate OPC UA writes back to the register.
    pub writable: bool,
    /// Variable node this tag reads from and writes to.
    pub node: NodeId,
    /// Last value the engine pushed to either side; `None` until the first cycle.
    pub last_observed: Option<TagValue>,
}

impl Tag {
    /// Create a holding-register tag that has never been observed.
    pub fn new(name: impl Into<String>, kind: TagKind, modbus_address: u16, node: NodeId) -> Self {
        Self {
            name: name.into(),
            kind,
            modbus_address,
            modbus_type: ModbusType::HoldingRegister,
            writable: false,
            node,
            last_observed: None,
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_modbus_type(mut self, modbus_type: ModbusType) -> Self {
        self.modbus_type = modbus_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_type_names() {
        for ty in [
            SemanticType::Float,
            SemanticType::Int32,
            SemanticType::Byte,
            SemanticType::Int16,
            SemanticType::Boolean,
        ] {
            assert_eq!(ty.as_str().parse::<SemanticType>(), Ok(ty));
        }
        assert_eq!("double".parse::<SemanticType>(), Err("double".to_string()));
    }

    #[test]
    fn test_modbus_type_support() {
        assert_eq!(
            "holding_register".parse::<ModbusType>(),
            Ok(ModbusType::HoldingRegister)
        );
        assert!(ModbusType::HoldingRegister.is_supported());
        assert!(!ModbusType::Coil.is_supported());
        assert!("holding".parse::<ModbusType>().is_err());
    }

    #[test]
    fn test_claim_masks() {
        assert_eq!(TagKind::Boolean { bit: 0 }.claim_mask(), 0x0001);
        assert_eq!(TagKind::Boolean { bit: 15 }.claim_mask(), 0x8000);
        assert_eq!(TagKind::Byte(ByteSelector::Low).claim_mask(), 0x00FF);
        assert_eq!(TagKind::Byte(ByteSelector::High).claim_mask(), 0xFF00);
        assert_eq!(TagKind::Int16.claim_mask(), 0xFFFF);
    }

    #[test]
    fn test_new_tag_is_unobserved() {
        let tag = Tag::new("Speed", TagKind::Int16, 3, NodeId::new(1, "Speed"));
        assert!(tag.last_observed.is_none());
        assert!(!tag.writable);
        assert_eq!(tag.modbus_type, ModbusType::HoldingRegister);
        assert_eq!(tag.kind.semantic_type(), SemanticType::Int16);
    }
}
