//! Address-space construction from the declarative node tree.
//!
//! Building runs in two passes. The first validates the whole tree and
//! resolves every variable into a [`TagKind`] without touching the address
//! space; the second creates the nodes depth-first and registers one
//! [`Tag`] per variable. A bad declaration therefore never leaves a
//! half-populated address space behind.

use opcua::types::NodeId;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::config::{ConfigError, NodeConfig, VariableConfig};
use crate::registry::{RegistryError, TagRegistry};
use crate::tag::{ByteSelector, ModbusType, SemanticType, Tag, TagKind};

/// Error type for address-space construction. All variants abort startup.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Duplicate node name '{0}'")]
    DuplicateName(String),
    #[error("Tags '{existing}' and '{new}' claim overlapping bits of register {address}")]
    AddressCollision {
        address: u16,
        existing: String,
        new: String,
    },
    #[error("Address space error: {0}")]
    AddressSpace(#[from] AddressSpaceError),
}

impl From<RegistryError> for BuildError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateName(name) => BuildError::DuplicateName(name),
            RegistryError::AddressCollision {
                address,
                existing,
                new,
            } => BuildError::AddressCollision {
                address,
                existing,
                new,
            },
        }
    }
}

/// A validated variable declaration.
#[derive(Debug, Clone)]
struct VariablePlan {
    name: String,
    kind: TagKind,
    modbus_address: u16,
    modbus_type: ModbusType,
    writable: bool,
}

#[derive(Debug, Clone)]
enum NodePlan {
    Object { name: String, children: Vec<NodePlan> },
    Variable(VariablePlan),
}

/// Populate `space` under `mount` from the node tree and return the tag registry.
pub fn build_address_space<S: AddressSpace + ?Sized>(
    nodes: &[NodeConfig],
    space: &S,
    mount: &NodeId,
) -> Result<TagRegistry, BuildError> {
    let plan = plan_nodes(nodes)?;

    // Dry-run the registry so name and register collisions fail before any node exists
    let mut check = TagRegistry::new();
    for variable in plan_variables(&plan) {
        check.insert(Tag::new(
            variable.name.clone(),
            variable.kind,
            variable.modbus_address,
            NodeId::null(),
        ))?;
    }

    let mut registry = TagRegistry::new();
    materialize(&plan, space, mount, &mut registry)?;

    if let Some(window) = registry.window() {
        info!(
            tags = registry.len(),
            start = window.min,
            count = window.width(),
            "Address space built"
        );
    }

    Ok(registry)
}

fn plan_nodes(nodes: &[NodeConfig]) -> Result<Vec<NodePlan>, BuildError> {
    let mut siblings = HashSet::new();
    let mut plans = Vec::with_capacity(nodes.len());

    for node in nodes {
        let plan = match node {
            NodeConfig::ObjectNode(object) => NodePlan::Object {
                name: object.name.clone(),
                children: plan_nodes(&object.nodes)?,
            },
            NodeConfig::VariableNode(variable) => NodePlan::Variable(plan_variable(variable)?),
        };

        let name = match &plan {
            NodePlan::Object { name, .. } => name,
            NodePlan::Variable(v) => &v.name,
        };
        if !siblings.insert(name.clone()) {
            return Err(BuildError::DuplicateName(name.clone()));
        }

        plans.push(plan);
    }

    Ok(plans)
}

fn plan_variable(config: &VariableConfig) -> Result<VariablePlan, ConfigError> {
    let name = config.name.clone().ok_or_else(|| ConfigError::MissingField {
        node: describe(config),
        field: "name",
    })?;

    let type_name = config.r#type.as_deref().ok_or_else(|| ConfigError::MissingField {
        node: describe(config),
        field: "type",
    })?;

    let semantic_type: SemanticType = type_name.parse().map_err(|value| ConfigError::UnknownType {
        name: name.clone(),
        value,
    })?;

    let modbus_address = config.modbus_address.ok_or_else(|| ConfigError::MissingField {
        node: describe(config),
        field: "modbus_address",
    })?;

    let modbus_type = match config.modbus_type.as_deref() {
        None => ModbusType::HoldingRegister,
        Some(value) => value
            .parse::<ModbusType>()
            .map_err(|value| ConfigError::UnknownModbusType {
                name: name.clone(),
                value,
            })?,
    };
    if !modbus_type.is_supported() {
        return Err(ConfigError::UnsupportedModbusType {
            name,
            value: modbus_type.to_string(),
        });
    }

    let kind = resolve_kind(&name, semantic_type, config.modbus_bit)?;

    Ok(VariablePlan {
        name,
        kind,
        modbus_address,
        modbus_type,
        writable: config.opc_writable,
    })
}

fn resolve_kind(
    name: &str,
    semantic_type: SemanticType,
    modbus_bit: Option<u8>,
) -> Result<TagKind, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSelector {
        name: name.to_string(),
        reason,
    };

    match (semantic_type, modbus_bit) {
        (SemanticType::Boolean, Some(bit)) if bit < 16 => Ok(TagKind::Boolean { bit }),
        (SemanticType::Boolean, Some(bit)) => {
            Err(invalid(format!("modbus_bit {} is out of range 0-15", bit)))
        }
        (SemanticType::Boolean, None) => Err(invalid(
            "boolean variables require modbus_bit (0-15)".to_string(),
        )),
        (SemanticType::Byte, Some(0)) => Ok(TagKind::Byte(ByteSelector::Low)),
        (SemanticType::Byte, Some(bit)) if bit < 16 => Ok(TagKind::Byte(ByteSelector::High)),
        (SemanticType::Byte, Some(bit)) => {
            Err(invalid(format!("modbus_bit {} is out of range 0-15", bit)))
        }
        (SemanticType::Byte, None) => Err(invalid(
            "byte variables require modbus_bit (0 for the low byte, 8 for the high byte)"
                .to_string(),
        )),
        (other, Some(_)) => Err(invalid(format!(
            "modbus_bit is only valid for boolean and byte variables, not {}",
            other
        ))),
        (SemanticType::Float, None) => Ok(TagKind::Float),
        (SemanticType::Int32, None) => Ok(TagKind::Int32),
        (SemanticType::Int16, None) => Ok(TagKind::Int16),
    }
}

fn describe(config: &VariableConfig) -> String {
    match (&config.name, config.modbus_address) {
        (Some(name), _) => format!("'{}'", name),
        (None, Some(address)) => format!("at modbus_address {}", address),
        (None, None) => "<unnamed>".to_string(),
    }
}

fn plan_variables(plans: &[NodePlan]) -> Vec<&VariablePlan> {
    let mut out = Vec::new();
    for plan in plans {
        match plan {
            NodePlan::Object { children, .. } => out.extend(plan_variables(children)),
            NodePlan::Variable(v) => out.push(v),
        }
    }
    out
}

fn materialize<S: AddressSpace + ?Sized>(
    plans: &[NodePlan],
    space: &S,
    mount: &NodeId,
    registry: &mut TagRegistry,
) -> Result<(), BuildError> {
    for plan in plans {
        match plan {
            NodePlan::Object { name, children } => {
                let object = space.add_object(mount, name)?;
                debug!(object = %name, "Created object node");
                materialize(children, space, &object, registry)?;
            }
            NodePlan::Variable(v) => {
                let node = space.add_variable(mount, &v.name, v.kind.zero_value(), v.writable)?;
                debug!(
                    tag = %v.name,
                    kind = %v.kind.semantic_type(),
                    address = v.modbus_address,
                    writable = v.writable,
                    "Created variable node"
                );
                let tag = Tag::new(v.name.clone(), v.kind, v.modbus_address, node)
                    .writable(v.writable)
                    .with_modbus_type(v.modbus_type);
                registry.insert(tag)?;
            }
        }
    }
    Ok(())
}
