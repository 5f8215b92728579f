//! The OPC UA side of the bridge, as seen by the builder and the engine.

use opcua::types::NodeId;
use thiserror::Error;

use crate::tag::SemanticType;
use crate::value::TagValue;

/// Error type for address-space operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AddressSpaceError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Node already exists: {0}")]
    DuplicateNode(String),
    #[error("Node {node} holds {expected}, got {actual}")]
    TypeMismatch {
        node: String,
        expected: SemanticType,
        actual: SemanticType,
    },
    #[error("OPC UA server error: {0}")]
    Server(String),
}

/// Typed, hierarchical store of OPC UA nodes.
///
/// Reading and writing a single variable must be atomic; OPC UA clients may
/// write concurrently with the engine.
pub trait AddressSpace {
    /// Container new top-level nodes are mounted under.
    fn root(&self) -> NodeId;

    /// Create an object (folder-like container) under `parent`.
    fn add_object(&self, parent: &NodeId, name: &str) -> Result<NodeId, AddressSpaceError>;

    /// Create a typed variable under `parent`, holding `initial`.
    ///
    /// `name` is both the string identifier and the display name.
    fn add_variable(
        &self,
        parent: &NodeId,
        name: &str,
        initial: TagValue,
        writable: bool,
    ) -> Result<NodeId, AddressSpaceError>;

    /// Current value of a variable, including writes made by OPC UA clients.
    fn get_value(&self, node: &NodeId) -> Result<TagValue, AddressSpaceError>;

    /// Replace a variable's value and notify subscribers.
    fn set_value(&self, node: &NodeId, value: TagValue) -> Result<(), AddressSpaceError>;
}

impl<T: AddressSpace + ?Sized> AddressSpace for &T {
    fn root(&self) -> NodeId {
        (**self).root()
    }

    fn add_object(&self, parent: &NodeId, name: &str) -> Result<NodeId, AddressSpaceError> {
        (**self).add_object(parent, name)
    }

    fn add_variable(
        &self,
        parent: &NodeId,
        name: &str,
        initial: TagValue,
        writable: bool,
    ) -> Result<NodeId, AddressSpaceError> {
        (**self).add_variable(parent, name, initial, writable)
    }

    fn get_value(&self, node: &NodeId) -> Result<TagValue, AddressSpaceError> {
        (**self).get_value(node)
    }

    fn set_value(&self, node: &NodeId, value: TagValue) -> Result<(), AddressSpaceError> {
        (**self).set_value(node, value)
    }
}
