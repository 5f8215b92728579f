//! In-memory [`AddressSpace`], used in place of a running OPC UA server.

use opcua::types::{NodeId, ObjectId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::value::TagValue;

#[derive(Debug, Clone)]
enum MemoryNode {
    Object,
    Variable { value: TagValue, writable: bool },
}

#[derive(Debug, Default)]
struct Nodes {
    nodes: HashMap<NodeId, MemoryNode>,
    children: HashMap<NodeId, Vec<(String, NodeId)>>,
}

/// Address space backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryAddressSpace {
    inner: Mutex<Nodes>,
    namespace: u16,
    next_object_id: AtomicU32,
    set_calls: AtomicUsize,
}

impl MemoryAddressSpace {
    pub fn new(namespace: u16) -> Self {
        Self {
            namespace,
            next_object_id: AtomicU32::new(1),
            ..Default::default()
        }
    }

    /// Simulate an OPC UA client writing a variable.
    pub fn client_write(&self, node: &NodeId, value: TagValue) -> Result<(), AddressSpaceError> {
        let mut inner = self.lock();
        match inner.nodes.get_mut(node) {
            Some(MemoryNode::Variable {
                value: current,
                writable,
            }) => {
                if !*writable {
                    return Err(AddressSpaceError::Server(format!("{node} is not writable")));
                }
                check_type(node, current, &value)?;
                *current = value;
                Ok(())
            }
            _ => Err(AddressSpaceError::UnknownNode(node.to_string())),
        }
    }

    /// Number of `set_value` calls made so far.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Display names of the children of `parent`, in insertion order.
    pub fn children(&self, parent: &NodeId) -> Vec<String> {
        self.lock()
            .children
            .get(parent)
            .map(|c| c.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_writable(&self, node: &NodeId) -> Option<bool> {
        match self.lock().nodes.get(node) {
            Some(MemoryNode::Variable { writable, .. }) => Some(*writable),
            _ => None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Nodes> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(
        &self,
        parent: &NodeId,
        name: &str,
        id: NodeId,
        node: MemoryNode,
    ) -> Result<NodeId, AddressSpaceError> {
        let mut inner = self.lock();
        let root = self.root();
        if *parent != root && !matches!(inner.nodes.get(parent), Some(MemoryNode::Object)) {
            return Err(AddressSpaceError::UnknownNode(parent.to_string()));
        }
        if inner.nodes.contains_key(&id) {
            return Err(AddressSpaceError::DuplicateNode(id.to_string()));
        }
        inner.nodes.insert(id.clone(), node);
        inner
            .children
            .entry(parent.clone())
            .or_default()
            .push((name.to_string(), id.clone()));
        Ok(id)
    }
}

fn check_type(node: &NodeId, current: &TagValue, new: &TagValue) -> Result<(), AddressSpaceError> {
    if current.semantic_type() != new.semantic_type() {
        return Err(AddressSpaceError::TypeMismatch {
            node: node.to_string(),
            expected: current.semantic_type(),
            actual: new.semantic_type(),
        });
    }
    Ok(())
}

impl AddressSpace for MemoryAddressSpace {
    fn root(&self) -> NodeId {
        ObjectId::ObjectsFolder.into()
    }

    fn add_object(&self, parent: &NodeId, name: &str) -> Result<NodeId, AddressSpaceError> {
        let id = NodeId::new(
            self.namespace,
            self.next_object_id.fetch_add(1, Ordering::SeqCst),
        );
        self.insert(parent, name, id, MemoryNode::Object)
    }

    fn add_variable(
        &self,
        parent: &NodeId,
        name: &str,
        initial: TagValue,
        writable: bool,
    ) -> Result<NodeId, AddressSpaceError> {
        let id = NodeId::new(self.namespace, name.to_string());
        self.insert(
            parent,
            name,
            id,
            MemoryNode::Variable {
                value: initial,
                writable,
            },
        )
    }

    fn get_value(&self, node: &NodeId) -> Result<TagValue, AddressSpaceError> {
        match self.lock().nodes.get(node) {
            Some(MemoryNode::Variable { value, .. }) => Ok(*value),
            _ => Err(AddressSpaceError::UnknownNode(node.to_string())),
        }
    }

    fn set_value(&self, node: &NodeId, value: TagValue) -> Result<(), AddressSpaceError> {
        let mut inner = self.lock();
        match inner.nodes.get_mut(node) {
            Some(MemoryNode::Variable { value: current, .. }) => {
                check_type(node, current, &value)?;
                *current = value;
                self.set_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(AddressSpaceError::UnknownNode(node.to_string())),
        }
    }
}
