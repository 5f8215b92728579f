//! Tag registry and the contiguous register window it polls.

use std::collections::HashMap;
use thiserror::Error;

use crate::tag::Tag;

/// Largest number of holding registers a single Modbus read may request.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Error type for registry insertion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Duplicate tag name '{0}'")]
    DuplicateName(String),
    #[error("Tags '{existing}' and '{new}' claim overlapping bits of register {address}")]
    AddressCollision {
        address: u16,
        existing: String,
        new: String,
    },
}

/// Inclusive range of register addresses read every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollWindow {
    pub min: u16,
    pub max: u16,
}

impl PollWindow {
    /// A window spanning a single register.
    pub fn single(address: u16) -> Self {
        Self {
            min: address,
            max: address,
        }
    }

    /// Grow the window so it covers `address`.
    pub fn widen(&mut self, address: u16) {
        self.min = self.min.min(address);
        self.max = self.max.max(address);
    }

    /// Number of registers in the window.
    pub fn width(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    /// Split the window into `(start, count)` requests of at most `max_count` registers.
    pub fn chunks(&self, max_count: u16) -> Vec<(u16, u16)> {
        let max_count = u32::from(max_count.max(1));
        let end = u32::from(self.max);
        let mut start = u32::from(self.min);
        let mut chunks = Vec::new();

        while start <= end {
            let count = (end - start + 1).min(max_count);
            chunks.push((start as u16, count as u16));
            start += count;
        }

        chunks
    }
}

/// Registry of all tags, owned by the synchronization engine.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: Vec<Tag>,
    window: Option<PollWindow>,
    /// Claimed bit masks per register address, with the claiming tag indices.
    claims: HashMap<u16, Vec<(u16, usize)>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag, widening the poll window to cover it.
    pub fn insert(&mut self, tag: Tag) -> Result<(), RegistryError> {
        if self.get(&tag.name).is_some() {
            return Err(RegistryError::DuplicateName(tag.name));
        }

        let mask = tag.kind.claim_mask();
        if let Some(claims) = self.claims.get(&tag.modbus_address) {
            if let Some((_, index)) = claims.iter().find(|(claimed, _)| claimed & mask != 0) {
                return Err(RegistryError::AddressCollision {
                    address: tag.modbus_address,
                    existing: self.tags[*index].name.clone(),
                    new: tag.name,
                });
            }
        }

        match self.window.as_mut() {
            Some(window) => window.widen(tag.modbus_address),
            None => self.window = Some(PollWindow::single(tag.modbus_address)),
        }

        self.claims
            .entry(tag.modbus_address)
            .or_default()
            .push((mask, self.tags.len()));
        self.tags.push(tag);
        Ok(())
    }

    /// Poll window over all registered tags; `None` while empty.
    pub fn window(&self) -> Option<PollWindow> {
        self.window
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name == name)
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Mutable access for the engine; only `last_observed` is meant to change.
    pub fn tags_mut(&mut self) -> &mut [Tag] {
        &mut self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{ByteSelector, TagKind};
    use opcua::types::NodeId;

    fn tag(name: &str, kind: TagKind, address: u16) -> Tag {
        Tag::new(name, kind, address, NodeId::new(1, name.to_string()))
    }

    #[test]
    fn test_window_is_independent_of_order() {
        let orders: [[u16; 4]; 3] = [[5, 3, 9, 3], [3, 3, 5, 9], [9, 5, 3, 3]];

        for order in orders {
            let mut registry = TagRegistry::new();
            for (i, address) in order.iter().enumerate() {
                registry
                    .insert(tag(&format!("b{i}"), TagKind::Boolean { bit: i as u8 }, *address))
                    .unwrap();
            }

            let window = registry.window().unwrap();
            assert_eq!(window, PollWindow { min: 3, max: 9 });
            assert_eq!(window.width(), 7);
        }
    }

    #[test]
    fn test_empty_registry_has_no_window() {
        let registry = TagRegistry::new();
        assert!(registry.window().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_window_chunks() {
        assert_eq!(PollWindow { min: 3, max: 9 }.chunks(125), vec![(3, 7)]);
        assert_eq!(
            PollWindow { min: 0, max: 299 }.chunks(125),
            vec![(0, 125), (125, 125), (250, 50)]
        );
        assert_eq!(
            PollWindow {
                min: 65530,
                max: u16::MAX
            }
            .chunks(4),
            vec![(65530, 4), (65534, 2)]
        );
    }

    #[test]
    fn test_packed_tags_share_a_register() {
        let mut registry = TagRegistry::new();
        registry.insert(tag("b0", TagKind::Boolean { bit: 0 }, 4)).unwrap();
        registry.insert(tag("b1", TagKind::Boolean { bit: 1 }, 4)).unwrap();
        registry
            .insert(tag("hi", TagKind::Byte(ByteSelector::High), 4))
            .unwrap();
        registry
            .insert(tag("lo", TagKind::Byte(ByteSelector::Low), 5))
            .unwrap();
        registry
            .insert(tag("hi5", TagKind::Byte(ByteSelector::High), 5))
            .unwrap();

        assert_eq!(registry.len(), 5);
        assert_eq!(registry.window(), Some(PollWindow { min: 4, max: 5 }));
    }

    #[test]
    fn test_same_bit_collides() {
        let mut registry = TagRegistry::new();
        registry.insert(tag("a", TagKind::Boolean { bit: 3 }, 1)).unwrap();

        let err = registry
            .insert(tag("b", TagKind::Boolean { bit: 3 }, 1))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AddressCollision {
                address: 1,
                existing: "a".to_string(),
                new: "b".to_string(),
            }
        );
    }

    #[test]
    fn test_byte_overlapping_bit_collides() {
        let mut registry = TagRegistry::new();
        registry.insert(tag("flag", TagKind::Boolean { bit: 2 }, 7)).unwrap();

        assert!(matches!(
            registry.insert(tag("low", TagKind::Byte(ByteSelector::Low), 7)),
            Err(RegistryError::AddressCollision { .. })
        ));
        assert!(matches!(
            registry.insert(tag("word", TagKind::Int16, 7)),
            Err(RegistryError::AddressCollision { .. })
        ));
        // The failed inserts left no trace
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.window(), Some(PollWindow::single(7)));
    }

    #[test]
    fn test_duplicate_name() {
        let mut registry = TagRegistry::new();
        registry.insert(tag("speed", TagKind::Int16, 1)).unwrap();

        assert_eq!(
            registry.insert(tag("speed", TagKind::Int16, 2)),
            Err(RegistryError::DuplicateName("speed".to_string()))
        );
    }
}
