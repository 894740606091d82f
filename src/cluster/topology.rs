//! Slot ownership.
//!
//! The writer only asks two things of a topology: which node owns a key, and
//! "slot S moved to node N". Discovery and periodic refresh belong to
//! whoever fills the table.
//!
//! [`SlotTable`] keeps owners as sorted, non-overlapping slot ranges inside
//! an `Arc`. Updates build a new map and swap the `Arc`, so a reader sees
//! either the old mapping or the new one, never a mix.

use crate::cluster::slot::{hash_slot, SLOT_COUNT};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// A node's `host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for NodeId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Key → node resolution used by the cluster writer.
pub trait Topology: Send + Sync {
    /// Current owner of `slot`.
    fn slot_owner(&self, slot: u16) -> Option<NodeId>;

    /// Node for commands that carry no key.
    fn default_node(&self) -> Option<NodeId>;

    /// Records that `slot` is now served by `node`.
    fn update_slot_owner(&self, slot: u16, node: NodeId);

    fn resolve_node(&self, key: &[u8]) -> Option<NodeId> {
        self.slot_owner(hash_slot(key))
    }
}

/// An immutable slot → node mapping.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    /// start → (end inclusive, owner)
    ranges: BTreeMap<u16, (u16, NodeId)>,
}

impl SlotMap {
    pub fn owner(&self, slot: u16) -> Option<&NodeId> {
        self.ranges
            .range(..=slot)
            .next_back()
            .filter(|(_, (end, _))| slot <= *end)
            .map(|(_, (_, node))| node)
    }

    /// Distinct owners, sorted.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.ranges
            .values()
            .map(|(_, node)| node.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of slots that have an owner.
    pub fn covered_slots(&self) -> usize {
        self.ranges
            .iter()
            .map(|(start, (end, _))| (*end - *start) as usize + 1)
            .sum()
    }

    fn assign(&mut self, start: u16, end: u16, node: NodeId) {
        let overlapping: Vec<u16> = self
            .ranges
            .range(..=end)
            .filter(|(_, (range_end, _))| *range_end >= start)
            .map(|(range_start, _)| *range_start)
            .collect();

        for range_start in overlapping {
            if let Some((range_end, owner)) = self.ranges.remove(&range_start) {
                if range_start < start {
                    self.ranges.insert(range_start, (start - 1, owner.clone()));
                }
                if range_end > end {
                    self.ranges.insert(end + 1, (range_end, owner));
                }
            }
        }
        self.ranges.insert(start, (end, node));
    }
}

/// In-memory [`Topology`] with whole-map replacement on every update.
#[derive(Debug, Default)]
pub struct SlotTable {
    map: RwLock<Arc<SlotMap>>,
    default_node: RwLock<Option<NodeId>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with every slot owned by `node`.
    pub fn single(node: impl Into<NodeId>) -> Self {
        let table = Self::new();
        table.assign_range(0, SLOT_COUNT - 1, node.into());
        table
    }

    /// Assigns slots `start..=end` to `node`. Out-of-range bounds are clamped.
    pub fn assign_range(&self, start: u16, end: u16, node: NodeId) {
        let end = end.min(SLOT_COUNT - 1);
        if start > end {
            return;
        }
        self.replace(|map| map.assign(start, end, node));
    }

    pub fn set_default_node(&self, node: NodeId) {
        *self
            .default_node
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(node);
    }

    /// The current mapping.
    pub fn snapshot(&self) -> Arc<SlotMap> {
        Arc::clone(&self.map.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, update: impl FnOnce(&mut SlotMap)) {
        let mut guard = self.map.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = SlotMap::clone(&guard);
        update(&mut next);
        *guard = Arc::new(next);
    }
}

impl Topology for SlotTable {
    fn slot_owner(&self, slot: u16) -> Option<NodeId> {
        self.snapshot().owner(slot).cloned()
    }

    fn default_node(&self) -> Option<NodeId> {
        let configured = self
            .default_node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        configured.or_else(|| self.snapshot().nodes().into_iter().next())
    }

    fn update_slot_owner(&self, slot: u16, node: NodeId) {
        if slot >= SLOT_COUNT {
            return;
        }
        debug!(slot, node = %node, "Slot owner updated");
        self.replace(|map| map.assign(slot, slot, node));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str) -> NodeId {
        NodeId::from(address)
    }

    #[test]
    fn test_resolve_by_key() {
        let table = SlotTable::new();
        table.assign_range(0, 8191, node("a:1"));
        table.assign_range(8192, 16383, node("b:1"));

        // "bar" hashes to 5061, "foo" to 12182.
        assert_eq!(table.resolve_node(b"bar"), Some(node("a:1")));
        assert_eq!(table.resolve_node(b"foo"), Some(node("b:1")));
        assert_eq!(table.snapshot().covered_slots(), 16384);
    }

    #[test]
    fn test_update_splits_range() {
        let table = SlotTable::single("a:1");
        table.update_slot_owner(100, node("b:1"));

        assert_eq!(table.slot_owner(99), Some(node("a:1")));
        assert_eq!(table.slot_owner(100), Some(node("b:1")));
        assert_eq!(table.slot_owner(101), Some(node("a:1")));
        assert_eq!(table.snapshot().covered_slots(), 16384);
        assert_eq!(table.snapshot().nodes(), vec![node("a:1"), node("b:1")]);
    }

    #[test]
    fn test_update_replaces_whole_map() {
        let table = SlotTable::single("a:1");
        let before = table.snapshot();
        table.update_slot_owner(0, node("b:1"));

        // Earlier readers keep the mapping they loaded.
        assert_eq!(before.owner(0), Some(&node("a:1")));
        assert_eq!(table.slot_owner(0), Some(node("b:1")));
    }

    #[test]
    fn test_unassigned_slots() {
        let table = SlotTable::new();
        table.assign_range(10, 20, node("a:1"));
        assert_eq!(table.slot_owner(9), None);
        assert_eq!(table.slot_owner(21), None);
        assert_eq!(table.slot_owner(15), Some(node("a:1")));
    }

    #[test]
    fn test_default_node() {
        let table = SlotTable::new();
        assert_eq!(table.default_node(), None);

        table.assign_range(0, 10, node("b:1"));
        assert_eq!(table.default_node(), Some(node("b:1")));

        table.set_default_node(node("z:1"));
        assert_eq!(table.default_node(), Some(node("z:1")));
    }
}
