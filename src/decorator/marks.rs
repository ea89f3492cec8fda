use std::collections::HashSet;

use dashmap::DashMap;

use crate::dom::{Fragment, NodeId};
use crate::types::DecorationKind;

#[derive(Debug, Clone, Default)]
pub struct ItemMark {
    pub item_id: String,
    pub decorated: HashSet<DecorationKind>,
}

/// Identity-keyed side table of decoration state.
///
/// Entries are keyed by node, never by item id, so a card the host rebuilt
/// shows up as a fresh node. Nothing here is authoritative: the markers in the
/// document decide whether a card is decorated, this table only remembers
/// what it looked like before.
#[derive(Default)]
pub struct DecorationMarks {
    items: DashMap<NodeId, ItemMark>,
    /// Children of the anchor element captured right before a decoration was appended.
    originals: DashMap<(NodeId, DecorationKind), Fragment>,
}

impl DecorationMarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, item: NodeId, item_id: &str, kind: DecorationKind) {
        let mut entry = self.items.entry(item).or_default();
        if entry.item_id != item_id {
            entry.item_id = item_id.to_string();
        }
        entry.decorated.insert(kind);
    }

    pub fn was_decorated(&self, item: NodeId, kind: DecorationKind) -> bool {
        self.items.get(&item).is_some_and(|m| m.decorated.contains(&kind))
    }

    pub fn remember_original(&self, anchor: NodeId, kind: DecorationKind, children: Fragment) {
        self.originals.insert((anchor, kind), children);
    }

    pub fn take_original(&self, anchor: NodeId, kind: DecorationKind) -> Option<Fragment> {
        self.originals.remove(&(anchor, kind)).map(|(_, f)| f)
    }

    /// Forgets `kind` everywhere; items left with nothing are dropped.
    pub fn clear_kind(&self, kind: DecorationKind) {
        self.items.retain(|_, m| {
            m.decorated.remove(&kind);
            !m.decorated.is_empty()
        });
        self.originals.retain(|(_, k), _| *k != kind);
    }

    /// Drops entries whose node left the document. Returns how many items went.
    pub fn prune(&self, connected: impl Fn(NodeId) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|node, _| connected(*node));
        self.originals.retain(|(anchor, _), _| connected(*anchor));
        before - self.items.len()
    }

    /// Decorated item count.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
