use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{
    Dom, DomError, Fragment, FragmentNode, MutationBatch, MutationKind, MutationRecord, NodeId,
    NodeInfo, Subscription,
};

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum NodeKind {
    Element {
        tag: String,
        id: Option<String>,
        classes: Vec<String>,
        attrs: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Node storage. Removed subtrees are dropped from `nodes`, so stale ids stop resolving.
#[derive(Debug)]
struct Arena {
    nodes: HashMap<NodeId, NodeData>,
    root: NodeId,
    next_id: u64,
}

impl Arena {
    fn new() -> Self {
        let mut arena = Self { nodes: HashMap::new(), root: NodeId(0), next_id: 0 };
        arena.root = arena.alloc(NodeKind::Element {
            tag: "body".to_string(),
            id: None,
            classes: Vec::new(),
            attrs: BTreeMap::new(),
        });
        arena
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(id, NodeData { kind, parent: None, children: Vec::new() });
        id
    }

    fn build(&mut self, fragment: &FragmentNode) -> NodeId {
        match fragment {
            FragmentNode::Text { text } => self.alloc(NodeKind::Text(text.clone())),
            FragmentNode::Element { tag, id, classes, attrs, children } => {
                let node = self.alloc(NodeKind::Element {
                    tag: tag.clone(),
                    id: id.clone(),
                    classes: classes.clone(),
                    attrs: attrs.clone(),
                });
                for child in children {
                    let child_id = self.build(child);
                    self.link(node, child_id, None);
                }
                node
            }
        }
    }

    fn get(&self, id: NodeId) -> Result<&NodeData, DomError> {
        self.nodes.get(&id).ok_or(DomError::NodeGone(id))
    }

    fn element(&self, id: NodeId) -> Result<&NodeData, DomError> {
        let data = self.get(id)?;
        match data.kind {
            NodeKind::Element { .. } => Ok(data),
            NodeKind::Text(_) => Err(DomError::NotAnElement(id)),
        }
    }

    fn info(&self, id: NodeId) -> Option<NodeInfo> {
        let data = self.nodes.get(&id)?;
        Some(match &data.kind {
            NodeKind::Element { tag, classes, .. } => {
                NodeInfo { id, tag: Some(tag.clone()), classes: classes.clone() }
            }
            NodeKind::Text(_) => NodeInfo { id, tag: None, classes: Vec::new() },
        })
    }

    fn parent_info(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&id)?.parent.and_then(|p| self.info(p))
    }

    fn is_connected(&self, id: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(node) = cur {
            if node == self.root {
                return true;
            }
            cur = self.nodes.get(&node).and_then(|d| d.parent);
        }
        false
    }

    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.nodes.get(&n).and_then(|d| d.parent);
        }
        false
    }

    fn link(&mut self, parent: NodeId, child: NodeId, index: Option<usize>) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            match index {
                Some(i) if i <= p.children.len() => p.children.insert(i, child),
                _ => p.children.push(child),
            }
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
    }

    /// Unlinks `id` from its parent; returns the old parent.
    fn unlink(&mut self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get_mut(&id)?.parent.take()?;
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != id);
        }
        Some(parent)
    }

    fn drop_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(data) = self.nodes.remove(&n) {
                stack.extend(data.children);
            }
        }
    }

    /// Pre-order walk, inclusive of `from`.
    fn walk(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            let Some(data) = self.nodes.get(&n) else { continue };
            out.push(n);
            stack.extend(data.children.iter().rev());
        }
        out
    }

    fn classes(&self, id: NodeId) -> &[String] {
        match self.nodes.get(&id).map(|d| &d.kind) {
            Some(NodeKind::Element { classes, .. }) => classes,
            _ => &[],
        }
    }

    fn direct_text(&self, id: NodeId) -> String {
        let Some(data) = self.nodes.get(&id) else { return String::new() };
        data.children
            .iter()
            .filter_map(|c| match self.nodes.get(c).map(|d| &d.kind) {
                Some(NodeKind::Text(t)) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn text_content(&self, id: NodeId) -> String {
        self.walk(id)
            .into_iter()
            .filter_map(|n| match self.nodes.get(&n).map(|d| &d.kind) {
                Some(NodeKind::Text(t)) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    fn to_fragment(&self, id: NodeId) -> Option<FragmentNode> {
        let data = self.nodes.get(&id)?;
        Some(match &data.kind {
            NodeKind::Text(t) => FragmentNode::Text { text: t.clone() },
            NodeKind::Element { tag, id: el_id, classes, attrs } => FragmentNode::Element {
                tag: tag.clone(),
                id: el_id.clone(),
                classes: classes.clone(),
                attrs: attrs.clone(),
                children: data.children.iter().filter_map(|c| self.to_fragment(*c)).collect(),
            },
        })
    }

    fn write_markup(&self, id: NodeId, out: &mut String) {
        let Some(data) = self.nodes.get(&id) else { return };
        match &data.kind {
            NodeKind::Text(t) => out.push_str(&escape_text(t)),
            NodeKind::Element { tag, id: el_id, classes, attrs } => {
                out.push('<');
                out.push_str(tag);
                if let Some(v) = el_id {
                    out.push_str(&format!(" id=\"{}\"", escape_attr(v)));
                }
                if !classes.is_empty() {
                    out.push_str(&format!(" class=\"{}\"", escape_attr(&classes.join(" "))));
                }
                for (k, v) in attrs {
                    out.push_str(&format!(" {k}=\"{}\"", escape_attr(v)));
                }
                out.push('>');
                for child in &data.children {
                    self.write_markup(*child, out);
                }
                out.push_str(&format!("</{tag}>"));
            }
        }
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// MemoryDom
// ---------------------------------------------------------------------------

/// In-process document. Every mutating call delivers exactly one batch to
/// each live subscription, provided the mutation touched the connected tree.
pub struct MemoryDom {
    arena: Mutex<Arena>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MutationBatch>>>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self { arena: Mutex::new(Arena::new()), subscribers: Mutex::new(Vec::new()) }
    }

    /// Builds `fragment` and appends it under `parent`.
    pub fn mount(&self, parent: NodeId, fragment: &FragmentNode) -> Result<NodeId, DomError> {
        let node = self.create(fragment);
        self.append_child(parent, node)?;
        Ok(node)
    }

    /// Live subscriptions; closed ones are pruned first.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subs();
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subs(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<MutationBatch>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, records: Vec<MutationRecord>) {
        if records.is_empty() {
            return;
        }
        let batch = MutationBatch { records };
        self.subs().retain(|tx| tx.send(batch.clone()).is_ok());
    }

    fn child_list(
        arena: &Arena,
        target: NodeId,
        added: Vec<NodeInfo>,
        removed: Vec<NodeInfo>,
    ) -> Option<MutationRecord> {
        Some(MutationRecord {
            kind: MutationKind::ChildList,
            target: arena.info(target)?,
            parent: arena.parent_info(target),
            added,
            removed,
            attribute: None,
        })
    }
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new()
    }
}

impl Dom for MemoryDom {
    fn element_by_id(&self, id: &str) -> Option<NodeId> {
        let arena = self.lock();
        arena.walk(arena.root).into_iter().find(|n| {
            matches!(
                arena.nodes.get(n).map(|d| &d.kind),
                Some(NodeKind::Element { id: Some(v), .. }) if v == id
            )
        })
    }

    fn elements_by_class(&self, root: Option<NodeId>, class: &str) -> Vec<NodeId> {
        let arena = self.lock();
        let from = root.unwrap_or(arena.root);
        arena
            .walk(from)
            .into_iter()
            .filter(|n| arena.classes(*n).iter().any(|c| c == class))
            .collect()
    }

    fn elements_by_class_prefix(&self, root: Option<NodeId>, prefix: &str) -> Vec<NodeId> {
        let arena = self.lock();
        let from = root.unwrap_or(arena.root);
        arena
            .walk(from)
            .into_iter()
            .filter(|n| arena.classes(*n).iter().any(|c| c.starts_with(prefix)))
            .collect()
    }

    fn contains(&self, node: NodeId) -> bool {
        self.lock().is_connected(node)
    }

    fn info(&self, node: NodeId) -> Option<NodeInfo> {
        self.lock().info(node)
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.lock().nodes.get(&node)?.parent
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.lock().nodes.get(&node).map(|d| d.children.clone()).unwrap_or_default()
    }

    fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let arena = self.lock();
        let parent = arena.nodes.get(&node)?.parent?;
        let siblings = &arena.nodes.get(&parent)?.children;
        let idx = siblings.iter().position(|c| *c == node)?;
        siblings.get(idx + 1).copied()
    }

    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.lock().is_inclusive_ancestor(ancestor, node)
    }

    fn text_content(&self, node: NodeId) -> String {
        self.lock().text_content(node)
    }

    fn text_lines(&self, node: NodeId, skip_class: Option<&str>) -> Vec<(NodeId, String)> {
        let arena = self.lock();
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            let Some(data) = arena.nodes.get(&n) else { continue };
            let NodeKind::Element { classes, .. } = &data.kind else { continue };
            if skip_class.is_some_and(|skip| classes.iter().any(|c| c == skip)) {
                continue;
            }
            let text = arena.direct_text(n);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push((n, trimmed.to_string()));
            }
            stack.extend(data.children.iter().rev());
        }
        out
    }

    fn attr(&self, node: NodeId, name: &str) -> Option<String> {
        let arena = self.lock();
        match &arena.nodes.get(&node)?.kind {
            NodeKind::Element { id, classes, attrs, .. } => match name {
                "id" => id.clone(),
                "class" => Some(classes.join(" ")),
                _ => attrs.get(name).cloned(),
            },
            NodeKind::Text(_) => None,
        }
    }

    fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.lock().classes(node).iter().any(|c| c == class)
    }

    fn snapshot_children(&self, node: NodeId) -> Result<Fragment, DomError> {
        let arena = self.lock();
        let data = arena.get(node)?;
        Ok(data.children.iter().filter_map(|c| arena.to_fragment(*c)).collect())
    }

    fn markup(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.lock().write_markup(node, &mut out);
        out
    }

    fn root(&self) -> NodeId {
        self.lock().root
    }

    fn create(&self, fragment: &FragmentNode) -> NodeId {
        self.lock().build(fragment)
    }

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let records = {
            let mut arena = self.lock();
            arena.element(parent)?;
            arena.get(child)?;
            if arena.is_inclusive_ancestor(child, parent) {
                return Err(DomError::Cycle(child));
            }
            let mut records = Vec::new();
            let child_info = arena.info(child);
            if let Some(old) = arena.unlink(child) {
                if arena.is_connected(old) {
                    records.extend(Self::child_list(&arena, old, vec![], child_info.clone().into_iter().collect()));
                }
            }
            arena.link(parent, child, None);
            if arena.is_connected(parent) {
                records.extend(Self::child_list(&arena, parent, child_info.into_iter().collect(), vec![]));
            }
            records
        };
        self.deliver(records);
        Ok(())
    }

    fn insert_after(&self, reference: NodeId, node: NodeId) -> Result<(), DomError> {
        let records = {
            let mut arena = self.lock();
            arena.get(node)?;
            let parent = arena.get(reference)?.parent.ok_or(DomError::NodeGone(reference))?;
            if arena.is_inclusive_ancestor(node, parent) {
                return Err(DomError::Cycle(node));
            }
            let mut records = Vec::new();
            let info = arena.info(node);
            if let Some(old) = arena.unlink(node) {
                if arena.is_connected(old) {
                    records.extend(Self::child_list(&arena, old, vec![], info.clone().into_iter().collect()));
                }
            }
            let idx = arena
                .get(parent)?
                .children
                .iter()
                .position(|c| *c == reference)
                .map(|i| i + 1);
            arena.link(parent, node, idx);
            if arena.is_connected(parent) {
                records.extend(Self::child_list(&arena, parent, info.into_iter().collect(), vec![]));
            }
            records
        };
        self.deliver(records);
        Ok(())
    }

    fn remove(&self, node: NodeId) -> Result<(), DomError> {
        let records = {
            let mut arena = self.lock();
            let info = arena.info(node).ok_or(DomError::NodeGone(node))?;
            let connected = arena.is_connected(node);
            let parent = arena.unlink(node);
            arena.drop_subtree(node);
            match parent {
                Some(p) if connected => {
                    Self::child_list(&arena, p, vec![], vec![info]).into_iter().collect()
                }
                _ => Vec::new(),
            }
        };
        self.deliver(records);
        Ok(())
    }

    fn replace_with(&self, old: NodeId, fragment: &FragmentNode) -> Result<NodeId, DomError> {
        let (new, records) = {
            let mut arena = self.lock();
            let old_info = arena.info(old).ok_or(DomError::NodeGone(old))?;
            let parent = arena.get(old)?.parent.ok_or(DomError::NodeGone(old))?;
            let idx = arena.get(parent)?.children.iter().position(|c| *c == old);
            let connected = arena.is_connected(parent);
            arena.unlink(old);
            arena.drop_subtree(old);
            let new = arena.build(fragment);
            arena.link(parent, new, idx);
            let records: Vec<_> = if connected {
                Self::child_list(&arena, parent, arena.info(new).into_iter().collect(), vec![old_info])
                    .into_iter()
                    .collect()
            } else {
                Vec::new()
            };
            (new, records)
        };
        self.deliver(records);
        Ok(new)
    }

    fn replace_children(&self, node: NodeId, fragment: &Fragment) -> Result<(), DomError> {
        let records = {
            let mut arena = self.lock();
            let old_children = arena.element(node)?.children.clone();
            let removed: Vec<_> = old_children.iter().filter_map(|c| arena.info(*c)).collect();
            for child in old_children {
                arena.unlink(child);
                arena.drop_subtree(child);
            }
            let mut added = Vec::new();
            for part in fragment {
                let child = arena.build(part);
                arena.link(node, child, None);
                added.extend(arena.info(child));
            }
            if arena.is_connected(node) && !(added.is_empty() && removed.is_empty()) {
                Self::child_list(&arena, node, added, removed).into_iter().collect()
            } else {
                Vec::new()
            }
        };
        self.deliver(records);
        Ok(())
    }

    fn set_text(&self, node: NodeId, text: &str) -> Result<(), DomError> {
        let fragment = if text.is_empty() { Vec::new() } else { vec![FragmentNode::text(text)] };
        self.replace_children(node, &fragment)
    }

    fn set_data(&self, text_node: NodeId, data: &str) -> Result<(), DomError> {
        let records = {
            let mut arena = self.lock();
            let entry = arena.nodes.get_mut(&text_node).ok_or(DomError::NodeGone(text_node))?;
            match &mut entry.kind {
                NodeKind::Text(t) => *t = data.to_string(),
                NodeKind::Element { .. } => return Err(DomError::NotAnElement(text_node)),
            }
            if arena.is_connected(text_node) {
                arena
                    .info(text_node)
                    .map(|target| MutationRecord {
                        kind: MutationKind::CharacterData,
                        target,
                        parent: arena.parent_info(text_node),
                        added: Vec::new(),
                        removed: Vec::new(),
                        attribute: None,
                    })
                    .into_iter()
                    .collect()
            } else {
                Vec::new()
            }
        };
        self.deliver(records);
        Ok(())
    }

    fn set_attr(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let records = {
            let mut arena = self.lock();
            let entry = arena.nodes.get_mut(&node).ok_or(DomError::NodeGone(node))?;
            let NodeKind::Element { id, classes, attrs, .. } = &mut entry.kind else {
                return Err(DomError::NotAnElement(node));
            };
            match name {
                "id" => *id = Some(value.to_string()),
                "class" => *classes = value.split_whitespace().map(str::to_string).collect(),
                _ => {
                    attrs.insert(name.to_string(), value.to_string());
                }
            }
            if arena.is_connected(node) {
                arena
                    .info(node)
                    .map(|target| MutationRecord {
                        kind: MutationKind::Attributes,
                        target,
                        parent: arena.parent_info(node),
                        added: Vec::new(),
                        removed: Vec::new(),
                        attribute: Some(name.to_string()),
                    })
                    .into_iter()
                    .collect()
            } else {
                Vec::new()
            }
        };
        self.deliver(records);
        Ok(())
    }

    fn observe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs().push(tx);
        Subscription::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
