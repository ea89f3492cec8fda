//! Seam between the engine and the host page.
//!
//! The engine never owns host nodes. It sees them through [`Dom`], holds only
//! [`NodeId`]s (which stop resolving once the host discards a subtree), and
//! learns about changes through [`Subscription`]s.

pub mod fixture;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryDom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    #[error("node {0} no longer exists")]
    NodeGone(NodeId),

    #[error("node {0} is not an element")]
    NotAnElement(NodeId),

    #[error("cannot insert {0} into its own subtree")]
    Cycle(NodeId),
}

// ---------------------------------------------------------------------------
// Fragments: owned, detached copies of markup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FragmentNode {
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        classes: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attrs: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<FragmentNode>,
    },
    Text {
        text: String,
    },
}

pub type Fragment = Vec<FragmentNode>;

impl FragmentNode {
    pub fn element(tag: &str) -> Self {
        FragmentNode::Element {
            tag: tag.to_string(),
            id: None,
            classes: Vec::new(),
            attrs: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        FragmentNode::Text { text: text.into() }
    }

    pub fn with_id(mut self, value: &str) -> Self {
        if let FragmentNode::Element { id, .. } = &mut self {
            *id = Some(value.to_string());
        }
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        if let FragmentNode::Element { classes, .. } = &mut self {
            classes.push(class.to_string());
        }
        self
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        if let FragmentNode::Element { attrs, .. } = &mut self {
            attrs.insert(name.to_string(), value.into());
        }
        self
    }

    pub fn with_child(mut self, child: FragmentNode) -> Self {
        if let FragmentNode::Element { children, .. } = &mut self {
            children.push(child);
        }
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_child(FragmentNode::text(text))
    }

    pub fn has_class(&self, class: &str) -> bool {
        matches!(self, FragmentNode::Element { classes, .. } if classes.iter().any(|c| c == class))
    }
}

// ---------------------------------------------------------------------------
// Mutation notifications
// ---------------------------------------------------------------------------

/// Snapshot of a node taken when the mutation happened, so removed nodes stay
/// inspectable after the host has discarded them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// `None` for text nodes.
    pub tag: Option<String>,
    pub classes: Vec<String>,
}

impl NodeInfo {
    pub fn is_text(&self) -> bool {
        self.tag.is_none()
    }

    pub fn has_class_prefix(&self, prefix: &str) -> bool {
        self.classes.iter().any(|c| c.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    CharacterData,
    Attributes,
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeInfo,
    /// Parent of `target` at mutation time.
    pub parent: Option<NodeInfo>,
    pub added: Vec<NodeInfo>,
    pub removed: Vec<NodeInfo>,
    /// Attribute name for `MutationKind::Attributes`.
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MutationBatch {
    pub records: Vec<MutationRecord>,
}

/// Live document-wide subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<MutationBatch>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<MutationBatch>) -> Self {
        Self { rx }
    }

    /// Next batch; `None` once the document is gone.
    pub async fn recv(&mut self) -> Option<MutationBatch> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MutationBatch> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Dom
// ---------------------------------------------------------------------------

pub trait Dom: Send + Sync {
    fn element_by_id(&self, id: &str) -> Option<NodeId>;

    /// Elements carrying `class`, in document order. `root` is included when it matches.
    fn elements_by_class(&self, root: Option<NodeId>, class: &str) -> Vec<NodeId>;

    /// Elements with any class starting with `prefix`, in document order.
    fn elements_by_class_prefix(&self, root: Option<NodeId>, prefix: &str) -> Vec<NodeId>;

    /// True while the node is connected to the document.
    fn contains(&self, node: NodeId) -> bool;

    fn info(&self, node: NodeId) -> Option<NodeInfo>;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn children(&self, node: NodeId) -> Vec<NodeId>;

    fn next_sibling(&self, node: NodeId) -> Option<NodeId>;

    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool;

    fn text_content(&self, node: NodeId) -> String;

    /// `(element, direct text)` for every element under `node` with non-empty
    /// direct text, in document order. Subtrees carrying `skip_class` are skipped.
    fn text_lines(&self, node: NodeId, skip_class: Option<&str>) -> Vec<(NodeId, String)>;

    fn attr(&self, node: NodeId, name: &str) -> Option<String>;

    fn has_class(&self, node: NodeId, class: &str) -> bool;

    fn snapshot_children(&self, node: NodeId) -> Result<Fragment, DomError>;

    /// Deterministic serialized markup of the node and its subtree.
    fn markup(&self, node: NodeId) -> String;

    /// Document root.
    fn root(&self) -> NodeId;

    /// Builds a detached subtree.
    fn create(&self, fragment: &FragmentNode) -> NodeId;

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError>;

    fn insert_after(&self, reference: NodeId, node: NodeId) -> Result<(), DomError>;

    fn remove(&self, node: NodeId) -> Result<(), DomError>;

    /// Swaps `old` for a freshly built subtree; returns the new node.
    fn replace_with(&self, old: NodeId, fragment: &FragmentNode) -> Result<NodeId, DomError>;

    fn replace_children(&self, node: NodeId, fragment: &Fragment) -> Result<(), DomError>;

    /// `textContent =` semantics: all children replaced by one text node.
    fn set_text(&self, node: NodeId, text: &str) -> Result<(), DomError>;

    /// Rewrites a text node in place.
    fn set_data(&self, text_node: NodeId, data: &str) -> Result<(), DomError>;

    fn set_attr(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError>;

    fn observe(&self) -> Subscription;
}
