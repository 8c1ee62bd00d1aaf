use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{FieldName, NodeId};
use crate::schema::LinkKind;
use crate::value::Fields;

/// The children referenced by one link field of a parent node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeLink {
    Single(Option<NodeId>),
    Array(Vec<NodeId>),
    /// Membership keyed by the canonical id of the member.
    Set(BTreeMap<String, NodeId>),
}

impl NodeLink {
    pub fn empty(kind: LinkKind) -> Self {
        match kind {
            LinkKind::Single => Self::Single(None),
            LinkKind::Array => Self::Array(Vec::new()),
            LinkKind::Set => Self::Set(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Single(_) => LinkKind::Single,
            Self::Array(_) => LinkKind::Array,
            Self::Set(_) => LinkKind::Set,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        match self {
            Self::Single(child) => child.as_ref() == Some(id),
            Self::Array(children) => children.contains(id),
            Self::Set(children) => children.contains_key(&id.canonical()),
        }
    }

    /// Iterates the referenced ids.
    pub fn ids(&self) -> Box<dyn Iterator<Item = &NodeId> + '_> {
        match self {
            Self::Single(child) => Box::new(child.iter()),
            Self::Array(children) => Box::new(children.iter()),
            Self::Set(children) => Box::new(children.values()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(child) => usize::from(child.is_some()),
            Self::Array(children) => children.len(),
            Self::Set(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_single(&self) -> Option<&Option<NodeId>> {
        if let Self::Single(child) = self {
            Some(child)
        } else {
            None
        }
    }

    pub fn as_array(&self) -> Option<&[NodeId]> {
        if let Self::Array(children) = self {
            Some(children)
        } else {
            None
        }
    }

    pub fn as_set(&self) -> Option<&BTreeMap<String, NodeId>> {
        if let Self::Set(children) = self {
            Some(children)
        } else {
            None
        }
    }
}

/// Where a non-root node hangs off its parent. `index` is set iff the
/// parent field is an `Array` link and always agrees with the forward
/// link.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub parent: NodeId,
    pub field: FieldName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl ParentRef {
    pub fn single(parent: NodeId, field: impl Into<FieldName>) -> Self {
        Self {
            parent,
            field: field.into(),
            index: None,
        }
    }

    pub fn array(parent: NodeId, field: impl Into<FieldName>, index: usize) -> Self {
        Self {
            parent,
            field: field.into(),
            index: Some(index),
        }
    }
}

/// A typed node of a normalized document. Children are referenced by id
/// through the link fields; the single `parent` back-pointer makes the
/// child links a spanning tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub data: Fields,
    pub children: BTreeMap<FieldName, NodeLink>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<FieldName, NodeLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

impl Node {
    pub fn node_type(&self) -> &str {
        self.id.node_type()
    }

    pub fn child_link(&self, field: &str) -> Option<&NodeLink> {
        self.children.get(field)
    }

    pub(crate) fn child_link_mut(&mut self, field: &str) -> Option<&mut NodeLink> {
        self.children.get_mut(field)
    }

    /// Iterates the ids of all children across link fields.
    pub fn child_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.children.values().flat_map(|link| link.ids())
    }
}
