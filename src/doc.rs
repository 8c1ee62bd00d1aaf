use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::id::{ElementKey, NodeId};
use crate::mutable::MutableDocument;
use crate::node::{Node, NodeLink, ParentRef};
use crate::path::{Path, PathBuf, PathElement};
use crate::schema::Schema;
use crate::value::Fields;

/// Read access to a document's schema, root and node map. Implemented by
/// both [`NormalizedDocument`] and
/// [`MutableDocument`](crate::MutableDocument) so path resolution and
/// traversal work over either.
pub trait DocRead {
    fn schema(&self) -> &Schema;
    fn root_id(&self) -> &NodeId;
    fn node(&self, id: &NodeId) -> Option<&Node>;
}

/// An immutable tree of typed nodes held in a flat keyed store. Mutations
/// go through [`MutableDocument`], which materializes a new snapshot; an
/// unchanged edit session returns the original, so documents can be
/// compared and shared cheaply.
#[derive(Clone)]
pub struct NormalizedDocument {
    schema: Arc<Schema>,
    root_id: NodeId,
    nodes: BTreeMap<NodeId, Arc<Node>>,
}

impl NormalizedDocument {
    /// Creates a document containing a fresh root of the schema's root
    /// type, with optional initial data overlaid on the type's template.
    pub fn new(schema: Arc<Schema>, root_key: ElementKey, data: Option<Fields>) -> Result<Self> {
        let mut root = schema.empty_node(schema.root_type(), root_key)?;
        if let Some(data) = data {
            schema.validate_data(root.node_type(), &data)?;
            for (field, value) in data {
                root.data.insert(field, value);
            }
        }
        let root_id = root.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(root_id.clone(), Arc::new(root));
        Ok(Self {
            schema,
            root_id,
            nodes,
        })
    }

    pub(crate) fn from_parts(
        schema: Arc<Schema>,
        root_id: NodeId,
        nodes: BTreeMap<NodeId, Arc<Node>>,
    ) -> Self {
        Self {
            schema,
            root_id,
            nodes,
        }
    }

    pub fn schema_arc(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub(crate) fn nodes(&self) -> &BTreeMap<NodeId, Arc<Node>> {
        &self.nodes
    }

    pub fn root(&self) -> &Node {
        // the root is always live
        self.nodes.get(&self.root_id).expect("root node")
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).map(|node| node.as_ref())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates all nodes in canonical id order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|node| node.as_ref())
    }

    /// Starts an edit session over this document.
    pub fn edit(&self) -> MutableDocument {
        MutableDocument::new(self)
    }

    /// Resolves a path from the root to the id of the addressed node. The
    /// empty path resolves to the root.
    pub fn id_at_path(&self, path: Path) -> Result<NodeId> {
        resolve_path(self, path)
    }

    /// Reconstructs the path of a live node by ascending parent
    /// references.
    pub fn path_of(&self, id: &NodeId) -> Result<PathBuf> {
        path_of_node(self, id)
    }

    /// Returns a document in which every node of the subtree rooted at
    /// `subtree_root` carries a freshly generated id. Forward links,
    /// parent back-pointers and inbound links from outside the subtree are
    /// rewritten consistently. The old-to-new id mapping is returned
    /// alongside.
    pub fn re_id_subtree(
        &self,
        subtree_root: &NodeId,
    ) -> Result<(Self, BTreeMap<NodeId, NodeId>)> {
        if !self.contains(subtree_root) {
            return Err(Error::integrity(format!(
                "subtree root {} is not part of the document",
                subtree_root
            )));
        }
        let subtree = collect_subtree(self, subtree_root);
        let mapping: BTreeMap<NodeId, NodeId> = subtree
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    NodeId::new(id.node_type(), ElementKey::generate()),
                )
            })
            .collect();
        let map_id = |id: &NodeId| mapping.get(id).cloned().unwrap_or_else(|| id.clone());

        let mut nodes = BTreeMap::new();
        for (id, node) in &self.nodes {
            let inside = mapping.contains_key(id);
            let touches = inside
                || node.child_ids().any(|child| mapping.contains_key(child))
                || node
                    .links
                    .values()
                    .flat_map(|link| link.ids())
                    .any(|target| mapping.contains_key(target));
            if !touches {
                nodes.insert(id.clone(), Arc::clone(node));
                continue;
            }
            let mut updated = node.as_ref().clone();
            updated.id = map_id(id);
            if let Some(parent) = &mut updated.parent {
                parent.parent = map_id(&parent.parent);
            }
            for link in updated.children.values_mut() {
                rewrite_link(link, &map_id);
            }
            for link in updated.links.values_mut() {
                rewrite_link(link, &map_id);
            }
            nodes.insert(updated.id.clone(), Arc::new(updated));
        }
        let root_id = map_id(&self.root_id);
        Ok((
            Self {
                schema: Arc::clone(&self.schema),
                root_id,
                nodes,
            },
            mapping,
        ))
    }

    /// Extracts the serializable node map, e.g. for a history checkpoint.
    pub fn to_snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            root_id: self.root_id.clone(),
            nodes: self
                .nodes
                .values()
                .map(|node| (node.id.canonical(), node.as_ref().clone()))
                .collect(),
        }
    }

    /// Rebuilds a document from a snapshot, re-attaching the schema.
    pub fn from_snapshot(schema: Arc<Schema>, snapshot: DocSnapshot) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for (key, node) in snapshot.nodes {
            if key != node.id.canonical() {
                return Err(Error::integrity(format!(
                    "snapshot key {:?} does not match node id {}",
                    key, node.id
                )));
            }
            if !schema.has_type(node.node_type()) {
                return Err(Error::constraint(format!(
                    "unknown node type {:?}",
                    node.node_type()
                )));
            }
            nodes.insert(node.id.clone(), Arc::new(node));
        }
        if !nodes.contains_key(&snapshot.root_id) {
            return Err(Error::integrity(format!(
                "snapshot root {} is not among its nodes",
                snapshot.root_id
            )));
        }
        Ok(Self {
            schema,
            root_id: snapshot.root_id,
            nodes,
        })
    }
}

impl DocRead for NormalizedDocument {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    fn node(&self, id: &NodeId) -> Option<&Node> {
        self.get_node(id)
    }
}

impl PartialEq for NormalizedDocument {
    fn eq(&self, other: &Self) -> bool {
        self.root_id == other.root_id
            && self.schema == other.schema
            && self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(other.nodes.iter())
                .all(|((ak, av), (bk, bv))| ak == bk && (Arc::ptr_eq(av, bv) || av == bv))
    }
}

impl std::fmt::Debug for NormalizedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut m = f.debug_map();
        for node in self.nodes.values() {
            m.entry(&node.id.canonical(), node.as_ref());
        }
        m.finish()
    }
}

/// The wire-visible form of a document: the root id plus the node map
/// keyed by canonical id. This is what the default history checkpoint
/// translator serializes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub root_id: NodeId,
    pub nodes: BTreeMap<String, Node>,
}

fn rewrite_link<F: Fn(&NodeId) -> NodeId>(link: &mut NodeLink, map_id: &F) {
    match link {
        NodeLink::Single(child) => {
            if let Some(child) = child {
                *child = map_id(child);
            }
        }
        NodeLink::Array(children) => {
            for child in children {
                *child = map_id(child);
            }
        }
        NodeLink::Set(children) => {
            let remapped: BTreeMap<String, NodeId> = children
                .values()
                .map(|child| {
                    let child = map_id(child);
                    (child.canonical(), child)
                })
                .collect();
            *children = remapped;
        }
    }
}

/// Ids of the subtree rooted at `root`, in depth-first pre-order.
pub(crate) fn collect_subtree<D: DocRead + ?Sized>(doc: &D, root: &NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(id) = stack.pop() {
        let node = match doc.node(&id) {
            Some(node) => node,
            None => continue,
        };
        out.push(id);
        let children: Vec<NodeId> = node.child_ids().cloned().collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }
    out
}

pub(crate) fn resolve_path<D: DocRead + ?Sized>(doc: &D, path: Path) -> Result<NodeId> {
    let mut current = doc.root_id().clone();
    for element in path {
        let node = doc
            .node(&current)
            .ok_or_else(|| Error::reference(format!("node {} is not live", current)))?;
        let kind = doc.schema().child_kind(node.node_type(), element.field())?;
        if kind != element.kind() {
            return Err(Error::shape(format!(
                "path element {:?} addresses a {:?} link",
                element, kind
            )));
        }
        let link = node
            .child_link(element.field())
            .ok_or_else(|| Error::reference(format!("{} has no link {:?}", current, element.field())))?;
        current = match (element, link) {
            (PathElement::Field(field), NodeLink::Single(child)) => child
                .clone()
                .ok_or_else(|| Error::reference(format!("{}.{} is empty", current, field)))?,
            (PathElement::Index { field, index }, NodeLink::Array(children)) => children
                .get(*index)
                .cloned()
                .ok_or_else(|| {
                    Error::range(format!(
                        "{}.{}[{}] is out of range (len {})",
                        current,
                        field,
                        index,
                        children.len()
                    ))
                })?,
            (PathElement::Key { field, id }, NodeLink::Set(children)) => children
                .get(&id.canonical())
                .cloned()
                .ok_or_else(|| {
                    Error::reference(format!("{} is not a member of {}.{}", id, current, field))
                })?,
            // kind was checked against the schema above
            _ => {
                return Err(Error::integrity(format!(
                    "link {}.{} does not match its declared kind",
                    current,
                    element.field()
                )))
            }
        };
    }
    Ok(current)
}

pub(crate) fn path_of_node<D: DocRead + ?Sized>(doc: &D, id: &NodeId) -> Result<PathBuf> {
    let mut elements = Vec::new();
    let mut current = id.clone();
    let mut seen = std::collections::BTreeSet::new();
    while &current != doc.root_id() {
        if !seen.insert(current.clone()) {
            return Err(Error::integrity(format!(
                "parent chain of {} does not terminate",
                id
            )));
        }
        let node = doc
            .node(&current)
            .ok_or_else(|| Error::reference(format!("node {} is not live", current)))?;
        let parent_ref = node.parent.as_ref().ok_or_else(|| {
            Error::integrity(format!("non-root node {} has no parent", current))
        })?;
        let parent = doc.node(&parent_ref.parent).ok_or_else(|| {
            Error::integrity(format!(
                "parent {} of {} is not live",
                parent_ref.parent, current
            ))
        })?;
        let link = parent.child_link(&parent_ref.field).ok_or_else(|| {
            Error::integrity(format!(
                "parent {} has no link {:?}",
                parent_ref.parent, parent_ref.field
            ))
        })?;
        let element = parent_link_element(link, parent_ref, &current)?;
        elements.push(element);
        current = parent_ref.parent.clone();
    }
    elements.reverse();
    Ok(elements.into_iter().collect())
}

fn parent_link_element(
    link: &NodeLink,
    parent_ref: &ParentRef,
    child: &NodeId,
) -> Result<PathElement> {
    match link {
        NodeLink::Single(slot) => {
            if slot.as_ref() != Some(child) {
                return Err(Error::integrity(format!(
                    "{}.{} does not hold {}",
                    parent_ref.parent, parent_ref.field, child
                )));
            }
            Ok(PathElement::Field(parent_ref.field.clone()))
        }
        NodeLink::Array(children) => {
            let index = parent_ref.index.ok_or_else(|| {
                Error::integrity(format!(
                    "{} lacks an index into {}.{}",
                    child, parent_ref.parent, parent_ref.field
                ))
            })?;
            if children.get(index) != Some(child) {
                return Err(Error::integrity(format!(
                    "{}.{}[{}] does not hold {}",
                    parent_ref.parent, parent_ref.field, index, child
                )));
            }
            Ok(PathElement::Index {
                field: parent_ref.field.clone(),
                index,
            })
        }
        NodeLink::Set(children) => {
            if children.get(&child.canonical()) != Some(child) {
                return Err(Error::integrity(format!(
                    "{}.{} does not contain {}",
                    parent_ref.parent, parent_ref.field, child
                )));
            }
            Ok(PathElement::Key {
                field: parent_ref.field.clone(),
                id: child.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{seeded_doc, todo_schema};
    use crate::value::Value;

    #[test]
    fn fresh_document_has_only_the_root() {
        let schema = Arc::new(todo_schema());
        let mut data = Fields::new();
        data.insert("name".to_string(), Value::from("todos"));
        let doc = NormalizedDocument::new(Arc::clone(&schema), 1u64.into(), Some(data)).unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.root().data.get("name"), Some(&Value::from("todos")));
        assert_eq!(doc.id_at_path(Path::new(&[])).unwrap(), *doc.root_id());
    }

    #[test]
    fn paths_resolve_and_reconstruct() {
        let doc = seeded_doc();
        let n1 = NodeId::new("Node", "n1");
        let n2 = NodeId::new("Node", "n2");
        let m1 = NodeId::new("Member", "m1");

        let p1 = doc.path_of(&n1).unwrap();
        assert_eq!(format!("{}", p1), "children[0]");
        assert_eq!(doc.id_at_path(p1.as_path()).unwrap(), n1);

        let p2 = doc.path_of(&n2).unwrap();
        assert_eq!(format!("{}", p2), "children[0].children[0]");
        assert_eq!(doc.id_at_path(p2.as_path()).unwrap(), n2);

        let pm = doc.path_of(&m1).unwrap();
        assert_eq!(format!("{}", pm), "owner");
        assert_eq!(doc.id_at_path(pm.as_path()).unwrap(), m1);
    }

    #[test]
    fn path_failures_are_typed() {
        let doc = seeded_doc();
        // array index into a single link
        let mut p = PathBuf::new();
        p.index("owner", 0);
        assert!(matches!(
            doc.id_at_path(p.as_path()),
            Err(Error::Shape(_))
        ));
        // out of range
        let mut p = PathBuf::new();
        p.index("children", 7);
        assert!(matches!(doc.id_at_path(p.as_path()), Err(Error::Range(_))));
        // unknown field
        let mut p = PathBuf::new();
        p.field("nope");
        assert!(matches!(
            doc.id_at_path(p.as_path()),
            Err(Error::Constraint(_))
        ));
        // missing node
        assert!(matches!(
            doc.path_of(&NodeId::new("Node", "ghost")),
            Err(Error::Reference(_))
        ));
    }

    #[test]
    fn re_id_preserves_structure() {
        let doc = seeded_doc();
        let n1 = NodeId::new("Node", "n1");
        let (new_doc, mapping) = doc.re_id_subtree(&n1).unwrap();
        assert_eq!(mapping.len(), 2); // n1 and its child n2
        assert_eq!(new_doc.len(), doc.len());
        for (old, new) in &mapping {
            assert!(!new_doc.contains(old));
            let node = new_doc.get_node(new).unwrap();
            assert_eq!(node.node_type(), old.node_type());
            assert_eq!(node.data, doc.get_node(old).unwrap().data);
        }
        // the root's forward link now names the new id
        let new_n1 = mapping.get(&n1).unwrap();
        assert!(new_doc.root().child_link("children").unwrap().contains(new_n1));
        let p = new_doc.path_of(new_n1).unwrap();
        assert_eq!(new_doc.id_at_path(p.as_path()).unwrap(), *new_n1);
    }

    #[test]
    fn re_id_of_unknown_subtree_fails() {
        let doc = seeded_doc();
        assert!(matches!(
            doc.re_id_subtree(&NodeId::new("Node", "ghost")),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let doc = seeded_doc();
        let snapshot = doc.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: DocSnapshot = serde_json::from_str(&json).unwrap();
        let rebuilt =
            NormalizedDocument::from_snapshot(Arc::clone(doc.schema_arc()), decoded).unwrap();
        assert_eq!(rebuilt, doc);
    }
}
