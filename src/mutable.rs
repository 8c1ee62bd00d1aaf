use std::collections::BTreeMap;
use std::sync::Arc;

use crate::doc::{collect_subtree, path_of_node, resolve_path, DocRead, NormalizedDocument};
use crate::error::{Error, Result};
use crate::id::{ElementKey, FieldName, NodeId};
use crate::node::{Node, NodeLink, ParentRef};
use crate::ops::{Command, ElementInfo, Position, Target};
use crate::path::{Path, PathBuf};
use crate::schema::{LinkKind, Schema, ORPHANS_FIELD};
use crate::store::CowMap;
use crate::value::Fields;

fn arc_node_equals(a: &Arc<Node>, b: &Arc<Node>) -> bool {
    Arc::ptr_eq(a, b) || a == b
}

/// A staged editing session over a [`NormalizedDocument`]. Edits go
/// through the four primitive commands, are applied with structural
/// sharing over a copy-on-write node store, and are recorded in an
/// append-only change log whose replay on any equal-shaped document
/// reproduces the same result.
///
/// Every primitive fails atomically: on error the session is in its
/// pre-call state and nothing is recorded.
pub struct MutableDocument {
    original: NormalizedDocument,
    root_id: NodeId,
    nodes: CowMap<NodeId, Arc<Node>>,
    log: Vec<Command>,
}

impl MutableDocument {
    pub fn new(doc: &NormalizedDocument) -> Self {
        Self {
            original: doc.clone(),
            root_id: doc.root_id().clone(),
            nodes: CowMap::with_equals(Arc::new(doc.nodes().clone()), arc_node_equals),
            log: Vec::new(),
        }
    }

    /// The document this session started from.
    pub fn original(&self) -> &NormalizedDocument {
        &self.original
    }

    /// The commands recorded so far, in application order.
    pub fn changes(&self) -> &[Command] {
        &self.log
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).map(|node| node.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|node| node.as_ref())
    }

    pub fn id_at_path(&self, path: Path) -> Result<NodeId> {
        resolve_path(self, path)
    }

    pub fn path_of(&self, id: &NodeId) -> Result<PathBuf> {
        path_of_node(self, id)
    }

    /// Materializes the edited document, or returns the original when no
    /// staged change survived.
    pub fn updated_document(&self) -> NormalizedDocument {
        if !self.nodes.has_changed() {
            return self.original.clone();
        }
        NormalizedDocument::from_parts(
            Arc::clone(self.original.schema_arc()),
            self.root_id.clone(),
            self.nodes.to_map(),
        )
    }

    /// Constructs an empty node of the element type, overlays the payload
    /// data and links it under `parent` at `position`.
    pub fn insert_element(
        &mut self,
        parent: impl Into<Target>,
        position: Position,
        info: ElementInfo,
    ) -> Result<NodeId> {
        let parent_id = self.resolve(&parent.into())?;
        let schema = self.schema_arc();
        schema.node_type(&info.node_type)?;
        schema.validate_data(&info.node_type, &info.data)?;
        let key = info.key.clone().unwrap_or_else(ElementKey::generate);
        let element = NodeId::new(info.node_type.clone(), key);
        if self.nodes.contains(&element) {
            return Err(Error::uniqueness(format!("{} is already live", element)));
        }
        self.validate_attach(&element, &parent_id, &position)?;

        let mut node = schema.empty_node(&info.node_type, element.key().clone())?;
        for (field, value) in &info.data {
            node.data.insert(field.clone(), value.clone());
        }
        self.nodes.insert(element.clone(), Arc::new(node));
        let position = self.attach(&element, &parent_id, &position)?;
        self.log.push(Command::Insert {
            parent: parent_id,
            position,
            element: element.clone(),
            data: info.data,
        });
        Ok(element)
    }

    /// Overlays a data patch on a node. Patches that leave the node
    /// structurally unchanged are not recorded.
    pub fn change_element(&mut self, target: impl Into<Target>, changes: Fields) -> Result<()> {
        let element = self.resolve(&target.into())?;
        let node = self.node_ok(&element)?;
        self.schema_arc().validate_data(node.node_type(), &changes)?;
        let differs = changes
            .iter()
            .any(|(field, value)| node.data.get(field) != Some(value));
        if !differs {
            return Ok(());
        }
        self.modify(&element, |node| {
            for (field, value) in &changes {
                node.data.insert(field.clone(), value.clone());
            }
        })?;
        self.log.push(Command::Change { element, changes });
        Ok(())
    }

    /// Detaches a node from its current parent and attaches it under a
    /// new parent, optionally patching its data in between. Moves to the
    /// node's current position are no-ops. A move out of a `Single` link
    /// into a `Set` position is staged through the root `__orphans` array
    /// and recorded as the two commands replay needs.
    pub fn move_element(
        &mut self,
        target: impl Into<Target>,
        to_parent: impl Into<Target>,
        position: Position,
        changes: Option<Fields>,
    ) -> Result<()> {
        let element = self.resolve(&target.into())?;
        let to_parent = self.resolve(&to_parent.into())?;
        let node = self.node_ok(&element)?;
        let parent_ref = node.parent.clone().ok_or_else(|| {
            Error::constraint(format!("the root {} cannot be moved", element))
        })?;
        if is_same_position(&parent_ref, &to_parent, &position) {
            return Ok(());
        }
        let source_kind = self
            .node_ok(&parent_ref.parent)?
            .child_link(&parent_ref.field)
            .map(NodeLink::kind);
        if source_kind == Some(LinkKind::Single) && position.kind() == LinkKind::Set {
            // stage through __orphans so the log replays on documents
            // where the single slot is already empty; the final hop is
            // validated first so a bad target cannot strand the element
            self.validate_attach(&element, &to_parent, &position)?;
            if let Some(changes) = &changes {
                let ty = self.node_ok(&element)?.node_type().to_string();
                self.schema_arc().validate_data(&ty, changes)?;
            }
            let root = self.root_id.clone();
            let orphans_len = self
                .node_ok(&root)?
                .child_link(ORPHANS_FIELD)
                .map_or(0, NodeLink::len);
            self.do_move(
                &element,
                &root,
                Position::array(ORPHANS_FIELD, orphans_len),
                None,
            )?;
            return self.do_move(&element, &to_parent, position, changes);
        }
        self.do_move(&element, &to_parent, position, changes)
    }

    /// Deletes a node and its entire subtree.
    pub fn delete_element(&mut self, target: impl Into<Target>) -> Result<()> {
        let element = self.resolve(&target.into())?;
        let node = self.node_ok(&element)?;
        if node.parent.is_none() {
            return Err(Error::constraint(format!(
                "the root {} cannot be deleted",
                element
            )));
        }
        let subtree = collect_subtree(self, &element);
        self.detach(&element)?;
        for id in &subtree {
            self.nodes.remove(id);
        }
        self.log.push(Command::Delete { element });
        Ok(())
    }

    /// Replays a recorded command sequence. Replay assumes the commands
    /// were produced against an equal-shaped document and does not
    /// re-validate beyond what the primitives enforce.
    pub fn apply_changes(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command.clone() {
                Command::Insert {
                    parent,
                    position,
                    element,
                    data,
                } => {
                    let info = ElementInfo {
                        node_type: element.node_type().to_string(),
                        key: Some(element.key().clone()),
                        data,
                    };
                    self.insert_element(parent, position, info)?;
                }
                Command::Change { element, changes } => {
                    self.change_element(element, changes)?;
                }
                Command::Move {
                    element,
                    to_parent,
                    position,
                    changes,
                } => {
                    self.move_element(element, to_parent, position, changes)?;
                }
                Command::Delete { element } => {
                    self.delete_element(element)?;
                }
            }
        }
        Ok(())
    }

    /// Replaces a node's non-child links. Only merge clone insertion uses
    /// this; the primitive commands never touch `links`.
    pub(crate) fn set_links(
        &mut self,
        id: &NodeId,
        links: BTreeMap<FieldName, NodeLink>,
    ) -> Result<()> {
        self.modify(id, |node| node.links = links)
    }

    fn schema_arc(&self) -> Arc<Schema> {
        Arc::clone(self.original.schema_arc())
    }

    fn resolve(&self, target: &Target) -> Result<NodeId> {
        match target {
            Target::Id(id) => {
                if self.nodes.contains(id) {
                    Ok(id.clone())
                } else {
                    Err(Error::reference(format!("node {} is not live", id)))
                }
            }
            Target::Path(path) => resolve_path(self, path.as_path()),
        }
    }

    fn node_ok(&self, id: &NodeId) -> Result<&Node> {
        self.get_node(id)
            .ok_or_else(|| Error::reference(format!("node {} is not live", id)))
    }

    fn modify<F: FnOnce(&mut Node)>(&mut self, id: &NodeId, f: F) -> Result<()> {
        let arc = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::reference(format!("node {} is not live", id)))?;
        f(Arc::make_mut(arc));
        Ok(())
    }

    /// Checks that a node may be attached at `position` without touching
    /// any state.
    fn validate_attach(
        &self,
        element: &NodeId,
        parent_id: &NodeId,
        position: &Position,
    ) -> Result<()> {
        let parent = self.node_ok(parent_id)?;
        let kind = self
            .schema_arc()
            .child_kind(parent.node_type(), position.field())?;
        if kind != position.kind() {
            return Err(Error::shape(format!(
                "position {:?} targets a {:?} link",
                position, kind
            )));
        }
        match position {
            Position::Single { field } => {
                if let Some(NodeLink::Single(Some(current))) = parent.child_link(field) {
                    if current != element {
                        return Err(Error::constraint(format!(
                            "{}.{} already holds {}",
                            parent_id, field, current
                        )));
                    }
                }
            }
            Position::Array { .. } => {}
            Position::Set { id, .. } => {
                if id != element {
                    return Err(Error::shape(format!(
                        "set position names {} but the element is {}",
                        id, element
                    )));
                }
            }
        }
        Ok(())
    }

    /// Splices the element into the parent link and sets its back
    /// pointer. Returns the effective position (array indices clamped).
    fn attach(
        &mut self,
        element: &NodeId,
        parent_id: &NodeId,
        position: &Position,
    ) -> Result<Position> {
        match position {
            Position::Single { field } => {
                self.modify(parent_id, |parent| {
                    parent
                        .children
                        .insert(field.clone(), NodeLink::Single(Some(element.clone())));
                })?;
                self.modify(element, |node| {
                    node.parent = Some(ParentRef::single(parent_id.clone(), field.clone()));
                })?;
                Ok(position.clone())
            }
            Position::Array { field, index } => {
                let len = self
                    .node_ok(parent_id)?
                    .child_link(field)
                    .map_or(0, NodeLink::len);
                let index = (*index).min(len);
                let element_for_splice = element.clone();
                self.modify(parent_id, |parent| {
                    match parent.child_link_mut(field) {
                        Some(NodeLink::Array(children)) => {
                            children.insert(index, element_for_splice)
                        }
                        _ => {
                            parent
                                .children
                                .insert(field.clone(), NodeLink::Array(vec![element_for_splice]));
                        }
                    }
                })?;
                self.modify(element, |node| {
                    node.parent = Some(ParentRef::array(parent_id.clone(), field.clone(), index));
                })?;
                self.renumber(parent_id, field, index + 1)?;
                Ok(Position::array(field.clone(), index))
            }
            Position::Set { field, .. } => {
                let member = element.clone();
                self.modify(parent_id, |parent| match parent.child_link_mut(field) {
                    Some(NodeLink::Set(children)) => {
                        children.insert(member.canonical(), member);
                    }
                    _ => {
                        let mut children = BTreeMap::new();
                        children.insert(member.canonical(), member);
                        parent.children.insert(field.clone(), NodeLink::Set(children));
                    }
                })?;
                self.modify(element, |node| {
                    node.parent = Some(ParentRef {
                        parent: parent_id.clone(),
                        field: field.clone(),
                        index: None,
                    });
                })?;
                Ok(position.clone())
            }
        }
    }

    /// Unlinks the element from its parent, which must hold it.
    fn detach(&mut self, element: &NodeId) -> Result<()> {
        let parent_ref = self
            .node_ok(element)?
            .parent
            .clone()
            .ok_or_else(|| Error::integrity(format!("{} has no parent to detach from", element)))?;
        let parent = self.node_ok(&parent_ref.parent)?;
        let link = parent.child_link(&parent_ref.field).ok_or_else(|| {
            Error::integrity(format!(
                "parent {} has no link {:?}",
                parent_ref.parent, parent_ref.field
            ))
        })?;
        if !link.contains(element) {
            return Err(Error::integrity(format!(
                "{}.{} does not hold {}",
                parent_ref.parent, parent_ref.field, element
            )));
        }
        let removed_index = match link {
            NodeLink::Array(children) => children.iter().position(|id| id == element),
            _ => None,
        };
        let element_for_unlink = element.clone();
        self.modify(&parent_ref.parent, |parent| {
            match parent.child_link_mut(&parent_ref.field) {
                Some(NodeLink::Single(slot)) => *slot = None,
                Some(NodeLink::Array(children)) => {
                    children.retain(|id| id != &element_for_unlink);
                }
                Some(NodeLink::Set(children)) => {
                    children.remove(&element_for_unlink.canonical());
                }
                None => {}
            }
        })?;
        if let Some(index) = removed_index {
            self.renumber(&parent_ref.parent, &parent_ref.field, index)?;
        }
        self.modify(element, |node| node.parent = None)?;
        Ok(())
    }

    /// Re-aligns the parent-ref indices of array children from `from` on.
    fn renumber(&mut self, parent_id: &NodeId, field: &str, from: usize) -> Result<()> {
        let siblings: Vec<NodeId> = match self.node_ok(parent_id)?.child_link(field) {
            Some(NodeLink::Array(children)) if from < children.len() => {
                children[from..].to_vec()
            }
            _ => return Ok(()),
        };
        for (offset, sibling) in siblings.iter().enumerate() {
            let index = from + offset;
            self.modify(sibling, |node| {
                if let Some(parent) = &mut node.parent {
                    parent.index = Some(index);
                }
            })?;
        }
        Ok(())
    }

    fn do_move(
        &mut self,
        element: &NodeId,
        to_parent: &NodeId,
        position: Position,
        changes: Option<Fields>,
    ) -> Result<()> {
        self.validate_attach(element, to_parent, &position)?;
        if let Some(changes) = &changes {
            let ty = self.node_ok(element)?.node_type().to_string();
            self.schema_arc().validate_data(&ty, changes)?;
        }
        if collect_subtree(self, element).contains(to_parent) {
            return Err(Error::integrity(format!(
                "cannot move {} under its own descendant {}",
                element, to_parent
            )));
        }
        self.detach(element)?;
        if let Some(changes) = &changes {
            self.modify(element, |node| {
                for (field, value) in changes {
                    node.data.insert(field.clone(), value.clone());
                }
            })?;
        }
        let position = self.attach(element, to_parent, &position)?;
        self.log.push(Command::Move {
            element: element.clone(),
            to_parent: to_parent.clone(),
            position,
            changes,
        });
        Ok(())
    }
}

impl DocRead for MutableDocument {
    fn schema(&self) -> &Schema {
        self.original.schema_arc()
    }

    fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    fn node(&self, id: &NodeId) -> Option<&Node> {
        self.get_node(id)
    }
}

fn is_same_position(current: &ParentRef, to_parent: &NodeId, position: &Position) -> bool {
    if &current.parent != to_parent || current.field != position.field() {
        return false;
    }
    match position {
        Position::Single { .. } => current.index.is_none(),
        Position::Array { index, .. } => current.index == Some(*index),
        Position::Set { .. } => current.index.is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{seeded_doc, todo_doc, todo_schema};
    use crate::value::Value;

    fn root_id() -> NodeId {
        NodeId::new("Root", 1u64)
    }

    // insert a first node under the root
    #[test]
    fn insert_into_root() {
        let doc = todo_doc();
        let mut edit = doc.edit();
        let n1 = edit
            .insert_element(
                PathBuf::new(),
                Position::array("children", 0),
                ElementInfo::new("Node")
                    .with_key("n1")
                    .with_field("text", "firstNode")
                    .with_field("isChecked", false),
            )
            .unwrap();
        assert_eq!(n1, NodeId::new("Node", "n1"));

        let updated = edit.updated_document();
        let root = updated.root();
        assert_eq!(
            root.child_link("children").unwrap().as_array().unwrap(),
            &[n1.clone()]
        );
        let node = updated.get_node(&n1).unwrap();
        assert_eq!(node.parent, Some(ParentRef::array(root_id(), "children", 0)));
        assert_eq!(node.data.get("text"), Some(&Value::from("firstNode")));
        assert_eq!(edit.changes().len(), 1);
    }

    // a move from a Single link into a Set stages through __orphans
    #[test]
    fn move_single_to_set_records_two_steps() {
        let doc = todo_doc_with_members();
        let m1 = NodeId::new("Member", "m1");
        let mut edit = doc.edit();
        edit.move_element(
            &m1,
            PathBuf::new(),
            Position::set("members", m1.clone()),
            None,
        )
        .unwrap();

        assert_eq!(
            edit.changes(),
            &[
                Command::Move {
                    element: m1.clone(),
                    to_parent: root_id(),
                    position: Position::array(ORPHANS_FIELD, 0),
                    changes: None,
                },
                Command::Move {
                    element: m1.clone(),
                    to_parent: root_id(),
                    position: Position::set("members", m1.clone()),
                    changes: None,
                },
            ]
        );

        let updated = edit.updated_document();
        let root = updated.root();
        assert_eq!(root.child_link("owner").unwrap(), &NodeLink::Single(None));
        let members = root.child_link("members").unwrap().as_set().unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains_key("Member.m1"));
        assert!(members.contains_key("Member.m2"));
        assert!(root.child_link(ORPHANS_FIELD).unwrap().is_empty());
    }

    // deleting a node removes its whole subtree
    #[test]
    fn delete_cascades() {
        let doc = seeded_doc();
        let n1 = NodeId::new("Node", "n1");
        let n2 = NodeId::new("Node", "n2");
        let mut edit = doc.edit();
        edit.delete_element(&n1).unwrap();
        let updated = edit.updated_document();
        assert!(!updated.contains(&n1));
        assert!(!updated.contains(&n2));
        assert!(updated.root().child_link("children").unwrap().is_empty());
        assert_eq!(edit.changes(), &[Command::Delete { element: n1 }]);
    }

    #[test]
    fn unchanged_session_returns_the_original() {
        let doc = seeded_doc();
        let mut edit = doc.edit();
        // a patch equal to the current data is suppressed
        let mut same = Fields::new();
        same.insert("text".to_string(), Value::from("first"));
        edit.change_element(&NodeId::new("Node", "n1"), same).unwrap();
        assert!(edit.changes().is_empty());
        assert_eq!(edit.updated_document(), doc);
    }

    #[test]
    fn move_to_current_position_is_a_no_op() {
        let doc = seeded_doc();
        let mut edit = doc.edit();
        edit.move_element(
            &NodeId::new("Node", "n1"),
            PathBuf::new(),
            Position::array("children", 0),
            None,
        )
        .unwrap();
        assert!(edit.changes().is_empty());
    }

    #[test]
    fn array_moves_renumber_siblings() {
        let doc = todo_doc();
        let mut edit = doc.edit();
        let ids: Vec<NodeId> = (0..3)
            .map(|i| {
                edit.insert_element(
                    PathBuf::new(),
                    Position::array("children", i),
                    ElementInfo::new("Node").with_key(format!("n{}", i)),
                )
                .unwrap()
            })
            .collect();
        edit.move_element(&ids[2], PathBuf::new(), Position::array("children", 0), None)
            .unwrap();
        let updated = edit.updated_document();
        let children = updated
            .root()
            .child_link("children")
            .unwrap()
            .as_array()
            .unwrap()
            .to_vec();
        assert_eq!(children, vec![ids[2].clone(), ids[0].clone(), ids[1].clone()]);
        for (index, id) in children.iter().enumerate() {
            assert_eq!(
                updated.get_node(id).unwrap().parent,
                Some(ParentRef::array(root_id(), "children", index))
            );
        }
    }

    #[test]
    fn failures_leave_the_session_untouched() {
        let doc = seeded_doc();
        let mut edit = doc.edit();
        // duplicate id
        let err = edit.insert_element(
            PathBuf::new(),
            Position::array("children", 0),
            ElementInfo::new("Node").with_key("n1"),
        );
        assert!(matches!(err, Err(Error::Uniqueness(_))));
        // occupied single
        let err = edit.insert_element(
            PathBuf::new(),
            Position::single("owner"),
            ElementInfo::new("Member").with_key("m9"),
        );
        assert!(matches!(err, Err(Error::Constraint(_))));
        // unknown data field
        let err = edit.insert_element(
            PathBuf::new(),
            Position::array("children", 0),
            ElementInfo::new("Node").with_key("n9").with_field("nope", 1i64),
        );
        assert!(matches!(err, Err(Error::Constraint(_))));
        // position kind mismatch
        let err = edit.insert_element(
            PathBuf::new(),
            Position::array("owner", 0),
            ElementInfo::new("Member").with_key("m9"),
        );
        assert!(matches!(err, Err(Error::Shape(_))));
        // moving under a descendant
        let err = edit.move_element(
            &NodeId::new("Node", "n1"),
            &NodeId::new("Node", "n2"),
            Position::array("children", 0),
            None,
        );
        assert!(matches!(err, Err(Error::Integrity(_))));

        assert!(edit.changes().is_empty());
        assert_eq!(edit.updated_document(), doc);
    }

    #[test]
    fn replaying_the_log_reproduces_the_document() {
        let doc = seeded_doc();
        let mut edit = doc.edit();
        let m1 = NodeId::new("Member", "m1");
        edit.move_element(&m1, PathBuf::new(), Position::set("members", m1.clone()), None)
            .unwrap();
        let mut patch = Fields::new();
        patch.insert("text".to_string(), Value::from("renamed"));
        edit.change_element(&NodeId::new("Node", "n1"), patch).unwrap();
        edit.delete_element(&NodeId::new("Node", "n2")).unwrap();
        let expected = edit.updated_document();

        let mut replay = doc.edit();
        replay.apply_changes(&edit.changes().to_vec()).unwrap();
        assert_eq!(replay.updated_document(), expected);
    }

    fn todo_doc_with_members() -> NormalizedDocument {
        // owner = m1, members = { m2 }, matching the S2 seed
        let mut edit = todo_doc().edit();
        edit.insert_element(
            PathBuf::new(),
            Position::single("owner"),
            ElementInfo::new("Member")
                .with_key("m1")
                .with_field("firstName", "Ada"),
        )
        .unwrap();
        let m2 = NodeId::new("Member", "m2");
        edit.insert_element(
            PathBuf::new(),
            Position::set("members", m2),
            ElementInfo::new("Member")
                .with_key("m2")
                .with_field("firstName", "Grace"),
        )
        .unwrap();
        edit.updated_document()
    }

    #[test]
    fn set_insert_position_must_name_the_element() {
        let doc = todo_doc();
        let mut edit = doc.edit();
        let err = edit.insert_element(
            PathBuf::new(),
            Position::set("members", NodeId::new("Member", "other")),
            ElementInfo::new("Member").with_key("m1"),
        );
        assert!(matches!(err, Err(Error::Shape(_))));
    }

    #[test]
    fn schema_used_by_tests_is_stable() {
        // guards against fixture drift: S1's schema shape
        let schema = todo_schema();
        assert_eq!(schema.root_type(), "Root");
        assert_eq!(
            schema.child_kind("Root", "children").unwrap(),
            LinkKind::Array
        );
        assert_eq!(schema.child_kind("Root", "owner").unwrap(), LinkKind::Single);
        assert_eq!(schema.child_kind("Root", "members").unwrap(), LinkKind::Set);
    }
}
