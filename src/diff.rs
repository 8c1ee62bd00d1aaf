use std::collections::BTreeSet;

use crate::doc::{DocRead, NormalizedDocument};
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::integrity::{check_document, AssertConfig};
use crate::lcs::{diff_array, ArrayChange};
use crate::mutable::MutableDocument;
use crate::node::NodeLink;
use crate::ops::{Command, ElementInfo, Position};
use crate::schema::{LinkKind, ORPHANS_FIELD};
use crate::value::Fields;

/// Computes a command sequence that, replayed through
/// [`MutableDocument::apply_changes`], turns `a` into a document equal to
/// `b`. Both documents must share the schema and the root node.
///
/// The sequence is produced by simulating it: deletes of missing
/// subtrees first, then inserts of new nodes in breadth-first order,
/// then data patches, then link reconciliation per parent field using
/// the array edit script for ordered children. Nodes that survive a
/// deleted subtree, or that are displaced before their final parent has
/// claimed them, are staged through the root `__orphans` array, which is
/// empty again once the sequence completes.
pub fn diff(a: &NormalizedDocument, b: &NormalizedDocument) -> Result<Vec<Command>> {
    if a.schema() != b.schema() {
        return Err(Error::constraint(
            "documents do not share a schema".to_string(),
        ));
    }
    if a.root_id() != b.root_id() {
        return Err(Error::constraint(format!(
            "documents do not share a root: {} vs {}",
            a.root_id(),
            b.root_id()
        )));
    }
    let config = AssertConfig::default();
    check_document(a, &config)?;
    check_document(b, &config)?;

    let mut work = a.edit();

    delete_missing(&mut work, a, b)?;
    insert_new(&mut work, a, b)?;
    patch_data(&mut work, a, b)?;
    reconcile_links(&mut work, b)?;

    debug_assert!(work.updated_document() == *b, "diff simulation diverged");
    debug_assert!(
        work.get_node(b.root_id())
            .and_then(|root| root.child_link(ORPHANS_FIELD))
            .map_or(true, NodeLink::is_empty),
        "orphans not drained"
    );
    Ok(work.changes().to_vec())
}

/// Deletes the maximal subtrees of `a` that are gone in `b`, evacuating
/// surviving descendants to `__orphans` first, in depth-first post-order.
fn delete_missing(
    work: &mut MutableDocument,
    a: &NormalizedDocument,
    b: &NormalizedDocument,
) -> Result<()> {
    let mut roots: Vec<NodeId> = Vec::new();
    post_order(a, a.root_id(), &mut |id| {
        if b.contains(id) {
            return;
        }
        let parent_in_b = a
            .get_node(id)
            .and_then(|node| node.parent.as_ref())
            .map(|parent| b.contains(&parent.parent))
            .unwrap_or(false);
        if parent_in_b {
            roots.push(id.clone());
        }
    });
    for root in roots {
        let mut survivors = Vec::new();
        top_survivors(work, b, &root, &mut survivors);
        for survivor in survivors {
            evacuate(work, &survivor)?;
        }
        work.delete_element(&root)?;
    }
    Ok(())
}

/// Inserts nodes of `b` missing from `a`, parents before children.
fn insert_new(
    work: &mut MutableDocument,
    a: &NormalizedDocument,
    b: &NormalizedDocument,
) -> Result<()> {
    let order = breadth_first_ids(b);
    for id in order {
        if a.contains(&id) {
            continue;
        }
        let node = b.get_node(&id).expect("listed node");
        let parent_ref = node.parent.as_ref().ok_or_else(|| {
            Error::integrity(format!("inserted node {} has no parent in the target", id))
        })?;
        let kind = b
            .schema()
            .child_kind(parent_ref.parent.node_type(), &parent_ref.field)?;
        let position = match kind {
            LinkKind::Single => {
                // vacate the slot when the source still holds another child
                let occupant = work
                    .get_node(&parent_ref.parent)
                    .and_then(|parent| parent.child_link(&parent_ref.field))
                    .and_then(|link| link.as_single().cloned())
                    .flatten();
                if let Some(occupant) = occupant {
                    evacuate(work, &occupant)?;
                }
                Position::single(parent_ref.field.clone())
            }
            LinkKind::Array => {
                Position::array(parent_ref.field.clone(), parent_ref.index.unwrap_or(0))
            }
            LinkKind::Set => Position::set(parent_ref.field.clone(), id.clone()),
        };
        work.insert_element(
            parent_ref.parent.clone(),
            position,
            ElementInfo {
                node_type: id.node_type().to_string(),
                key: Some(id.key().clone()),
                data: node.data.clone(),
            },
        )?;
    }
    Ok(())
}

/// Emits a data patch for every node present in both documents whose
/// data differs, containing only the changed fields.
fn patch_data(
    work: &mut MutableDocument,
    a: &NormalizedDocument,
    b: &NormalizedDocument,
) -> Result<()> {
    for node in b.iter() {
        let old = match a.get_node(&node.id) {
            Some(old) => old,
            None => continue, // carried its data at insert time
        };
        let mut delta = Fields::new();
        for (field, value) in &node.data {
            if old.data.get(field) != Some(value) {
                delta.insert(field.clone(), value.clone());
            }
        }
        if !delta.is_empty() {
            work.change_element(&node.id, delta)?;
        }
    }
    Ok(())
}

/// Brings every child link field of the simulated document to its target
/// state, breadth-first over the target.
fn reconcile_links(work: &mut MutableDocument, b: &NormalizedDocument) -> Result<()> {
    for parent_id in breadth_first_ids(b) {
        let target = b.get_node(&parent_id).expect("listed node");
        let fields: Vec<String> = target.children.keys().cloned().collect();
        for field in fields {
            if field == ORPHANS_FIELD {
                continue;
            }
            let tgt = target.child_link(&field).expect("listed field").clone();
            match tgt {
                NodeLink::Single(tgt_child) => {
                    reconcile_single(work, &parent_id, &field, tgt_child)?;
                }
                NodeLink::Set(tgt_members) => {
                    let tgt_ids: BTreeSet<NodeId> = tgt_members.values().cloned().collect();
                    reconcile_set(work, &parent_id, &field, &tgt_ids)?;
                }
                NodeLink::Array(tgt_ids) => {
                    reconcile_array(work, &parent_id, &field, &tgt_ids)?;
                }
            }
        }
    }
    Ok(())
}

fn reconcile_single(
    work: &mut MutableDocument,
    parent_id: &NodeId,
    field: &str,
    tgt: Option<NodeId>,
) -> Result<()> {
    let cur = work
        .get_node(parent_id)
        .and_then(|parent| parent.child_link(field))
        .and_then(|link| link.as_single().cloned())
        .flatten();
    if cur == tgt {
        return Ok(());
    }
    if let Some(cur) = cur {
        evacuate(work, &cur)?;
    }
    if let Some(tgt) = tgt {
        work.move_element(&tgt, parent_id, Position::single(field.to_string()), None)?;
    }
    Ok(())
}

fn reconcile_set(
    work: &mut MutableDocument,
    parent_id: &NodeId,
    field: &str,
    tgt: &BTreeSet<NodeId>,
) -> Result<()> {
    let cur: Vec<NodeId> = work
        .get_node(parent_id)
        .and_then(|parent| parent.child_link(field))
        .map(|link| link.ids().cloned().collect())
        .unwrap_or_default();
    for member in &cur {
        if !tgt.contains(member) {
            evacuate(work, member)?;
        }
    }
    let cur: BTreeSet<NodeId> = cur.into_iter().collect();
    for member in tgt {
        if !cur.contains(member) {
            work.move_element(
                member,
                parent_id,
                Position::set(field.to_string(), member.clone()),
                None,
            )?;
        }
    }
    Ok(())
}

fn reconcile_array(
    work: &mut MutableDocument,
    parent_id: &NodeId,
    field: &str,
    tgt: &[NodeId],
) -> Result<()> {
    let tgt_set: BTreeSet<&NodeId> = tgt.iter().collect();
    let cur: Vec<NodeId> = array_of(work, parent_id, field);
    for id in &cur {
        if !tgt_set.contains(id) {
            evacuate(work, id)?;
        }
    }
    let cur: Vec<NodeId> = array_of(work, parent_id, field);
    let script = diff_array(&cur, tgt, |x, y| x == y);
    for change in script.changes {
        match change {
            ArrayChange::Delete { .. } => {
                // impossible: everything left in the array is in the target
                debug_assert!(false, "unexpected array delete");
            }
            ArrayChange::MoveLeft {
                el_index,
                after_el_index,
            }
            | ArrayChange::MoveRight {
                el_index,
                after_el_index,
            } => {
                let element = cur[el_index].clone();
                let index = live_index(work, parent_id, field, &cur, after_el_index, Some(&element));
                work.move_element(
                    &element,
                    parent_id,
                    Position::array(field.to_string(), index),
                    None,
                )?;
            }
            ArrayChange::Add { element, after_el_index } => {
                let index = live_index(work, parent_id, field, &cur, after_el_index, None);
                work.move_element(
                    &element,
                    parent_id,
                    Position::array(field.to_string(), index),
                    None,
                )?;
            }
        }
    }
    Ok(())
}

/// Index an element must land at so it follows its anchor in the live
/// array. When the element is being repositioned within the same array
/// from before the anchor, its removal shifts the anchor down one.
fn live_index(
    work: &MutableDocument,
    parent_id: &NodeId,
    field: &str,
    original: &[NodeId],
    after_el_index: Option<usize>,
    moving: Option<&NodeId>,
) -> usize {
    let anchor = match after_el_index {
        None => return 0,
        Some(i) => &original[i],
    };
    let live = array_of(work, parent_id, field);
    let anchor_pos = live
        .iter()
        .position(|id| id == anchor)
        .expect("anchor is live");
    let mut index = anchor_pos + 1;
    if let Some(moving) = moving {
        if let Some(moving_pos) = live.iter().position(|id| id == moving) {
            if moving_pos < anchor_pos {
                index -= 1;
            }
        }
    }
    index
}

fn array_of(work: &MutableDocument, parent_id: &NodeId, field: &str) -> Vec<NodeId> {
    work.get_node(parent_id)
        .and_then(|parent| parent.child_link(field))
        .and_then(|link| link.as_array().map(|ids| ids.to_vec()))
        .unwrap_or_default()
}

/// Moves a node to the end of the root `__orphans` array, out of the way
/// of the slot it occupies. Its final parent claims it later.
fn evacuate(work: &mut MutableDocument, id: &NodeId) -> Result<()> {
    let root = work.root_id().clone();
    let len = work
        .get_node(&root)
        .and_then(|node| node.child_link(ORPHANS_FIELD))
        .map_or(0, NodeLink::len);
    work.move_element(id, &root, Position::array(ORPHANS_FIELD, len), None)
}

/// Topmost descendants of `from` (inclusive) that exist in `b`.
fn top_survivors(
    work: &MutableDocument,
    b: &NormalizedDocument,
    from: &NodeId,
    out: &mut Vec<NodeId>,
) {
    if b.contains(from) {
        out.push(from.clone());
        return;
    }
    let children: Vec<NodeId> = match work.get_node(from) {
        Some(node) => node.child_ids().cloned().collect(),
        None => return,
    };
    for child in children {
        top_survivors(work, b, &child, out);
    }
}

fn post_order<D: DocRead + ?Sized>(doc: &D, from: &NodeId, visit: &mut impl FnMut(&NodeId)) {
    if let Some(node) = doc.node(from) {
        let children: Vec<NodeId> = node.child_ids().cloned().collect();
        for child in children {
            post_order(doc, &child, visit);
        }
    }
    visit(from);
}

fn breadth_first_ids(doc: &NormalizedDocument) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(doc.len());
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(doc.root_id().clone());
    let mut seen = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(node) = doc.get_node(&id) {
            for child in node.child_ids() {
                queue.push_back(child.clone());
            }
        }
        out.push(id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{arb_doc, arb_edited, seeded_doc};
    use crate::value::Value;
    use proptest::prelude::*;

    fn apply(doc: &NormalizedDocument, commands: &[Command]) -> NormalizedDocument {
        let mut edit = doc.edit();
        edit.apply_changes(commands).unwrap();
        edit.updated_document()
    }

    // diff of a document with itself is empty
    #[test]
    fn self_diff_is_empty() {
        let doc = seeded_doc();
        assert!(diff(&doc, &doc).unwrap().is_empty());
    }

    #[test]
    fn data_changes_patch_only_changed_fields() {
        let a = seeded_doc();
        let mut edit = a.edit();
        let mut patch = Fields::new();
        patch.insert("text".to_string(), Value::from("renamed"));
        edit.change_element(&NodeId::new("Node", "n1"), patch).unwrap();
        let b = edit.updated_document();

        let commands = diff(&a, &b).unwrap();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            Command::Change { element, changes } => {
                assert_eq!(element, &NodeId::new("Node", "n1"));
                assert_eq!(changes.len(), 1);
                assert_eq!(changes.get("text"), Some(&Value::from("renamed")));
            }
            other => panic!("expected a change, got {:?}", other),
        }
        assert_eq!(apply(&a, &commands), b);
    }

    #[test]
    fn inserts_deletes_and_moves_round_trip() {
        let a = seeded_doc();
        let mut edit = a.edit();
        // delete n2, add n3 under root, move m1 into the member set
        edit.delete_element(&NodeId::new("Node", "n2")).unwrap();
        edit.insert_element(
            crate::PathBuf::new(),
            Position::array("children", 1),
            crate::ElementInfo::new("Node").with_key("n3").with_field("text", "third"),
        )
        .unwrap();
        let m1 = NodeId::new("Member", "m1");
        edit.move_element(&m1, crate::PathBuf::new(), Position::set("members", m1.clone()), None)
            .unwrap();
        let b = edit.updated_document();

        let commands = diff(&a, &b).unwrap();
        assert_eq!(apply(&a, &commands), b);
    }

    #[test]
    fn cross_parent_move_of_survivors() {
        // delete n1 while n2 survives by moving under the root
        let a = seeded_doc();
        let mut edit = a.edit();
        let n2 = NodeId::new("Node", "n2");
        edit.move_element(&n2, crate::PathBuf::new(), Position::array("children", 1), None)
            .unwrap();
        edit.delete_element(&NodeId::new("Node", "n1")).unwrap();
        let b = edit.updated_document();

        let commands = diff(&a, &b).unwrap();
        let applied = apply(&a, &commands);
        assert_eq!(applied, b);
        assert!(applied
            .root()
            .child_link(ORPHANS_FIELD)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn array_reorder_uses_moves() {
        let a = {
            let mut edit = crate::props::todo_doc().edit();
            for (i, key) in ["x", "y", "z"].iter().enumerate() {
                edit.insert_element(
                    crate::PathBuf::new(),
                    Position::array("children", i),
                    crate::ElementInfo::new("Node").with_key(*key),
                )
                .unwrap();
            }
            edit.updated_document()
        };
        let b = {
            let mut edit = a.edit();
            edit.move_element(
                &NodeId::new("Node", "z"),
                crate::PathBuf::new(),
                Position::array("children", 0),
                None,
            )
            .unwrap();
            edit.updated_document()
        };
        let commands = diff(&a, &b).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Move { .. }));
        assert_eq!(apply(&a, &commands), b);
    }

    #[test]
    fn mismatched_roots_are_rejected() {
        let a = seeded_doc();
        let b = crate::NormalizedDocument::new(
            std::sync::Arc::clone(a.schema_arc()),
            2u64.into(),
            None,
        )
        .unwrap();
        assert!(matches!(diff(&a, &b), Err(Error::Constraint(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // applying diff(a, b) to a yields b
        #[test]
        fn diff_apply_round_trip(
            (a, b) in arb_doc().prop_flat_map(|a| {
                let b = arb_edited(a.clone());
                (Just(a), b)
            })
        ) {
            let commands = diff(&a, &b).unwrap();
            prop_assert_eq!(apply(&a, &commands), b);
        }

        // the reverse diff restores the original
        #[test]
        fn diff_reverses(
            (a, b) in arb_doc().prop_flat_map(|a| {
                let b = arb_edited(a.clone());
                (Just(a), b)
            })
        ) {
            let forward = diff(&a, &b).unwrap();
            let forwarded = apply(&a, &forward);
            let back = diff(&forwarded, &a).unwrap();
            prop_assert_eq!(apply(&forwarded, &back), a);
        }
    }
}
