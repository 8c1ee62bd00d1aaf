//! Shared fixtures and proptest strategies for the module tests.

use proptest::prelude::*;
use std::sync::Arc;

use crate::doc::NormalizedDocument;
use crate::id::NodeId;
use crate::ops::{ElementInfo, Position};
use crate::path::PathBuf;
use crate::schema::{LinkKind, NodeTypeDef, Schema};
use crate::value::{Fields, Value};

/// The todo-list schema the end-to-end scenarios run on: a root with an
/// ordered node tree, one owner slot and a member set.
pub fn todo_schema() -> Schema {
    Schema::new("TodoList", "Root")
        .with_type(
            "Root",
            NodeTypeDef::new()
                .with_field("name", Value::Str(String::new()))
                .with_child("children", LinkKind::Array)
                .with_child("owner", LinkKind::Single)
                .with_child("members", LinkKind::Set),
        )
        .with_type(
            "Node",
            NodeTypeDef::new()
                .with_field("text", Value::Str(String::new()))
                .with_field("isChecked", Value::Bool(false))
                .with_field("membersIds", Value::List(vec![]))
                .with_child("children", LinkKind::Array),
        )
        .with_type(
            "Member",
            NodeTypeDef::new()
                .with_field("firstName", Value::Str(String::new()))
                .with_field("lastName", Value::Str(String::new())),
        )
}

/// An empty todo document with root id `Root.1`.
pub fn todo_doc() -> NormalizedDocument {
    let mut data = Fields::new();
    data.insert("name".to_string(), Value::from("todos"));
    NormalizedDocument::new(Arc::new(todo_schema()), 1u64.into(), Some(data)).unwrap()
}

/// A small populated document:
/// `children = [n1]`, `n1.children = [n2]`, `owner = m1`, `members = {m2}`.
pub fn seeded_doc() -> NormalizedDocument {
    let mut edit = todo_doc().edit();
    edit.insert_element(
        PathBuf::new(),
        Position::array("children", 0),
        ElementInfo::new("Node").with_key("n1").with_field("text", "first"),
    )
    .unwrap();
    edit.insert_element(
        NodeId::new("Node", "n1"),
        Position::array("children", 0),
        ElementInfo::new("Node").with_key("n2").with_field("text", "second"),
    )
    .unwrap();
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

/// Strategy for small node texts.
pub fn arb_text() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

/// Strategy for a randomly grown todo document: a sequence of inserts of
/// `Node` elements under random existing nodes.
pub fn arb_doc() -> impl Strategy<Value = NormalizedDocument> {
    proptest::collection::vec((any::<u16>(), arb_text(), any::<bool>()), 0..12).prop_map(
        |inserts| {
            let mut edit = todo_doc().edit();
            for (i, (slot, text, checked)) in inserts.into_iter().enumerate() {
                let parents: Vec<NodeId> = edit
                    .iter()
                    .filter(|node| node.node_type() != "Member")
                    .map(|node| node.id.clone())
                    .collect();
                let parent = parents[(slot as usize) % parents.len()].clone();
                let index = (slot as usize) % 3;
                edit.insert_element(
                    parent,
                    Position::array("children", index),
                    ElementInfo::new("Node")
                        .with_key(format!("n{}", i))
                        .with_field("text", text)
                        .with_field("isChecked", checked),
                )
                .expect("grow document");
            }
            edit.updated_document()
        },
    )
}

/// A random batch of edits applied to `doc`, returning the edited result.
/// Used for diff and merge round-trip properties.
pub fn arb_edited(doc: NormalizedDocument) -> impl Strategy<Value = NormalizedDocument> {
    proptest::collection::vec((any::<u16>(), any::<u16>(), arb_text()), 0..8).prop_map(
        move |edits| {
            let mut edit = doc.edit();
            let mut insert_seq = 0usize;
            for (choice, slot, text) in edits {
                let nodes: Vec<NodeId> = edit
                    .iter()
                    .filter(|node| node.node_type() == "Node")
                    .map(|node| node.id.clone())
                    .collect();
                match choice % 4 {
                    // insert somewhere
                    0 => {
                        let parent = if nodes.is_empty() || slot % 2 == 0 {
                            crate::ops::Target::Path(PathBuf::new())
                        } else {
                            crate::ops::Target::Id(
                                nodes[(slot as usize) % nodes.len()].clone(),
                            )
                        };
                        insert_seq += 1;
                        edit.insert_element(
                            parent,
                            Position::array("children", (slot as usize) % 3),
                            ElementInfo::new("Node")
                                .with_key(format!("x{}-{}", insert_seq, slot))
                                .with_field("text", text),
                        )
                        .expect("insert");
                    }
                    // change a node's text
                    1 => {
                        if let Some(id) = nodes.get((slot as usize) % nodes.len().max(1)) {
                            let mut patch = Fields::new();
                            patch.insert("text".to_string(), Value::Str(text));
                            edit.change_element(id, patch).expect("change");
                        }
                    }
                    // move a node under the root
                    2 => {
                        if let Some(id) = nodes.get((slot as usize) % nodes.len().max(1)) {
                            let target_idx = (slot as usize) % 3;
                            edit.move_element(
                                id,
                                PathBuf::new(),
                                Position::array("children", target_idx),
                                None,
                            )
                            .expect("move under root");
                        }
                    }
                    // delete a subtree
                    _ => {
                        if let Some(id) = nodes.get((slot as usize) % nodes.len().max(1)) {
                            if edit.get_node(id).is_some() {
                                edit.delete_element(id).expect("delete");
                            }
                        }
                    }
                }
            }
            edit.updated_document()
        },
    )
}
