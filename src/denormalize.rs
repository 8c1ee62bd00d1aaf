use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::doc::{DocRead, NormalizedDocument};
use crate::id::{FieldName, NodeId};
use crate::node::NodeLink;
use crate::value::Fields;

/// A child edge of the unfolded view, pointing at output nodes instead of
/// ids.
#[derive(Clone, Debug)]
pub enum DenormalizedLink {
    Single(Option<Rc<DenormalizedNode>>),
    Array(Vec<Rc<DenormalizedNode>>),
    Set(BTreeMap<String, Rc<DenormalizedNode>>),
}

/// A node of the unfolded, pointer-linked view of a document. Parents are
/// weak so the cyclic parent/child structure does not leak; the canonical
/// form remains the flat id-keyed map this view is derived from.
#[derive(Debug)]
pub struct DenormalizedNode {
    pub id: NodeId,
    pub data: Fields,
    pub children: RefCell<BTreeMap<FieldName, DenormalizedLink>>,
    pub parent: RefCell<Option<Weak<DenormalizedNode>>>,
}

impl DenormalizedNode {
    /// The parent node, when still alive and not the root.
    pub fn parent_node(&self) -> Option<Rc<DenormalizedNode>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }
}

/// Unfolds a document into an object graph for consumers such as
/// renderers. Two passes: one output node per input node with its parent
/// resolved, then each child field resolved to the corresponding output
/// nodes.
pub fn denormalize(doc: &NormalizedDocument) -> Rc<DenormalizedNode> {
    let mut out: BTreeMap<NodeId, Rc<DenormalizedNode>> = BTreeMap::new();
    for node in doc.iter() {
        out.insert(
            node.id.clone(),
            Rc::new(DenormalizedNode {
                id: node.id.clone(),
                data: node.data.clone(),
                children: RefCell::new(BTreeMap::new()),
                parent: RefCell::new(None),
            }),
        );
    }
    for node in doc.iter() {
        let unfolded = &out[&node.id];
        if let Some(parent_ref) = &node.parent {
            if let Some(parent) = out.get(&parent_ref.parent) {
                *unfolded.parent.borrow_mut() = Some(Rc::downgrade(parent));
            }
        }
        let mut children = unfolded.children.borrow_mut();
        for (field, link) in &node.children {
            let resolved = match link {
                NodeLink::Single(child) => DenormalizedLink::Single(
                    child.as_ref().and_then(|id| out.get(id).cloned()),
                ),
                NodeLink::Array(ids) => DenormalizedLink::Array(
                    ids.iter().filter_map(|id| out.get(id).cloned()).collect(),
                ),
                NodeLink::Set(members) => DenormalizedLink::Set(
                    members
                        .iter()
                        .filter_map(|(key, id)| {
                            out.get(id).cloned().map(|node| (key.clone(), node))
                        })
                        .collect(),
                ),
            };
            children.insert(field.clone(), resolved);
        }
    }
    out[doc.root_id()].clone()
}
