use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::doc::DocRead;
use crate::error::{Error, Result};
use crate::node::NodeLink;

/// Controls how integrity violations are reported. With
/// `throw_on_violation` unset, violations are logged through `tracing`
/// and checking continues, which replay and diagnostic tools rely on.
#[derive(Clone, Copy, Debug)]
pub struct AssertConfig {
    pub throw_on_violation: bool,
}

impl Default for AssertConfig {
    fn default() -> Self {
        Self {
            throw_on_violation: true,
        }
    }
}

impl AssertConfig {
    /// A configuration that logs violations instead of failing.
    pub fn logging() -> Self {
        Self {
            throw_on_violation: false,
        }
    }

    fn report(&self, message: String) -> Result<()> {
        if self.throw_on_violation {
            Err(Error::Integrity(message))
        } else {
            tracing::warn!("{}", message);
            Ok(())
        }
    }
}

/// Verifies the referential invariants of a document: every link resolves
/// to a live node of the right type, parent back-pointers agree with
/// forward links, arrays hold no duplicates, set keys are canonical, and
/// every non-root node is reachable from the root through exactly one
/// child link.
pub fn check_document<D: DocRead + ?Sized>(doc: &D, config: &AssertConfig) -> Result<()> {
    let root_id = doc.root_id().clone();
    if doc.node(&root_id).is_none() {
        return Err(Error::integrity(format!("root {} is not live", root_id)));
    }

    // incoming child-edge count per node
    let mut inbound: BTreeMap<crate::NodeId, usize> = BTreeMap::new();
    let mut ids: Vec<crate::NodeId> = Vec::new();
    {
        let mut queue: VecDeque<crate::NodeId> = VecDeque::new();
        let mut seen: BTreeSet<crate::NodeId> = BTreeSet::new();
        queue.push_back(root_id.clone());
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            ids.push(id.clone());
            if let Some(node) = doc.node(&id) {
                for child in node.child_ids() {
                    *inbound.entry(child.clone()).or_insert(0) += 1;
                    queue.push_back(child.clone());
                }
            }
        }
    }

    for id in &ids {
        let node = match doc.node(id) {
            Some(node) => node,
            None => {
                config.report(format!("referenced node {} is not live", id))?;
                continue;
            }
        };
        if &node.id != id {
            config.report(format!("node {} is stored under id {}", node.id, id))?;
        }
        // parent shape
        match (&node.parent, id == &root_id) {
            (Some(_), true) => {
                config.report(format!("root {} has a parent reference", id))?;
            }
            (None, false) => {
                config.report(format!("non-root node {} has no parent", id))?;
            }
            _ => {}
        }
        // back-pointer agrees with the forward link
        if let Some(parent_ref) = &node.parent {
            match doc.node(&parent_ref.parent) {
                None => {
                    config.report(format!(
                        "parent {} of {} is not live",
                        parent_ref.parent, id
                    ))?;
                }
                Some(parent) => match parent.child_link(&parent_ref.field) {
                    None => {
                        config.report(format!(
                            "parent {} has no link {:?} claimed by {}",
                            parent_ref.parent, parent_ref.field, id
                        ))?;
                    }
                    Some(link) => {
                        let agrees = match (link, parent_ref.index) {
                            (NodeLink::Single(slot), None) => slot.as_ref() == Some(id),
                            (NodeLink::Array(children), Some(index)) => {
                                children.get(index) == Some(id)
                            }
                            (NodeLink::Set(children), None) => {
                                children.get(&id.canonical()) == Some(id)
                            }
                            _ => false,
                        };
                        if !agrees {
                            config.report(format!(
                                "back-pointer of {} disagrees with {}.{}",
                                id, parent_ref.parent, parent_ref.field
                            ))?;
                        }
                    }
                },
            }
        }
        // per-field invariants
        for (field, link) in &node.children {
            check_link(doc, config, id, field, link, true)?;
            let declared = doc.schema().child_kind(node.node_type(), field);
            match declared {
                Ok(kind) if kind == link.kind() => {}
                Ok(kind) => {
                    config.report(format!(
                        "{}.{} holds a {:?} link but is declared {:?}",
                        id,
                        field,
                        link.kind(),
                        kind
                    ))?;
                }
                Err(_) => {
                    config.report(format!("{}.{} is not a declared child field", id, field))?;
                }
            }
        }
        for (field, link) in &node.links {
            check_link(doc, config, id, field, link, false)?;
        }
        // exactly one inbound child edge for non-root nodes
        let edges = inbound.get(id).copied().unwrap_or(0);
        if id == &root_id {
            if edges != 0 {
                config.report(format!("root {} is referenced as a child", id))?;
            }
        } else if edges != 1 {
            config.report(format!(
                "{} is referenced by {} child links, expected 1",
                id, edges
            ))?;
        }
    }

    // id uniqueness is implicit in the keyed store
    Ok(())
}

fn check_link<D: DocRead + ?Sized>(
    doc: &D,
    config: &AssertConfig,
    id: &crate::NodeId,
    field: &str,
    link: &NodeLink,
    child_link: bool,
) -> Result<()> {
    let role = if child_link { "child" } else { "link" };
    // every referenced id resolves to a node of that type
    for target in link.ids() {
        match doc.node(target) {
            None => {
                config.report(format!(
                    "{} {} of {}.{} is not live",
                    role, target, id, field
                ))?;
            }
            Some(node) if node.id.node_type() != target.node_type() => {
                config.report(format!(
                    "{} {} of {}.{} resolves to type {:?}",
                    role,
                    target,
                    id,
                    field,
                    node.id.node_type()
                ))?;
            }
            Some(_) => {}
        }
    }
    match link {
        NodeLink::Array(children) => {
            // no duplicates
            let mut seen = BTreeSet::new();
            for child in children {
                if !seen.insert(child) {
                    config.report(format!("{} appears twice in {}.{}", child, id, field))?;
                }
            }
        }
        NodeLink::Set(children) => {
            // keys are canonical
            for (key, child) in children {
                if key != &child.canonical() {
                    config.report(format!(
                        "set key {:?} of {}.{} is not canonical for {}",
                        key, id, field, child
                    ))?;
                }
            }
        }
        NodeLink::Single(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::seeded_doc;

    #[test]
    fn seeded_document_is_sound() {
        let doc = seeded_doc();
        check_document(&doc, &AssertConfig::default()).unwrap();
    }

    #[test]
    fn logging_mode_does_not_fail() {
        let doc = seeded_doc();
        check_document(&doc, &AssertConfig::logging()).unwrap();
    }
}
