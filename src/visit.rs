use std::collections::{BTreeSet, VecDeque};

use crate::doc::DocRead;
use crate::error::{Error, Result};
use crate::id::{NodeId, TypeName};
use crate::node::Node;

/// Order in which [`visit`] enumerates reachable nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Traversal {
    BreadthFirst,
    DepthFirst,
}

/// Options for [`visit`]. `types_to_traverse` prunes descent, while
/// `types_to_visit` filters which nodes reach the callback; `None` means
/// all types.
#[derive(Clone, Debug)]
pub struct VisitOptions {
    pub traversal: Traversal,
    pub start: Option<NodeId>,
    pub types_to_traverse: Option<BTreeSet<TypeName>>,
    pub types_to_visit: Option<BTreeSet<TypeName>>,
}

impl Default for VisitOptions {
    fn default() -> Self {
        Self {
            traversal: Traversal::BreadthFirst,
            start: None,
            types_to_traverse: None,
            types_to_visit: None,
        }
    }
}

/// Enumerates nodes reachable from the start node (default: the root) in
/// the requested order. A per-call visited set keeps the traversal from
/// re-entering a node even if the child links were to form a cycle.
pub fn visit<D, F>(doc: &D, options: &VisitOptions, mut on_visit: F) -> Result<()>
where
    D: DocRead + ?Sized,
    F: FnMut(&D, &Node),
{
    let start = options
        .start
        .clone()
        .unwrap_or_else(|| doc.root_id().clone());
    if doc.node(&start).is_none() {
        return Err(Error::reference(format!("start node {} is not live", start)));
    }
    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(start);
    while let Some(id) = match options.traversal {
        Traversal::BreadthFirst => queue.pop_front(),
        Traversal::DepthFirst => queue.pop_back(),
    } {
        if !visited.insert(id.clone()) {
            continue;
        }
        let node = match doc.node(&id) {
            Some(node) => node,
            None => continue,
        };
        let ty = node.node_type();
        if options
            .types_to_visit
            .as_ref()
            .map_or(true, |types| types.contains(ty))
        {
            on_visit(doc, node);
        }
        if options
            .types_to_traverse
            .as_ref()
            .map_or(true, |types| types.contains(ty))
        {
            match options.traversal {
                Traversal::BreadthFirst => {
                    for child in node.child_ids() {
                        queue.push_back(child.clone());
                    }
                }
                Traversal::DepthFirst => {
                    let children: Vec<&NodeId> = node.child_ids().collect();
                    for child in children.into_iter().rev() {
                        queue.push_back(child.clone());
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::seeded_doc;

    fn visited_ids(doc: &crate::NormalizedDocument, options: &VisitOptions) -> Vec<String> {
        let mut out = Vec::new();
        visit(doc, options, |_, node| out.push(node.id.canonical())).unwrap();
        out
    }

    #[test]
    fn breadth_first_visits_level_by_level() {
        let doc = seeded_doc();
        let ids = visited_ids(&doc, &VisitOptions::default());
        // children fields iterate in name order: children, members, owner
        assert_eq!(
            ids,
            vec!["Root.1", "Node.n1", "Member.m2", "Member.m1", "Node.n2"]
        );
    }

    #[test]
    fn depth_first_descends_before_siblings() {
        let doc = seeded_doc();
        let ids = visited_ids(
            &doc,
            &VisitOptions {
                traversal: Traversal::DepthFirst,
                ..Default::default()
            },
        );
        assert_eq!(
            ids,
            vec!["Root.1", "Node.n1", "Node.n2", "Member.m2", "Member.m1"]
        );
    }

    #[test]
    fn type_filters_prune_and_select() {
        let doc = seeded_doc();
        let ids = visited_ids(
            &doc,
            &VisitOptions {
                types_to_visit: Some(["Member".to_string()].into_iter().collect()),
                ..Default::default()
            },
        );
        assert_eq!(ids, vec!["Member.m2", "Member.m1"]);

        // pruning Root means nothing below it is reached
        let ids = visited_ids(
            &doc,
            &VisitOptions {
                types_to_traverse: Some(["Node".to_string()].into_iter().collect()),
                ..Default::default()
            },
        );
        assert_eq!(ids, vec!["Root.1"]);
    }

    #[test]
    fn start_element_scopes_the_walk() {
        let doc = seeded_doc();
        let ids = visited_ids(
            &doc,
            &VisitOptions {
                start: Some(crate::NodeId::new("Node", "n1")),
                ..Default::default()
            },
        );
        assert_eq!(ids, vec!["Node.n1", "Node.n2"]);

        let missing = visit(
            &doc,
            &VisitOptions {
                start: Some(crate::NodeId::new("Node", "ghost")),
                ..Default::default()
            },
            |_, _| {},
        );
        assert!(matches!(missing, Err(Error::Reference(_))));
    }
}
