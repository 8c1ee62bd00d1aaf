use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::diff::diff;
use crate::doc::{collect_subtree, DocRead, NormalizedDocument};
use crate::error::{Error, Result};
use crate::id::{ElementKey, FieldName, NodeId, TypeName};
use crate::mutable::MutableDocument;
use crate::node::{Node, NodeLink};
use crate::ops::{Command, ElementInfo, Position};
use crate::schema::{LinkKind, ORPHANS_FIELD};
use crate::value::{Fields, Value};

/// Resolution state of a recorded conflict.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Open,
    AutoMerged,
    Resolved,
}

/// Both sides changed one data field away from the base in different
/// ways. `merged_value` is what the merged document carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueConflict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<Value>,
    pub conflict_values: Vec<Value>,
    pub merged_value: Value,
    pub status: ConflictStatus,
}

/// Both sides moved an element into incompatible places; the losing
/// side's subtree was re-identified and kept alongside.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionConflict {
    pub cloned_elements: Vec<NodeId>,
    pub status: ConflictStatus,
}

/// Conflicts recorded for one element.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementConflicts {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info_conflicts: BTreeMap<FieldName, ValueConflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_conflicts: Option<PositionConflict>,
}

/// Conflicts per node type, keyed by the element key within the type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictsMap(pub BTreeMap<TypeName, BTreeMap<String, ElementConflicts>>);

impl ConflictsMap {
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|per_type| per_type.is_empty())
    }

    pub fn get(&self, id: &NodeId) -> Option<&ElementConflicts> {
        self.0.get(id.node_type())?.get(&id.key().to_string())
    }

    fn element_entry(&mut self, id: &NodeId) -> &mut ElementConflicts {
        self.0
            .entry(id.node_type().to_string())
            .or_default()
            .entry(id.key().to_string())
            .or_default()
    }
}

/// Result of [`three_way_merge`].
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub doc: NormalizedDocument,
    pub conflicts: ConflictsMap,
}

/// What to do with an element both sides edited into incompatible
/// versions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncompatibleResolution {
    /// Keep `mine` under its id and re-identify `theirs`' subtree as a
    /// sibling copy.
    CloneTheirs,
    KeepMine,
    KeepTheirs,
}

/// Per-type merge behaviour. Every method has the default the merge
/// algorithm describes; implementations override the ones they care
/// about and are registered per node type in [`MergeOptions`].
pub trait MergeDelegate {
    /// Tie-breaks which side's head to process first when the sibling
    /// sequences diverge. `Less` processes `mine`'s head first.
    fn cmp_siblings(
        &self,
        base: Option<&NodeId>,
        mine: Option<&Node>,
        theirs: Option<&Node>,
    ) -> Ordering {
        match (mine, theirs) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(m), Some(t)) => {
                if let Some(base) = base {
                    // the side matching the base yields to the side that
                    // introduced a new sibling
                    if &m.id == base {
                        return Ordering::Greater;
                    }
                    if &t.id == base {
                        return Ordering::Less;
                    }
                }
                m.id.cmp(&t.id)
            }
        }
    }

    /// Merges the three versions of an element's data, field by field.
    fn merge_data(
        &self,
        base: Option<&Fields>,
        mine: &Fields,
        theirs: &Fields,
    ) -> (Fields, BTreeMap<FieldName, ValueConflict>) {
        let mut merged = Fields::new();
        let mut conflicts = BTreeMap::new();
        let mut fields: BTreeSet<&FieldName> = mine.keys().chain(theirs.keys()).collect();
        if let Some(base) = base {
            fields.extend(base.keys());
        }
        for field in fields {
            let base_value = base.and_then(|base| base.get(field));
            match (mine.get(field), theirs.get(field)) {
                (Some(mv), Some(tv)) => {
                    let (value, conflict) = three_way_value(base_value, mv, tv);
                    merged.insert(field.clone(), value);
                    if let Some(conflict) = conflict {
                        conflicts.insert(field.clone(), conflict);
                    }
                }
                (Some(mv), None) => {
                    merged.insert(field.clone(), mv.clone());
                }
                (None, Some(tv)) => {
                    merged.insert(field.clone(), tv.clone());
                }
                (None, None) => {}
            }
        }
        (merged, conflicts)
    }

    /// Whether both sides' versions of an element can merge into one
    /// copy. The default accepts when the data merge is conflict-free.
    fn are_positions_compatible(
        &self,
        base: Option<&Fields>,
        mine: &Fields,
        theirs: &Fields,
    ) -> bool {
        self.merge_data(base, mine, theirs).1.is_empty()
    }

    /// Whether an element deleted on one side but touched on the other
    /// survives the merge.
    fn keep_deleted_if_touched(&self) -> bool {
        true
    }

    /// Resolution for incompatible element versions.
    fn resolve_incompatible(&self, _mine: &Node, _theirs: &Node) -> IncompatibleResolution {
        IncompatibleResolution::CloneTheirs
    }
}

/// The delegate with every default behaviour.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDelegate;

impl MergeDelegate for DefaultDelegate {}

/// Options for [`three_way_merge`]: per-type delegates plus the default
/// used for unregistered types.
#[derive(Clone)]
pub struct MergeOptions {
    delegates: BTreeMap<TypeName, Arc<dyn MergeDelegate>>,
    default_delegate: Arc<dyn MergeDelegate>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            delegates: BTreeMap::new(),
            default_delegate: Arc::new(DefaultDelegate),
        }
    }
}

impl MergeOptions {
    pub fn with_delegate(
        mut self,
        ty: impl Into<TypeName>,
        delegate: Arc<dyn MergeDelegate>,
    ) -> Self {
        self.delegates.insert(ty.into(), delegate);
        self
    }

    fn delegate_for(&self, ty: &str) -> &dyn MergeDelegate {
        self.delegates
            .get(ty)
            .unwrap_or(&self.default_delegate)
            .as_ref()
    }
}

/// Reconciles two descendants of a common base document into one merged
/// document plus a conflict map. Data fields merge per the three-way
/// value rules; ordered children merge positionally with subtree
/// re-identification where both sides carry incompatible versions;
/// elements deleted on one side survive when the other side touched
/// them.
pub fn three_way_merge(
    base: &NormalizedDocument,
    mine: &NormalizedDocument,
    theirs: &NormalizedDocument,
    options: &MergeOptions,
) -> Result<MergeOutcome> {
    if base.root_id() != mine.root_id() || base.root_id() != theirs.root_id() {
        return Err(Error::constraint(
            "merge inputs do not share a root".to_string(),
        ));
    }
    // the side diffs also validate schemas and integrity
    let mine_edited = edited_set(base, mine)?;
    let theirs_edited = edited_set(base, theirs)?;

    let mut ctx = MergeCtx {
        base,
        mine,
        theirs,
        options,
        merged: mine.edit(),
        conflicts: ConflictsMap::default(),
        mine_edited,
        theirs_edited,
        processed_mine: BTreeSet::new(),
        processed_theirs: BTreeSet::new(),
        cloned: BTreeSet::new(),
        protected: BTreeSet::new(),
    };
    ctx.run()?;

    let MergeCtx {
        merged, conflicts, ..
    } = ctx;
    Ok(MergeOutcome {
        doc: merged.updated_document(),
        conflicts,
    })
}

/// Side of the merge a sequence head was taken from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Ctx {
    Mine,
    Theirs,
    Both,
}

struct MergeCtx<'a> {
    base: &'a NormalizedDocument,
    mine: &'a NormalizedDocument,
    theirs: &'a NormalizedDocument,
    options: &'a MergeOptions,
    merged: MutableDocument,
    conflicts: ConflictsMap,
    mine_edited: BTreeSet<NodeId>,
    theirs_edited: BTreeSet<NodeId>,
    processed_mine: BTreeSet<NodeId>,
    processed_theirs: BTreeSet<NodeId>,
    cloned: BTreeSet<NodeId>,
    protected: BTreeSet<NodeId>,
}

impl<'a> MergeCtx<'a> {
    fn run(&mut self) -> Result<()> {
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        queue.push_back(self.merged.root_id().clone());
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if self.merged.get_node(&id).is_none() || self.protected.contains(&id) {
                continue;
            }
            self.merge_info(&id)?;
            self.merge_children(&id, &mut queue)?;
        }
        self.sweep()?;
        self.prune_dangling_links()?;
        debug_assert!(
            self.merged
                .get_node(self.merged.root_id())
                .and_then(|root| root.child_link(ORPHANS_FIELD))
                .map_or(true, NodeLink::is_empty),
            "merge left orphans behind"
        );
        Ok(())
    }

    fn delegate(&self, ty: &str) -> &dyn MergeDelegate {
        self.options.delegate_for(ty)
    }

    fn em(&self, id: &NodeId) -> bool {
        self.mine_edited.contains(id)
    }

    fn et(&self, id: &NodeId) -> bool {
        self.theirs_edited.contains(id)
    }

    /// Three-way merge of one element's data record.
    fn merge_info(&mut self, id: &NodeId) -> Result<()> {
        let (mine_node, their_node) = match (self.mine.get_node(id), self.theirs.get_node(id)) {
            (Some(m), Some(t)) => (m, t),
            // one-sided elements carry that side's data already
            _ => return Ok(()),
        };
        let base_data = self.base.get_node(id).map(|node| &node.data);
        let delegate = self.delegate(id.node_type());
        let (merged_data, value_conflicts) =
            delegate.merge_data(base_data, &mine_node.data, &their_node.data);
        if !value_conflicts.is_empty() {
            tracing::debug!(element = %id, fields = value_conflicts.len(), "info conflicts");
            self.conflicts
                .element_entry(id)
                .info_conflicts
                .extend(value_conflicts);
        }
        let current = self
            .merged
            .get_node(id)
            .ok_or_else(|| Error::reference(format!("node {} vanished mid-merge", id)))?;
        let mut delta = Fields::new();
        for (field, value) in &merged_data {
            if current.data.get(field) != Some(value) {
                delta.insert(field.clone(), value.clone());
            }
        }
        if !delta.is_empty() {
            self.merged.change_element(id, delta)?;
        }
        Ok(())
    }

    fn merge_children(&mut self, parent: &NodeId, queue: &mut VecDeque<NodeId>) -> Result<()> {
        let ty = match self.merged.get_node(parent) {
            Some(node) => node.node_type().to_string(),
            None => return Ok(()),
        };
        for (field, kind) in self.merged.schema().child_fields(&ty)? {
            if field == ORPHANS_FIELD {
                continue;
            }
            match kind {
                LinkKind::Array => self.merge_array(parent, &field, queue)?,
                LinkKind::Set => self.merge_set(parent, &field, queue)?,
                LinkKind::Single => self.merge_single(parent, &field, queue)?,
            }
        }
        Ok(())
    }

    fn side_array(doc: &NormalizedDocument, parent: &NodeId, field: &str) -> Vec<NodeId> {
        doc.get_node(parent)
            .and_then(|node| node.child_link(field))
            .and_then(|link| link.as_array().map(|ids| ids.to_vec()))
            .unwrap_or_default()
    }

    fn side_set(doc: &NormalizedDocument, parent: &NodeId, field: &str) -> BTreeSet<NodeId> {
        doc.get_node(parent)
            .and_then(|node| node.child_link(field))
            .map(|link| link.ids().cloned().collect())
            .unwrap_or_default()
    }

    fn side_single(doc: &NormalizedDocument, parent: &NodeId, field: &str) -> Option<NodeId> {
        doc.get_node(parent)
            .and_then(|node| node.child_link(field))
            .and_then(|link| link.as_single().cloned())
            .flatten()
    }

    fn merged_single(doc: &MutableDocument, parent: &NodeId, field: &str) -> Option<NodeId> {
        doc.get_node(parent)
            .and_then(|node| node.child_link(field))
            .and_then(|link| link.as_single().cloned())
            .flatten()
    }

    fn merge_array(
        &mut self,
        parent: &NodeId,
        field: &str,
        queue: &mut VecDeque<NodeId>,
    ) -> Result<()> {
        let base_ids = Self::side_array(self.base, parent, field);
        let mine_ids = Self::side_array(self.mine, parent, field);
        let theirs_ids = Self::side_array(self.theirs, parent, field);
        let delegate_ty = parent.node_type().to_string();

        let mut index = 0usize;
        let mut li = 0usize;
        let mut ri = 0usize;
        loop {
            while li < mine_ids.len() && self.processed_mine.contains(&mine_ids[li]) {
                li += 1;
            }
            while ri < theirs_ids.len() && self.processed_theirs.contains(&theirs_ids[ri]) {
                ri += 1;
            }
            let lc = mine_ids.get(li).cloned();
            let rc = theirs_ids.get(ri).cloned();
            let (child, ctx) = match (lc, rc) {
                (None, None) => break,
                (Some(l), Some(r)) if l == r => (l, Ctx::Both),
                (Some(l), Some(r)) => {
                    let base_head = base_ids
                        .iter()
                        .find(|id| {
                            !self.processed_mine.contains(*id)
                                && !self.processed_theirs.contains(*id)
                        })
                        .cloned();
                    let ord = self.delegate(&delegate_ty).cmp_siblings(
                        base_head.as_ref(),
                        self.mine.get_node(&l),
                        self.theirs.get_node(&r),
                    );
                    if ord == Ordering::Greater {
                        (r, Ctx::Theirs)
                    } else {
                        (l, Ctx::Mine)
                    }
                }
                (Some(l), None) => (l, Ctx::Mine),
                (None, Some(r)) => (r, Ctx::Theirs),
            };
            index += self.place_array_child(&child, ctx, parent, field, index, queue)?;
        }
        Ok(())
    }

    /// Applies the position-merge rules to one array child. Returns how
    /// many merged slots were consumed.
    fn place_array_child(
        &mut self,
        child: &NodeId,
        ctx: Ctx,
        parent: &NodeId,
        field: &str,
        index: usize,
        queue: &mut VecDeque<NodeId>,
    ) -> Result<usize> {
        let in_mine = self.mine.contains(child);
        let in_theirs = self.theirs.contains(child);
        let in_base = self.base.contains(child);
        let em = self.em(child);
        let et = self.et(child);

        if in_mine && in_theirs {
            if em && et {
                if self.cloned.contains(child) {
                    // the losing copy was already re-identified elsewhere
                    self.place(child, parent, field, index)?;
                    self.mark(child, Ctx::Mine);
                    queue.push_back(child.clone());
                    return Ok(1);
                }
                let compatible = {
                    let delegate = self.delegate(child.node_type());
                    let base_data = self.base.get_node(child).map(|node| &node.data);
                    let mine_data = &self.mine.get_node(child).expect("in mine").data;
                    let their_data = &self.theirs.get_node(child).expect("in theirs").data;
                    delegate.are_positions_compatible(base_data, mine_data, their_data)
                };
                if compatible {
                    self.place(child, parent, field, index)?;
                    self.mark(child, Ctx::Both);
                    queue.push_back(child.clone());
                    return Ok(1);
                }
                return self.resolve_incompatible_child(child, ctx, parent, field, index, queue);
            }
            if em != et {
                // the edited side's position wins
                let edited_ctx = if em { Ctx::Mine } else { Ctx::Theirs };
                if ctx == Ctx::Both || ctx == edited_ctx {
                    self.place(child, parent, field, index)?;
                    self.mark(child, Ctx::Both);
                    queue.push_back(child.clone());
                    return Ok(1);
                }
                self.mark(child, ctx);
                return Ok(0);
            }
            // untouched on both sides: keep it once
            self.place(child, parent, field, index)?;
            self.mark(child, Ctx::Both);
            queue.push_back(child.clone());
            return Ok(1);
        }

        let present_ctx = if in_mine { Ctx::Mine } else { Ctx::Theirs };
        if in_base {
            // deleted on the other side
            let touched = if in_mine { em } else { et };
            let keep = touched
                && self
                    .delegate(child.node_type())
                    .keep_deleted_if_touched();
            if keep {
                self.ensure_present(child, parent, field, index)?;
                self.mark(child, present_ctx);
                queue.push_back(child.clone());
                return Ok(1);
            }
            // defer: the sweep removes it unless something protects it
            self.mark(child, present_ctx);
            return Ok(0);
        }
        // added on one side only
        self.ensure_present(child, parent, field, index)?;
        self.mark(child, present_ctx);
        queue.push_back(child.clone());
        Ok(1)
    }

    fn resolve_incompatible_child(
        &mut self,
        child: &NodeId,
        ctx: Ctx,
        parent: &NodeId,
        field: &str,
        index: usize,
        queue: &mut VecDeque<NodeId>,
    ) -> Result<usize> {
        let resolution = {
            let mine_node = self.mine.get_node(child).expect("in mine");
            let their_node = self.theirs.get_node(child).expect("in theirs");
            self.delegate(child.node_type())
                .resolve_incompatible(mine_node, their_node)
        };
        match resolution {
            IncompatibleResolution::KeepMine => {
                self.place(child, parent, field, index)?;
                self.mark(child, Ctx::Both);
                self.conflicts.element_entry(child).position_conflicts =
                    Some(PositionConflict {
                        cloned_elements: Vec::new(),
                        status: ConflictStatus::AutoMerged,
                    });
                queue.push_back(child.clone());
                Ok(1)
            }
            IncompatibleResolution::KeepTheirs => {
                self.place(child, parent, field, index)?;
                let their_data = self.theirs.get_node(child).expect("in theirs").data.clone();
                self.merged.change_element(child, their_data)?;
                self.mark(child, Ctx::Both);
                self.conflicts.element_entry(child).position_conflicts =
                    Some(PositionConflict {
                        cloned_elements: Vec::new(),
                        status: ConflictStatus::AutoMerged,
                    });
                queue.push_back(child.clone());
                Ok(1)
            }
            IncompatibleResolution::CloneTheirs => match ctx {
                Ctx::Both => {
                    self.place(child, parent, field, index)?;
                    let clone = self.insert_clone(child, parent, field, index + 1)?;
                    self.record_clone(child, clone);
                    self.mark(child, Ctx::Both);
                    queue.push_back(child.clone());
                    Ok(2)
                }
                Ctx::Mine => {
                    self.place(child, parent, field, index)?;
                    self.mark(child, Ctx::Mine);
                    queue.push_back(child.clone());
                    let their_parent = self
                        .theirs
                        .get_node(child)
                        .and_then(|node| node.parent.clone());
                    if let Some(their_pr) = their_parent {
                        if their_pr.parent == *parent && their_pr.field == field {
                            let clone = self.insert_clone(child, parent, field, index + 1)?;
                            self.record_clone(child, clone);
                            self.mark(child, Ctx::Theirs);
                            return Ok(2);
                        }
                        if self.merged.get_node(&their_pr.parent).is_some() {
                            let position = self.their_position(child, &their_pr)?;
                            let clone =
                                self.insert_clone_at(child, &their_pr.parent, position)?;
                            self.record_clone(child, clone);
                            self.mark(child, Ctx::Theirs);
                        }
                        // otherwise theirs' context completes the clone
                    }
                    Ok(1)
                }
                Ctx::Theirs => {
                    let clone =
                        self.insert_clone_at(child, parent, Position::array(field, index))?;
                    self.record_clone(child, clone);
                    self.mark(child, Ctx::Theirs);
                    Ok(1)
                }
            },
        }
    }

    fn their_position(&self, child: &NodeId, pr: &crate::node::ParentRef) -> Result<Position> {
        let kind = self
            .theirs
            .schema()
            .child_kind(pr.parent.node_type(), &pr.field)?;
        Ok(match kind {
            LinkKind::Single => Position::single(pr.field.clone()),
            LinkKind::Array => Position::array(pr.field.clone(), pr.index.unwrap_or(0)),
            LinkKind::Set => Position::set(pr.field.clone(), child.clone()),
        })
    }

    fn record_clone(&mut self, original: &NodeId, clone: NodeId) {
        tracing::debug!(element = %original, clone = %clone, "re-identified incompatible subtree");
        self.cloned.insert(original.clone());
        self.conflicts.element_entry(original).position_conflicts = Some(PositionConflict {
            cloned_elements: vec![clone],
            status: ConflictStatus::AutoMerged,
        });
    }

    fn merge_set(
        &mut self,
        parent: &NodeId,
        field: &str,
        queue: &mut VecDeque<NodeId>,
    ) -> Result<()> {
        let base_members = Self::side_set(self.base, parent, field);
        let mine_members = Self::side_set(self.mine, parent, field);
        let theirs_members = Self::side_set(self.theirs, parent, field);
        let union: BTreeSet<NodeId> = mine_members
            .iter()
            .chain(theirs_members.iter())
            .cloned()
            .collect();
        for member in union {
            let in_m = mine_members.contains(&member);
            let in_t = theirs_members.contains(&member);
            let in_b = base_members.contains(&member);
            if in_m && in_t {
                self.mark(&member, Ctx::Both);
                queue.push_back(member);
                continue;
            }
            if in_m {
                if !in_b {
                    // added by mine; already a member
                    self.mark(&member, Ctx::Mine);
                    queue.push_back(member);
                    continue;
                }
                // removed on theirs
                if self.theirs.contains(&member) {
                    // moved elsewhere on theirs; that context claims it
                    continue;
                }
                if self.em(&member)
                    && self.delegate(member.node_type()).keep_deleted_if_touched()
                {
                    self.mark(&member, Ctx::Mine);
                    queue.push_back(member);
                }
                // otherwise the sweep removes it
                continue;
            }
            // theirs-only membership
            let keep = !in_b
                || (self.et(&member)
                    && self.delegate(member.node_type()).keep_deleted_if_touched());
            if !keep {
                continue;
            }
            if self.processed_mine.contains(&member) {
                continue; // mine's context already fixed its position
            }
            self.ensure_present(&member, parent, field, 0)?;
            self.mark(&member, Ctx::Both);
            queue.push_back(member);
        }
        Ok(())
    }

    fn merge_single(
        &mut self,
        parent: &NodeId,
        field: &str,
        queue: &mut VecDeque<NodeId>,
    ) -> Result<()> {
        let sb = Self::side_single(self.base, parent, field);
        let sm = Self::side_single(self.mine, parent, field);
        let st = Self::side_single(self.theirs, parent, field);

        if sm == st {
            if let Some(child) = sm {
                self.mark(&child, Ctx::Both);
                queue.push_back(child);
            }
            return Ok(());
        }
        if sb == sm {
            // theirs replaced or cleared the slot
            if let Some(current) = &sm {
                if self.em(current) {
                    // touched on mine: treat as contested, keep mine's
                    self.mark(current, Ctx::Mine);
                    queue.push_back(current.clone());
                    return Ok(());
                }
            }
            if let Some(next) = st {
                // vacate whatever still sits in the merged slot
                let occupant = Self::merged_single(&self.merged, parent, field);
                if occupant.as_ref() != Some(&next) {
                    if let Some(occupant) = occupant {
                        self.evacuate(&occupant)?;
                    }
                    self.ensure_single(&next, parent, field)?;
                }
                self.mark(&next, Ctx::Both);
                queue.push_back(next);
            }
            // a cleared slot empties when the sweep removes the child
            return Ok(());
        }
        if sb == st {
            // mine replaced, theirs untouched: keep mine's
            if let Some(child) = sm {
                self.mark(&child, Ctx::Mine);
                queue.push_back(child);
            }
            return Ok(());
        }
        // both replaced differently: keep mine's
        tracing::debug!(parent = %parent, field, "contested single slot, keeping mine");
        if let Some(child) = sm {
            self.mark(&child, Ctx::Mine);
            queue.push_back(child);
        }
        Ok(())
    }

    /// Moves a child to its merged slot, pulling it from wherever the
    /// merged tree currently holds it.
    fn place(&mut self, child: &NodeId, parent: &NodeId, field: &str, index: usize) -> Result<()> {
        self.merged.move_element(
            child,
            parent,
            Position::array(field.to_string(), index),
            None,
        )
    }

    /// Brings a one-sided element into the merged tree at the given
    /// location, inserting it shallowly from `theirs` when it is not
    /// present.
    fn ensure_present(
        &mut self,
        child: &NodeId,
        parent: &NodeId,
        field: &str,
        index: usize,
    ) -> Result<()> {
        let position = match self
            .merged
            .schema()
            .child_kind(parent.node_type(), field)?
        {
            LinkKind::Array => Position::array(field.to_string(), index),
            LinkKind::Set => Position::set(field.to_string(), child.clone()),
            LinkKind::Single => Position::single(field.to_string()),
        };
        if self.merged.get_node(child).is_some() {
            return self.merged.move_element(child, parent, position, None);
        }
        let node = self
            .theirs
            .get_node(child)
            .ok_or_else(|| Error::reference(format!("node {} is on neither side", child)))?;
        self.merged.insert_element(
            parent,
            position,
            ElementInfo {
                node_type: child.node_type().to_string(),
                key: Some(child.key().clone()),
                data: node.data.clone(),
            },
        )?;
        if !node.links.is_empty() {
            self.merged.set_links(child, node.links.clone())?;
        }
        Ok(())
    }

    fn ensure_single(&mut self, child: &NodeId, parent: &NodeId, field: &str) -> Result<()> {
        if self.merged.get_node(child).is_some() {
            return self
                .merged
                .move_element(child, parent, Position::single(field.to_string()), None);
        }
        let node = self
            .theirs
            .get_node(child)
            .ok_or_else(|| Error::reference(format!("node {} is on neither side", child)))?;
        self.merged.insert_element(
            parent,
            Position::single(field.to_string()),
            ElementInfo {
                node_type: child.node_type().to_string(),
                key: Some(child.key().clone()),
                data: node.data.clone(),
            },
        )?;
        Ok(())
    }

    /// Inserts a re-identified copy of `theirs`' subtree of `original`
    /// as an array child.
    fn insert_clone(
        &mut self,
        original: &NodeId,
        parent: &NodeId,
        field: &str,
        index: usize,
    ) -> Result<NodeId> {
        self.insert_clone_at(original, parent, Position::array(field.to_string(), index))
    }

    fn insert_clone_at(
        &mut self,
        original: &NodeId,
        parent: &NodeId,
        position: Position,
    ) -> Result<NodeId> {
        let subtree = collect_subtree(self.theirs, original);
        let mapping: BTreeMap<NodeId, NodeId> = subtree
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    NodeId::new(id.node_type(), ElementKey::generate()),
                )
            })
            .collect();
        for old in &subtree {
            let node = self
                .theirs
                .get_node(old)
                .ok_or_else(|| Error::reference(format!("node {} vanished mid-clone", old)))?;
            let (target_parent, target_position) = if old == original {
                (parent.clone(), position.clone())
            } else {
                let pr = node.parent.as_ref().ok_or_else(|| {
                    Error::integrity(format!("subtree node {} has no parent", old))
                })?;
                let mapped_parent = mapping[&pr.parent].clone();
                let kind = self
                    .theirs
                    .schema()
                    .child_kind(pr.parent.node_type(), &pr.field)?;
                let target_position = match kind {
                    LinkKind::Single => Position::single(pr.field.clone()),
                    LinkKind::Array => Position::array(pr.field.clone(), pr.index.unwrap_or(0)),
                    LinkKind::Set => Position::set(pr.field.clone(), mapping[old].clone()),
                };
                (mapped_parent, target_position)
            };
            let new_id = mapping[old].clone();
            self.merged.insert_element(
                target_parent,
                target_position,
                ElementInfo {
                    node_type: new_id.node_type().to_string(),
                    key: Some(new_id.key().clone()),
                    data: node.data.clone(),
                },
            )?;
            self.protected.insert(new_id);
        }
        // rewrite informal links through the mapping
        for old in &subtree {
            let node = self.theirs.get_node(old).expect("cloned above");
            if node.links.is_empty() {
                continue;
            }
            let mut links = node.links.clone();
            for link in links.values_mut() {
                remap_link(link, &mapping);
            }
            self.merged.set_links(&mapping[old], links)?;
        }
        Ok(mapping[original].clone())
    }

    fn mark(&mut self, id: &NodeId, ctx: Ctx) {
        match ctx {
            Ctx::Mine => {
                self.processed_mine.insert(id.clone());
            }
            Ctx::Theirs => {
                self.processed_theirs.insert(id.clone());
            }
            Ctx::Both => {
                self.processed_mine.insert(id.clone());
                self.processed_theirs.insert(id.clone());
            }
        }
    }

    fn evacuate(&mut self, id: &NodeId) -> Result<()> {
        let root = self.merged.root_id().clone();
        let len = self
            .merged
            .get_node(&root)
            .and_then(|node| node.child_link(ORPHANS_FIELD))
            .map_or(0, NodeLink::len);
        self.merged
            .move_element(id, &root, Position::array(ORPHANS_FIELD, len), None)
    }

    /// Removes elements absent on one side that no side protects, deepest
    /// first.
    fn sweep(&mut self) -> Result<()> {
        let mut order: Vec<NodeId> = Vec::new();
        post_order_of(&self.merged, self.merged.root_id().clone(), &mut order);
        let root = self.merged.root_id().clone();
        for id in order {
            if id == root || self.protected.contains(&id) {
                continue;
            }
            if self.merged.get_node(&id).is_none() {
                continue;
            }
            let in_m = self.mine.contains(&id);
            let in_t = self.theirs.contains(&id);
            if in_m && in_t {
                continue;
            }
            // an edit on the surviving side blocks the deletion, unless
            // the type's delegate says deletions win
            let kept = self.delegate(id.node_type()).keep_deleted_if_touched()
                && ((in_m && self.em(&id)) || (in_t && self.et(&id)));
            if kept {
                continue;
            }
            let subtree = collect_subtree(&self.merged, &id);
            let has_keeper = subtree.iter().any(|descendant| {
                descendant != &id
                    && (self.protected.contains(descendant)
                        || (self.mine.contains(descendant) && self.theirs.contains(descendant))
                        || (self
                            .delegate(descendant.node_type())
                            .keep_deleted_if_touched()
                            && ((self.mine.contains(descendant) && self.em(descendant))
                                || (self.theirs.contains(descendant) && self.et(descendant)))))
            });
            if has_keeper {
                tracing::debug!(element = %id, "sweep skipped: live descendants remain");
                continue;
            }
            self.merged.delete_element(&id)?;
        }
        Ok(())
    }

    /// Drops informal link targets that did not survive the merge.
    fn prune_dangling_links(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self
            .merged
            .iter()
            .filter(|node| !node.links.is_empty())
            .map(|node| node.id.clone())
            .collect();
        for id in ids {
            let node = match self.merged.get_node(&id) {
                Some(node) => node,
                None => continue,
            };
            let mut links = node.links.clone();
            let mut changed = false;
            for link in links.values_mut() {
                changed |= prune_link(link, &self.merged);
            }
            if changed {
                self.merged.set_links(&id, links)?;
            }
        }
        Ok(())
    }
}

fn remap_link(link: &mut NodeLink, mapping: &BTreeMap<NodeId, NodeId>) {
    let map_id = |id: &NodeId| mapping.get(id).cloned().unwrap_or_else(|| id.clone());
    match link {
        NodeLink::Single(slot) => {
            if let Some(id) = slot {
                *id = map_id(id);
            }
        }
        NodeLink::Array(ids) => {
            for id in ids {
                *id = map_id(id);
            }
        }
        NodeLink::Set(members) => {
            *members = members
                .values()
                .map(|id| {
                    let id = map_id(id);
                    (id.canonical(), id)
                })
                .collect();
        }
    }
}

fn prune_link(link: &mut NodeLink, merged: &MutableDocument) -> bool {
    match link {
        NodeLink::Single(slot) => {
            if slot.as_ref().is_some_and(|id| merged.get_node(id).is_none()) {
                *slot = None;
                return true;
            }
            false
        }
        NodeLink::Array(ids) => {
            let before = ids.len();
            ids.retain(|id| merged.get_node(id).is_some());
            ids.len() != before
        }
        NodeLink::Set(members) => {
            let before = members.len();
            members.retain(|_, id| merged.get_node(id).is_some());
            members.len() != before
        }
    }
}

fn post_order_of(doc: &MutableDocument, from: NodeId, out: &mut Vec<NodeId>) {
    if let Some(node) = doc.get_node(&from) {
        let children: Vec<NodeId> = node.child_ids().cloned().collect();
        for child in children {
            post_order_of(doc, child, out);
        }
    }
    out.push(from);
}

/// Nodes whose subtree path was edited on a side relative to the base:
/// each changed element plus all of its ancestors.
fn edited_set(base: &NormalizedDocument, side: &NormalizedDocument) -> Result<BTreeSet<NodeId>> {
    let commands = diff(base, side)?;
    let mut edited = BTreeSet::new();
    for command in &commands {
        let seed = match command {
            Command::Delete { element } => nearest_live_ancestor(base, side, element),
            other => Some(other.element().clone()),
        };
        let mut current = match seed {
            Some(seed) => seed,
            None => continue,
        };
        loop {
            let node = match side.get_node(&current) {
                Some(node) => node,
                None => break,
            };
            if !edited.insert(current.clone()) {
                break;
            }
            match &node.parent {
                Some(parent_ref) => current = parent_ref.parent.clone(),
                None => break,
            }
        }
    }
    Ok(edited)
}

/// The closest base-side ancestor of a deleted element that still exists
/// on the edited side.
fn nearest_live_ancestor(
    base: &NormalizedDocument,
    side: &NormalizedDocument,
    element: &NodeId,
) -> Option<NodeId> {
    let mut current = element.clone();
    loop {
        let node = base.get_node(&current)?;
        let parent_ref = node.parent.as_ref()?;
        if side.contains(&parent_ref.parent) {
            return Some(parent_ref.parent.clone());
        }
        current = parent_ref.parent.clone();
    }
}

/// The three-way merge of one scalar value.
fn three_way_value(
    base: Option<&Value>,
    mine: &Value,
    theirs: &Value,
) -> (Value, Option<ValueConflict>) {
    if mine == theirs {
        return (mine.clone(), None);
    }
    if base == Some(mine) {
        return (theirs.clone(), None);
    }
    if base == Some(theirs) {
        return (mine.clone(), None);
    }
    // open conflict: resolve deterministically and record it
    let merged = if mine.is_numeric() && theirs.is_numeric() {
        let base_n = base.and_then(Value::as_f64).unwrap_or(0.0);
        let mine_n = mine.as_f64().unwrap_or(0.0);
        let theirs_n = theirs.as_f64().unwrap_or(0.0);
        let mine_dist = (mine_n - base_n).abs();
        let theirs_dist = (theirs_n - base_n).abs();
        if mine_dist > theirs_dist {
            mine.clone()
        } else if theirs_dist > mine_dist {
            theirs.clone()
        } else if mine_n <= theirs_n {
            mine.clone()
        } else {
            theirs.clone()
        }
    } else if let (Value::Str(mine_s), Value::Str(theirs_s)) = (mine, theirs) {
        let base_s = base.and_then(Value::as_str).unwrap_or("");
        Value::Str(merge_strings(base_s, mine_s, theirs_s))
    } else if mine.canonical_json() <= theirs.canonical_json() {
        mine.clone()
    } else {
        theirs.clone()
    };
    let conflict = ValueConflict {
        base_value: base.cloned(),
        conflict_values: vec![mine.clone(), theirs.clone()],
        merged_value: merged.clone(),
        status: ConflictStatus::Open,
    };
    (merged, Some(conflict))
}

/// Character-level three-way merge. Regions where only one side diverged
/// take that side; regions where both diverged resolve to the
/// lexicographically smaller fragment.
fn merge_strings(base: &str, mine: &str, theirs: &str) -> String {
    let cb: Vec<char> = base.chars().collect();
    let cm: Vec<char> = mine.chars().collect();
    let ct: Vec<char> = theirs.chars().collect();

    let mut map_m: Vec<Option<usize>> = vec![None; cb.len()];
    for (bi, mi) in char_lcs(&cb, &cm) {
        map_m[bi] = Some(mi);
    }
    let mut map_t: Vec<Option<usize>> = vec![None; cb.len()];
    for (bi, ti) in char_lcs(&cb, &ct) {
        map_t[bi] = Some(ti);
    }

    let mut out = String::new();
    let (mut pb, mut pm, mut pt) = (0usize, 0usize, 0usize);
    let mut sync_points: Vec<(usize, usize, usize)> = (0..cb.len())
        .filter_map(|bi| match (map_m[bi], map_t[bi]) {
            (Some(mi), Some(ti)) => Some((bi, mi, ti)),
            _ => None,
        })
        .collect();
    sync_points.push((cb.len(), cm.len(), ct.len()));

    for (bi, mi, ti) in sync_points {
        let base_seg: String = cb[pb..bi].iter().collect();
        let mine_seg: String = cm[pm..mi].iter().collect();
        let their_seg: String = ct[pt..ti].iter().collect();
        if mine_seg == their_seg || base_seg == their_seg {
            out.push_str(&mine_seg);
        } else if base_seg == mine_seg {
            out.push_str(&their_seg);
        } else {
            out.push_str(std::cmp::min(&mine_seg, &their_seg));
        }
        if bi < cb.len() {
            out.push(cb[bi]);
            pb = bi + 1;
            pm = mi + 1;
            pt = ti + 1;
        }
    }
    out
}

/// Matched index pairs of a longest common subsequence of two char
/// slices. Falls back to prefix/suffix matching for very large inputs.
fn char_lcs(a: &[char], b: &[char]) -> Vec<(usize, usize)> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    if a.len() * b.len() > 64 * 1024 {
        let prefix = a
            .iter()
            .zip(b.iter())
            .take_while(|(x, y)| x == y)
            .count();
        let max_suffix = a.len().min(b.len()) - prefix;
        let suffix = a
            .iter()
            .rev()
            .zip(b.iter().rev())
            .take_while(|(x, y)| x == y)
            .count()
            .min(max_suffix);
        let mut out: Vec<(usize, usize)> = (0..prefix).map(|i| (i, i)).collect();
        out.extend((0..suffix).map(|k| (a.len() - suffix + k, b.len() - suffix + k)));
        return out;
    }
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut out = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}
