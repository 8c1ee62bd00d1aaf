//! # Normalized hierarchical documents
//!
//! This crate implements a typed, schema-driven document tree held in
//! normalized form: every node lives in a flat map keyed by its
//! `(type, key)` identifier, parents refer to children by id through
//! link fields of three kinds (`Single`, `Array`, `Set`), and each
//! non-root node carries one parent back-pointer, so the child links
//! form a spanning tree over the node map.
//!
//! ## Documents and editing
//! A [`NormalizedDocument`] is immutable. Edits go through a
//! [`MutableDocument`] session, which applies a closed set of four
//! primitive commands (insert, change, move, delete) over a lazy
//! copy-on-write store and records each command in a log. The log is
//! path-independent: replaying it through
//! [`MutableDocument::apply_changes`] on any equal-shaped document
//! reproduces the same result, which is what the diff and history
//! layers build on. A session that changed nothing hands back the
//! original document.
//!
//! ## Diff
//! [`diff`] computes a replayable command sequence turning one document
//! version into another; ordered children are reconciled through an
//! LCS-based array edit script ([`diff_array`] / [`apply_array_diff`]).
//! Nodes in transit between two slots are staged through the root's
//! `__orphans` array, which is empty in every settled document.
//!
//! ## Merge
//! [`three_way_merge`] reconciles two descendants of a common base:
//! data fields merge per three-way value rules (numbers by distance
//! from base, strings character-wise), ordered siblings merge
//! positionally, deletions are blocked by edits on the other side, and
//! incompatibly moved subtrees are re-identified so both versions
//! survive, with every decision recorded in a [`ConflictsMap`].
//! Behaviour is overridable per node type through [`MergeDelegate`].
//!
//! ## History
//! [`History`] keeps a commit list with SHA-512 commit ids, periodic
//! checkpoints for bounded reconstruction, undo/redo with stack
//! semantics, branching, and delta-based reconciliation against remote
//! histories ([`History::merge_delta`],
//! [`pull_origin_changes_into_local_history`]).
//!
//! The crate is synchronous and deterministic: no I/O, no shared
//! mutable state. Documents are freely shareable across threads once
//! constructed; sessions and histories belong to one owner at a time.

mod denormalize;
mod diff;
mod doc;
mod error;
mod history;
mod id;
mod integrity;
mod lcs;
mod merge;
mod mutable;
mod node;
mod ops;
mod path;
#[cfg(test)]
mod props;
mod schema;
mod store;
mod value;
mod visit;

pub use crate::denormalize::{denormalize, DenormalizedLink, DenormalizedNode};
pub use crate::diff::diff;
pub use crate::doc::{DocRead, DocSnapshot, NormalizedDocument};
pub use crate::error::{Error, Result};
pub use crate::history::{
    pull_origin_changes_into_local_history, CheckpointTranslator, CommandInterpreter, History,
    HistoryDelta, HistoryOptions, HistoryRecord, MergeDeltaOutcome, MergeFn,
    OperationInterpreter, RecordKind, SnapshotTranslator,
};
pub use crate::id::{ElementKey, FieldName, NodeId, TypeName};
pub use crate::integrity::{check_document, AssertConfig};
pub use crate::lcs::{apply_array_diff, diff_array, ArrayChange, ArrayDiff, ElementChange};
pub use crate::merge::{
    three_way_merge, ConflictStatus, ConflictsMap, DefaultDelegate, ElementConflicts,
    IncompatibleResolution, MergeDelegate, MergeOptions, MergeOutcome, PositionConflict,
    ValueConflict,
};
pub use crate::mutable::MutableDocument;
pub use crate::node::{Node, NodeLink, ParentRef};
pub use crate::ops::{Command, ElementInfo, Position, Target};
pub use crate::path::{Path, PathBuf, PathElement};
pub use crate::schema::{LinkKind, NodeTypeDef, Schema, ORPHANS_FIELD};
pub use crate::store::{CowDelta, CowMap};
pub use crate::value::{Fields, Value, ValueKind};
pub use crate::visit::{visit, Traversal, VisitOptions};
