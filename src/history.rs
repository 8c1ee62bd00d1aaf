use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::diff::diff;
use crate::doc::NormalizedDocument;
use crate::error::{Error, Result};
use crate::merge::{three_way_merge, ConflictsMap, MergeOptions, MergeOutcome};
use crate::mutable::MutableDocument;
use crate::ops::Command;
use crate::schema::Schema;

/// What a history record did, with its kind-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RecordKind {
    /// A caller-level operation interpreted into primitive commands.
    Operation { operation: serde_json::Value },
    /// Reverted the tree to the state at `undone_to_commit_id`.
    Undo { undone_to_commit_id: String },
    /// Cancelled the undo at `undo_commit_id`, restoring
    /// `reverse_to_commit_id`.
    Redo {
        undo_commit_id: String,
        reverse_to_commit_id: String,
    },
    /// Reconciled a remote delta through a three-way merge.
    Merge {
        base_commit_id: String,
        their_operations: Vec<HistoryRecord>,
    },
}

/// One commit of a document history. `commit_id` is the SHA-512 of the
/// record's canonical serialization with the id itself omitted and
/// checkpoints elided.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub commit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_commit_id: Option<String>,
    pub kind: RecordKind,
    pub changes: Vec<Command>,
    pub user_id: String,
    pub when: DateTime<Utc>,
    /// A full document snapshot in the translator's format, present on
    /// the first record and every checkpoint interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,
}

/// An inclusive slice of history records following `from_commit_id`,
/// shippable over any caller transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryDelta {
    pub from_commit_id: String,
    pub records: Vec<HistoryRecord>,
}

/// How [`History::merge_delta`] reconciled a delta.
#[derive(Clone, Debug)]
pub enum MergeDeltaOutcome {
    /// The delta continued the local head and was appended verbatim.
    FastForwarded,
    /// The delta's anchor is unknown here; nothing changed.
    Unknown,
    /// Divergent streams were reconciled through a three-way merge.
    Merged { conflicts: ConflictsMap },
}

/// Interprets a caller-defined operation as primitive commands against a
/// mutable document.
pub trait OperationInterpreter {
    fn interpret(&self, doc: &mut MutableDocument, operation: &serde_json::Value) -> Result<()>;
}

/// The built-in interpreter: the operation payload is a serialized
/// command list.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandInterpreter;

impl OperationInterpreter for CommandInterpreter {
    fn interpret(&self, doc: &mut MutableDocument, operation: &serde_json::Value) -> Result<()> {
        let commands: Vec<Command> = serde_json::from_value(operation.clone())
            .map_err(|err| Error::constraint(format!("undecodable operation: {}", err)))?;
        doc.apply_changes(&commands)
    }
}

/// Serializes checkpoints to and from the stored representation, letting
/// callers store them compressed or re-encoded.
pub trait CheckpointTranslator {
    fn to_checkpoint(&self, doc: &NormalizedDocument) -> Result<serde_json::Value>;
    fn from_checkpoint(
        &self,
        schema: &Arc<Schema>,
        checkpoint: &serde_json::Value,
    ) -> Result<NormalizedDocument>;
}

/// The identity translator over the document snapshot form.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotTranslator;

impl CheckpointTranslator for SnapshotTranslator {
    fn to_checkpoint(&self, doc: &NormalizedDocument) -> Result<serde_json::Value> {
        serde_json::to_value(doc.to_snapshot())
            .map_err(|err| Error::constraint(format!("unserializable checkpoint: {}", err)))
    }

    fn from_checkpoint(
        &self,
        schema: &Arc<Schema>,
        checkpoint: &serde_json::Value,
    ) -> Result<NormalizedDocument> {
        let snapshot = serde_json::from_value(checkpoint.clone())
            .map_err(|err| Error::integrity(format!("undecodable checkpoint: {}", err)))?;
        NormalizedDocument::from_snapshot(Arc::clone(schema), snapshot)
    }
}

/// Pluggable three-way merge used by [`History::merge_delta`].
pub type MergeFn = Arc<
    dyn Fn(
        &NormalizedDocument,
        &NormalizedDocument,
        &NormalizedDocument,
    ) -> Result<MergeOutcome>,
>;

/// Configuration of a history: checkpoint cadence and the injected
/// interpreter, translator and merge function.
#[derive(Clone)]
pub struct HistoryOptions {
    pub checkpoint_interval: usize,
    pub interpreter: Arc<dyn OperationInterpreter>,
    pub translator: Arc<dyn CheckpointTranslator>,
    pub merge_fn: MergeFn,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: 20,
            interpreter: Arc::new(CommandInterpreter),
            translator: Arc::new(SnapshotTranslator),
            merge_fn: Arc::new(|base, mine, theirs| {
                three_way_merge(base, mine, theirs, &MergeOptions::default())
            }),
        }
    }
}

/// A linear commit list over one document, with periodic checkpoints for
/// bounded reconstruction, undo/redo, branching and delta-based
/// push/pull reconciliation.
#[derive(Clone)]
pub struct History {
    schema: Arc<Schema>,
    records: Vec<HistoryRecord>,
    index: BTreeMap<String, usize>,
    merged_commit_ids: BTreeSet<String>,
    options: HistoryOptions,
}

impl History {
    /// Starts a history whose first record checkpoints the seed
    /// document.
    pub fn new(
        doc: &NormalizedDocument,
        user_id: impl Into<String>,
        options: HistoryOptions,
    ) -> Result<Self> {
        let checkpoint = options.translator.to_checkpoint(doc)?;
        let mut seed = HistoryRecord {
            commit_id: String::new(),
            previous_commit_id: None,
            kind: RecordKind::Operation {
                operation: serde_json::Value::Null,
            },
            changes: Vec::new(),
            user_id: user_id.into(),
            when: Utc::now(),
            checkpoint: Some(checkpoint),
        };
        seed.commit_id = commit_hash(&seed)?;
        let mut history = Self {
            schema: Arc::clone(doc.schema_arc()),
            records: Vec::new(),
            index: BTreeMap::new(),
            merged_commit_ids: BTreeSet::new(),
            options,
        };
        history.push_record(seed);
        Ok(history)
    }

    /// Rebuilds a history from previously stored records.
    pub fn from_records(
        schema: Arc<Schema>,
        records: Vec<HistoryRecord>,
        options: HistoryOptions,
    ) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| Error::range("empty record list".to_string()))?;
        if first.checkpoint.is_none() {
            return Err(Error::integrity(
                "the first record carries no checkpoint".to_string(),
            ));
        }
        let mut history = Self {
            schema,
            records: Vec::new(),
            index: BTreeMap::new(),
            merged_commit_ids: BTreeSet::new(),
            options,
        };
        for record in records {
            if let Some(previous) = &record.previous_commit_id {
                if !history.index.contains_key(previous) {
                    return Err(Error::integrity(format!(
                        "record {} references unknown predecessor {}",
                        record.commit_id, previous
                    )));
                }
            }
            history.push_record(record);
        }
        Ok(history)
    }

    fn push_record(&mut self, record: HistoryRecord) {
        self.index.insert(record.commit_id.clone(), self.records.len());
        self.records.push(record);
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn schema_arc(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Commit ids merged in from remote deltas, nested merges included.
    pub fn merged_commit_ids(&self) -> &BTreeSet<String> {
        &self.merged_commit_ids
    }

    pub fn last_commit_id(&self) -> &str {
        // the constructor guarantees at least the seed record
        &self.records.last().expect("seed record").commit_id
    }

    pub fn has_commit_id(&self, commit_id: &str) -> bool {
        self.index.contains_key(commit_id)
    }

    pub fn next_commit_id_of(&self, commit_id: &str) -> Option<&str> {
        let idx = *self.index.get(commit_id)?;
        self.records.get(idx + 1).map(|record| record.commit_id.as_str())
    }

    pub fn prev_commit_id_of(&self, commit_id: &str) -> Option<&str> {
        let idx = *self.index.get(commit_id)?;
        self.records[idx].previous_commit_id.as_deref()
    }

    fn index_of(&self, commit_id: &str) -> Result<usize> {
        self.index
            .get(commit_id)
            .copied()
            .ok_or_else(|| Error::range(format!("unknown commit {}", commit_id)))
    }

    /// Materializes the document at a commit (default: the head) from
    /// the closest prior checkpoint plus replay.
    pub fn document_at(&self, commit_id: Option<&str>) -> Result<NormalizedDocument> {
        let at = match commit_id {
            Some(commit_id) => self.index_of(commit_id)?,
            None => self.records.len() - 1,
        };
        let checkpoint_at = (0..=at)
            .rev()
            .find(|idx| self.records[*idx].checkpoint.is_some())
            .ok_or_else(|| {
                Error::integrity(format!(
                    "no checkpoint at or before {}",
                    self.records[at].commit_id
                ))
            })?;
        let checkpoint = self.records[checkpoint_at]
            .checkpoint
            .as_ref()
            .expect("found above");
        let mut doc = self
            .options
            .translator
            .from_checkpoint(&self.schema, checkpoint)?;
        for record in &self.records[checkpoint_at + 1..=at] {
            let mut edit = doc.edit();
            edit.apply_changes(&record.changes)?;
            doc = edit.updated_document();
        }
        Ok(doc)
    }

    /// The document at the head commit.
    pub fn current_document(&self) -> Result<NormalizedDocument> {
        self.document_at(None)
    }

    fn records_since_checkpoint(&self) -> usize {
        self.records
            .iter()
            .rev()
            .take_while(|record| record.checkpoint.is_none())
            .count()
    }

    fn checkpoint_for(&self, doc: &NormalizedDocument) -> Result<Option<serde_json::Value>> {
        if self.records_since_checkpoint() + 1 >= self.options.checkpoint_interval {
            Ok(Some(self.options.translator.to_checkpoint(doc)?))
        } else {
            Ok(None)
        }
    }

    fn append(
        &mut self,
        kind: RecordKind,
        changes: Vec<Command>,
        user_id: String,
        new_doc: &NormalizedDocument,
    ) -> Result<&HistoryRecord> {
        let mut record = HistoryRecord {
            commit_id: String::new(),
            previous_commit_id: Some(self.last_commit_id().to_string()),
            kind,
            changes,
            user_id,
            when: Utc::now(),
            checkpoint: self.checkpoint_for(new_doc)?,
        };
        record.commit_id = commit_hash(&record)?;
        self.push_record(record);
        Ok(self.records.last().expect("just pushed"))
    }

    /// Interprets an operation against the head document and appends the
    /// resulting commit.
    pub fn commit(
        &mut self,
        operation: serde_json::Value,
        user_id: impl Into<String>,
    ) -> Result<&HistoryRecord> {
        let doc = self.current_document()?;
        let mut edit = doc.edit();
        self.options.interpreter.interpret(&mut edit, &operation)?;
        let changes = edit.changes().to_vec();
        let new_doc = edit.updated_document();
        self.append(
            RecordKind::Operation { operation },
            changes,
            user_id.into(),
            &new_doc,
        )
    }

    /// A new history holding the prefix up to `from` (default: all of
    /// it).
    pub fn branch(&self, from: Option<&str>) -> Result<Self> {
        let at = match from {
            Some(commit_id) => self.index_of(commit_id)?,
            None => self.records.len() - 1,
        };
        let mut branched = Self {
            schema: Arc::clone(&self.schema),
            records: Vec::new(),
            index: BTreeMap::new(),
            merged_commit_ids: self.merged_commit_ids.clone(),
            options: self.options.clone(),
        };
        for record in &self.records[..=at] {
            branched.push_record(record.clone());
        }
        Ok(branched)
    }

    /// The records after `from` up to and including `to` (default: the
    /// head).
    pub fn generate_delta(&self, from: &str, to: Option<&str>) -> Result<HistoryDelta> {
        let from_idx = self.index_of(from)?;
        let to_idx = match to {
            Some(commit_id) => self.index_of(commit_id)?,
            None => self.records.len() - 1,
        };
        if to_idx < from_idx {
            return Err(Error::range(format!(
                "delta range is reversed: {} comes after {}",
                from,
                to.unwrap_or_default()
            )));
        }
        Ok(HistoryDelta {
            from_commit_id: from.to_string(),
            records: self.records[from_idx + 1..=to_idx].to_vec(),
        })
    }

    fn track_merged(&mut self, records: &[HistoryRecord]) {
        for record in records {
            self.merged_commit_ids.insert(record.commit_id.clone());
            if let RecordKind::Merge {
                their_operations, ..
            } = &record.kind
            {
                let nested = their_operations.clone();
                self.track_merged(&nested);
            }
        }
    }

    /// Reconciles a remote delta: fast-forwards a continuation, ignores
    /// an unknown anchor, and otherwise three-way merges the divergent
    /// streams, rebasing the remote records past any already-merged
    /// overlap.
    pub fn merge_delta(
        &mut self,
        delta: &HistoryDelta,
        user_id: impl Into<String>,
    ) -> Result<MergeDeltaOutcome> {
        if self.last_commit_id() == delta.from_commit_id {
            for record in &delta.records {
                self.push_record(record.clone());
            }
            self.track_merged(&delta.records);
            return Ok(MergeDeltaOutcome::FastForwarded);
        }
        if !self.has_commit_id(&delta.from_commit_id) {
            tracing::debug!(from = %delta.from_commit_id, "delta anchor unknown, ignoring");
            return Ok(MergeDeltaOutcome::Unknown);
        }

        // walk the delta prefix while it overlaps commits we already
        // have, directly or through an earlier merge
        let mut base_commit = delta.from_commit_id.clone();
        let mut remaining: &[HistoryRecord] = &delta.records;
        while let Some(record) = remaining.first() {
            if self.has_commit_id(&record.commit_id) {
                base_commit = record.commit_id.clone();
                remaining = &remaining[1..];
            } else if self.merged_commit_ids.contains(&record.commit_id) {
                remaining = &remaining[1..];
            } else {
                break;
            }
        }
        if remaining.is_empty() {
            return Ok(MergeDeltaOutcome::Merged {
                conflicts: ConflictsMap::default(),
            });
        }

        // re-apply the post-overlap remote records on our history to
        // obtain a non-overlapping "their" tree
        let base_doc = self.document_at(Some(&base_commit))?;
        let mut their_doc = base_doc.clone();
        for record in remaining {
            let mut edit = their_doc.edit();
            edit.apply_changes(&record.changes)?;
            their_doc = edit.updated_document();
        }
        let mine_doc = self.current_document()?;
        let outcome = (self.options.merge_fn)(&base_doc, &their_doc, &mine_doc)?;
        let changes = diff(&mine_doc, &outcome.doc)?;
        let their_operations = remaining.to_vec();
        self.track_merged(&their_operations);
        self.append(
            RecordKind::Merge {
                base_commit_id: base_commit,
                their_operations,
            },
            changes,
            user_id.into(),
            &outcome.doc,
        )?;
        Ok(MergeDeltaOutcome::Merged {
            conflicts: outcome.conflicts,
        })
    }

    /// The record index whose tree the record at `idx` materializes:
    /// undo and redo records stand for the commits they restored.
    fn effective_index(&self, idx: usize) -> usize {
        match &self.records[idx].kind {
            RecordKind::Undo {
                undone_to_commit_id,
            } => self
                .index
                .get(undone_to_commit_id)
                .copied()
                .unwrap_or(idx),
            RecordKind::Redo {
                reverse_to_commit_id,
                ..
            } => self
                .index
                .get(reverse_to_commit_id)
                .copied()
                .unwrap_or(idx),
            _ => idx,
        }
    }

    /// The commit an undo from the current head restores, skipping over
    /// records already undone.
    fn undo_target(&self) -> Option<usize> {
        let effective = self.effective_index(self.records.len() - 1);
        if effective == 0 {
            return None;
        }
        (0..effective).rev().find(|idx| {
            matches!(
                self.records[*idx].kind,
                RecordKind::Operation { .. } | RecordKind::Merge { .. }
            )
        })
    }

    pub fn can_undo(&self) -> bool {
        self.undo_target().is_some()
    }

    /// Reverts the head to the state before the newest not-yet-undone
    /// operation.
    pub fn undo(&mut self, user_id: impl Into<String>) -> Result<Option<&HistoryRecord>> {
        let target = match self.undo_target() {
            Some(target) => target,
            None => return Ok(None),
        };
        let target_id = self.records[target].commit_id.clone();
        let current = self.current_document()?;
        let undone = self.document_at(Some(&target_id))?;
        let changes = diff(&current, &undone)?;
        let record = self.append(
            RecordKind::Undo {
                undone_to_commit_id: target_id,
            },
            changes,
            user_id.into(),
            &undone,
        )?;
        Ok(Some(record))
    }

    /// The undo record a redo from the current head cancels. Only an
    /// undo head (possibly through redo hops) yields one.
    fn redo_anchor(&self, idx: usize) -> Option<usize> {
        match &self.records[idx].kind {
            RecordKind::Undo { .. } => Some(idx),
            RecordKind::Redo { undo_commit_id, .. } => {
                let undo_idx = *self.index.get(undo_commit_id)?;
                let previous = self.records[undo_idx].previous_commit_id.as_deref()?;
                self.redo_anchor(*self.index.get(previous)?)
            }
            _ => None,
        }
    }

    pub fn can_redo(&self) -> bool {
        self.redo_anchor(self.records.len() - 1).is_some()
    }

    /// Cancels the newest effective undo, restoring the state before it.
    pub fn redo(&mut self, user_id: impl Into<String>) -> Result<Option<&HistoryRecord>> {
        let anchor = match self.redo_anchor(self.records.len() - 1) {
            Some(anchor) => anchor,
            None => return Ok(None),
        };
        let undo_commit_id = self.records[anchor].commit_id.clone();
        let reverse_to = match self.records[anchor].previous_commit_id.clone() {
            Some(previous) => previous,
            None => return Ok(None),
        };
        let current = self.current_document()?;
        let restored = self.document_at(Some(&reverse_to))?;
        let changes = diff(&current, &restored)?;
        let record = self.append(
            RecordKind::Redo {
                undo_commit_id,
                reverse_to_commit_id: reverse_to,
            },
            changes,
            user_id.into(),
            &restored,
        )?;
        Ok(Some(record))
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut list = f.debug_list();
        for record in &self.records {
            list.entry(&format_args!(
                "{} {:?} ({} changes{})",
                &record.commit_id[..8.min(record.commit_id.len())],
                record_kind_name(&record.kind),
                record.changes.len(),
                if record.checkpoint.is_some() {
                    ", checkpoint"
                } else {
                    ""
                }
            ));
        }
        list.finish()
    }
}

fn record_kind_name(kind: &RecordKind) -> &'static str {
    match kind {
        RecordKind::Operation { .. } => "operation",
        RecordKind::Undo { .. } => "undo",
        RecordKind::Redo { .. } => "redo",
        RecordKind::Merge { .. } => "merge",
    }
}

/// Pulls `origin` into `local`: when local only trails origin the result
/// is origin itself; when local diverged, its delta past the last common
/// commit is merged into a copy of origin.
pub fn pull_origin_changes_into_local_history(
    origin: &History,
    local: &History,
    user_id: impl Into<String>,
) -> Result<(History, Option<ConflictsMap>)> {
    let last_common = local
        .records()
        .iter()
        .rev()
        .find(|record| origin.has_commit_id(&record.commit_id))
        .map(|record| record.commit_id.clone())
        .ok_or_else(|| Error::range("histories share no commit".to_string()))?;
    if last_common == local.last_commit_id() {
        return Ok((origin.clone(), None));
    }
    let delta = local.generate_delta(&last_common, None)?;
    let mut pulled = origin.clone();
    let outcome = pulled.merge_delta(&delta, user_id)?;
    let conflicts = match outcome {
        MergeDeltaOutcome::Merged { conflicts } => Some(conflicts),
        _ => None,
    };
    Ok((pulled, conflicts))
}

/// SHA-512 of the canonical serialization of a record, with `commit_id`
/// omitted and every checkpoint (nested ones included) elided.
fn commit_hash(record: &HistoryRecord) -> Result<String> {
    let mut value = serde_json::to_value(record)
        .map_err(|err| Error::constraint(format!("unserializable record: {}", err)))?;
    strip_for_hash(&mut value, true);
    let canonical = serde_json::to_string(&value).expect("value serialization");
    let mut hasher = Sha512::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn strip_for_hash(value: &mut serde_json::Value, top_level: bool) {
    if let serde_json::Value::Object(map) = value {
        if top_level {
            map.remove("commit_id");
        }
        map.remove("checkpoint");
        for nested in map.values_mut() {
            strip_nested_checkpoints(nested);
        }
    }
}

fn strip_nested_checkpoints(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove("checkpoint");
            for nested in map.values_mut() {
                strip_nested_checkpoints(nested);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_nested_checkpoints(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use crate::ops::Position;
    use crate::props::{seeded_doc, todo_doc};
    use crate::value::{Fields, Value};

    fn insert_op(key: &str, text: &str, index: usize) -> serde_json::Value {
        let command = Command::Insert {
            parent: NodeId::new("Root", 1u64),
            position: Position::array("children", index),
            element: NodeId::new("Node", key),
            data: {
                let mut data = Fields::new();
                data.insert("text".to_string(), Value::from(text));
                data
            },
        };
        serde_json::to_value(vec![command]).unwrap()
    }

    fn change_op(key: &str, text: &str) -> serde_json::Value {
        let command = Command::Change {
            element: NodeId::new("Node", key),
            changes: {
                let mut data = Fields::new();
                data.insert("text".to_string(), Value::from(text));
                data
            },
        };
        serde_json::to_value(vec![command]).unwrap()
    }

    fn new_history() -> History {
        History::new(&todo_doc(), "alice", HistoryOptions::default()).unwrap()
    }

    #[test]
    fn seed_record_checkpoints_the_document() {
        let history = new_history();
        assert_eq!(history.len(), 1);
        let seed = &history.records()[0];
        assert!(seed.checkpoint.is_some());
        assert!(seed.changes.is_empty());
        assert!(seed.previous_commit_id.is_none());
        assert_eq!(seed.commit_id.len(), 128); // sha-512 hex
        assert_eq!(history.current_document().unwrap(), todo_doc());
    }

    // reconstruction equals replay from the seed
    #[test]
    fn documents_reconstruct_at_every_commit() {
        let mut history = new_history();
        for i in 0..5 {
            history
                .commit(insert_op(&format!("n{}", i), "text", i), "alice")
                .unwrap();
        }
        let mut replayed = todo_doc();
        let commit_ids: Vec<String> = history
            .records()
            .iter()
            .map(|record| record.commit_id.clone())
            .collect();
        for (idx, commit_id) in commit_ids.iter().enumerate() {
            if idx > 0 {
                let mut edit = replayed.edit();
                edit.apply_changes(&history.records()[idx].changes).unwrap();
                replayed = edit.updated_document();
            }
            assert_eq!(history.document_at(Some(commit_id)).unwrap(), replayed);
        }
    }

    #[test]
    fn checkpoints_appear_on_the_configured_cadence() {
        let mut history = History::new(
            &todo_doc(),
            "alice",
            HistoryOptions {
                checkpoint_interval: 3,
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..7 {
            history
                .commit(insert_op(&format!("n{}", i), "x", i), "alice")
                .unwrap();
        }
        let checkpoints: Vec<bool> = history
            .records()
            .iter()
            .map(|record| record.checkpoint.is_some())
            .collect();
        assert_eq!(
            checkpoints,
            vec![true, false, false, true, false, false, true, false]
        );
    }

    #[test]
    fn commit_ids_chain_and_index() {
        let mut history = new_history();
        history.commit(insert_op("n0", "a", 0), "alice").unwrap();
        history.commit(insert_op("n1", "b", 1), "bob").unwrap();
        let ids: Vec<&str> = history
            .records()
            .iter()
            .map(|record| record.commit_id.as_str())
            .collect();
        assert!(history.has_commit_id(ids[1]));
        assert_eq!(history.next_commit_id_of(ids[0]), Some(ids[1]));
        assert_eq!(history.prev_commit_id_of(ids[2]), Some(ids[1]));
        assert_eq!(history.document_at(Some("nope")).err().map(|e| matches!(e, Error::Range(_))), Some(true));
    }

    // a continuation delta fast-forwards verbatim
    #[test]
    fn fast_forward_appends_delta_records() {
        let mut origin = new_history();
        origin.commit(insert_op("n0", "a", 0), "alice").unwrap();
        let mut local = origin.branch(None).unwrap();
        origin.commit(insert_op("n1", "b", 1), "alice").unwrap();
        origin.commit(change_op("n1", "b2"), "alice").unwrap();

        let delta = origin
            .generate_delta(local.last_commit_id(), None)
            .unwrap();
        let outcome = local.merge_delta(&delta, "bob").unwrap();
        assert!(matches!(outcome, MergeDeltaOutcome::FastForwarded));
        assert_eq!(local.records(), origin.records());
        assert_eq!(
            local.current_document().unwrap(),
            origin.current_document().unwrap()
        );
    }

    #[test]
    fn unknown_anchor_is_a_no_op() {
        let mut history = new_history();
        let delta = HistoryDelta {
            from_commit_id: "missing".to_string(),
            records: Vec::new(),
        };
        let before = history.len();
        assert!(matches!(
            history.merge_delta(&delta, "bob").unwrap(),
            MergeDeltaOutcome::Unknown
        ));
        assert_eq!(history.len(), before);
    }

    #[test]
    fn divergent_deltas_merge_with_a_merge_record() {
        let mut origin = new_history();
        origin.commit(insert_op("n0", "base", 0), "alice").unwrap();
        let mut local = origin.branch(None).unwrap();

        origin.commit(change_op("n0", "from-origin"), "alice").unwrap();
        local.commit(insert_op("n1", "from-local", 1), "bob").unwrap();

        let delta = origin
            .generate_delta(&local.records()[1].commit_id, None)
            .unwrap();
        let outcome = local.merge_delta(&delta, "bob").unwrap();
        match outcome {
            MergeDeltaOutcome::Merged { conflicts } => assert!(conflicts.is_empty()),
            other => panic!("expected a merge, got {:?}", other),
        }
        let head = local.records().last().unwrap();
        assert!(matches!(head.kind, RecordKind::Merge { .. }));

        let doc = local.current_document().unwrap();
        assert_eq!(
            doc.get_node(&NodeId::new("Node", "n0")).unwrap().data.get("text"),
            Some(&Value::from("from-origin"))
        );
        assert!(doc.contains(&NodeId::new("Node", "n1")));
        // the remote commit is tracked as merged
        assert!(local
            .merged_commit_ids()
            .contains(&origin.last_commit_id().to_string()));
    }

    // undo then redo restores the pre-undo tree
    #[test]
    fn undo_redo_are_inverse() {
        let mut history = new_history();
        history.commit(insert_op("n0", "a", 0), "alice").unwrap();
        history.commit(change_op("n0", "b"), "alice").unwrap();
        let before = history.current_document().unwrap();

        assert!(history.can_undo());
        history.undo("alice").unwrap().unwrap();
        let undone = history.current_document().unwrap();
        assert_eq!(
            undone.get_node(&NodeId::new("Node", "n0")).unwrap().data.get("text"),
            Some(&Value::from("a"))
        );

        assert!(history.can_redo());
        history.redo("alice").unwrap().unwrap();
        assert_eq!(history.current_document().unwrap(), before);
    }

    #[test]
    fn undo_stacks_past_previous_undos() {
        let mut history = new_history();
        history.commit(insert_op("n0", "a", 0), "alice").unwrap();
        history.commit(insert_op("n1", "b", 1), "alice").unwrap();

        history.undo("alice").unwrap().unwrap();
        // second undo targets the commit before the first undone one
        history.undo("alice").unwrap().unwrap();
        let doc = history.current_document().unwrap();
        assert!(!doc.contains(&NodeId::new("Node", "n0")));
        assert!(!doc.contains(&NodeId::new("Node", "n1")));

        // nothing operational left to undo
        assert!(!history.can_undo());
        assert!(history.undo("alice").unwrap().is_none());

        // redo restores n0, then n1
        history.redo("alice").unwrap().unwrap();
        assert!(history.current_document().unwrap().contains(&NodeId::new("Node", "n0")));
        history.redo("alice").unwrap().unwrap();
        assert!(history.current_document().unwrap().contains(&NodeId::new("Node", "n1")));
        assert!(!history.can_redo());
    }

    #[test]
    fn redo_requires_an_undo_head() {
        let mut history = new_history();
        history.commit(insert_op("n0", "a", 0), "alice").unwrap();
        assert!(!history.can_redo());
        assert!(history.redo("alice").unwrap().is_none());
    }

    #[test]
    fn branch_truncates_at_the_requested_commit() {
        let mut history = new_history();
        history.commit(insert_op("n0", "a", 0), "alice").unwrap();
        let cut = history.last_commit_id().to_string();
        history.commit(insert_op("n1", "b", 1), "alice").unwrap();

        let branched = history.branch(Some(&cut)).unwrap();
        assert_eq!(branched.len(), 2);
        assert_eq!(branched.last_commit_id(), cut);
        assert!(!branched
            .current_document()
            .unwrap()
            .contains(&NodeId::new("Node", "n1")));
    }

    #[test]
    fn reversed_delta_ranges_are_rejected() {
        let mut history = new_history();
        history.commit(insert_op("n0", "a", 0), "alice").unwrap();
        let first = history.records()[0].commit_id.clone();
        let last = history.last_commit_id().to_string();
        assert!(matches!(
            history.generate_delta(&last, Some(&first)),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn pull_replaces_a_trailing_local() {
        let mut origin = new_history();
        origin.commit(insert_op("n0", "a", 0), "alice").unwrap();
        let local = origin.branch(Some(&origin.records()[0].commit_id.clone())).unwrap();

        let (pulled, conflicts) =
            pull_origin_changes_into_local_history(&origin, &local, "bob").unwrap();
        assert!(conflicts.is_none());
        assert_eq!(pulled.records(), origin.records());
    }

    #[test]
    fn pull_merges_a_diverged_local() {
        let mut origin = new_history();
        origin.commit(insert_op("n0", "a", 0), "alice").unwrap();
        let mut local = origin.branch(None).unwrap();
        origin.commit(insert_op("n1", "origin", 1), "alice").unwrap();
        local.commit(insert_op("n2", "local", 1), "bob").unwrap();

        let (pulled, conflicts) =
            pull_origin_changes_into_local_history(&origin, &local, "bob").unwrap();
        assert!(conflicts.is_some());
        let doc = pulled.current_document().unwrap();
        assert!(doc.contains(&NodeId::new("Node", "n1")));
        assert!(doc.contains(&NodeId::new("Node", "n2")));
    }

    #[test]
    fn hashes_ignore_checkpoints() {
        let doc = seeded_doc();
        let history = History::new(&doc, "alice", HistoryOptions::default()).unwrap();
        let mut with_checkpoint = history.records()[0].clone();
        with_checkpoint.commit_id = String::new();
        let mut without = with_checkpoint.clone();
        without.checkpoint = None;
        assert_eq!(
            commit_hash(&with_checkpoint).unwrap(),
            commit_hash(&without).unwrap()
        );
    }
}
