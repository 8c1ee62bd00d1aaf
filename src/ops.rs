use serde::{Deserialize, Serialize};

use crate::id::{ElementKey, FieldName, NodeId, TypeName};
use crate::path::{Path, PathBuf};
use crate::schema::LinkKind;
use crate::value::{Fields, Value};

/// A slot under a parent node where a child is attached. The variant must
/// match the schema-declared kind of the named field.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Position {
    /// The single slot of a `Single` link field.
    Single { field: FieldName },
    /// An index into an `Array` link field; clamped into `[0, len]` on
    /// attachment.
    Array { field: FieldName, index: usize },
    /// Membership of a `Set` link field; `id` must equal the id of the
    /// attached node.
    Set { field: FieldName, id: NodeId },
}

impl Position {
    pub fn single(field: impl Into<FieldName>) -> Self {
        Self::Single {
            field: field.into(),
        }
    }

    pub fn array(field: impl Into<FieldName>, index: usize) -> Self {
        Self::Array {
            field: field.into(),
            index,
        }
    }

    pub fn set(field: impl Into<FieldName>, id: NodeId) -> Self {
        Self::Set {
            field: field.into(),
            id,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Single { field } => field,
            Self::Array { field, .. } => field,
            Self::Set { field, .. } => field,
        }
    }

    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Single { .. } => LinkKind::Single,
            Self::Array { .. } => LinkKind::Array,
            Self::Set { .. } => LinkKind::Set,
        }
    }
}

/// A user-facing reference to a live node: either its id or a path from
/// the root. References are resolved once, at the API boundary, so the
/// recorded change log is path-independent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Target {
    Id(NodeId),
    Path(PathBuf),
}

impl From<NodeId> for Target {
    fn from(id: NodeId) -> Self {
        Self::Id(id)
    }
}

impl From<&NodeId> for Target {
    fn from(id: &NodeId) -> Self {
        Self::Id(id.clone())
    }
}

impl From<PathBuf> for Target {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Path<'_>> for Target {
    fn from(path: Path) -> Self {
        Self::Path(path.to_owned())
    }
}

/// Payload of an insert: the child type, an optional caller-supplied key
/// (a fresh one is generated otherwise) and data overlaid on the type's
/// template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub node_type: TypeName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ElementKey>,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub data: Fields,
}

impl ElementInfo {
    pub fn new(node_type: impl Into<TypeName>) -> Self {
        Self {
            node_type: node_type.into(),
            key: None,
            data: Fields::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<ElementKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<FieldName>, value: impl Into<Value>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }
}

/// A primitive structural command, recorded in resolved form. Replaying a
/// recorded sequence on any equal-shaped document reproduces the same
/// result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Insert {
        parent: NodeId,
        position: Position,
        element: NodeId,
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        data: Fields,
    },
    Change {
        element: NodeId,
        changes: Fields,
    },
    Move {
        element: NodeId,
        to_parent: NodeId,
        position: Position,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changes: Option<Fields>,
    },
    Delete {
        element: NodeId,
    },
}

impl Command {
    /// The node the command targets.
    pub fn element(&self) -> &NodeId {
        match self {
            Self::Insert { element, .. } => element,
            Self::Change { element, .. } => element,
            Self::Move { element, .. } => element,
            Self::Delete { element } => element,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_json() {
        let cmd = Command::Move {
            element: NodeId::new("Node", "n1"),
            to_parent: NodeId::new("Root", 1u64),
            position: Position::array("children", 2),
            changes: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let decoded: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn position_kind_matches_variant() {
        assert_eq!(Position::single("owner").kind(), LinkKind::Single);
        assert_eq!(Position::array("children", 0).kind(), LinkKind::Array);
        assert_eq!(
            Position::set("members", NodeId::new("Member", "m1")).kind(),
            LinkKind::Set
        );
    }
}
