use thiserror::Error;

/// The closed set of failure kinds raised by document, diff, merge and
/// history operations. Every public fallible operation fails atomically:
/// when an error is returned the receiver is in its pre-call state.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A node id or path input did not resolve to a live node.
    #[error("unresolved reference: {0}")]
    Reference(String),
    /// The document violates one of its referential invariants.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// A path element or position kind does not match the schema link kind.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// An index or commit id is outside the addressable range.
    #[error("out of range: {0}")]
    Range(String),
    /// An id that must be unique is already live.
    #[error("duplicate identifier: {0}")]
    Uniqueness(String),
    /// The schema does not declare the referenced type or field.
    #[error("schema constraint: {0}")]
    Constraint(String),
}

impl Error {
    pub(crate) fn reference(msg: impl Into<String>) -> Self {
        Self::Reference(msg.into())
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub(crate) fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    pub(crate) fn uniqueness(msg: impl Into<String>) -> Self {
        Self::Uniqueness(msg.into())
    }

    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
