use serde::{Deserialize, Serialize};

/// Name of a node type declared in a [`Schema`](crate::Schema).
pub type TypeName = String;

/// Name of a data or link field.
pub type FieldName = String;

/// The opaque per-type part of a node identifier. Keys are either numeric
/// or string scalars; equality and ordering are component-wise.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ElementKey {
    U64(u64),
    Str(String),
}

impl ElementKey {
    /// Generates a fresh random key. Used for inserts without a caller
    /// supplied id and for subtree re-identification.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        // getrandom only fails when the platform entropy source is broken.
        getrandom::getrandom(&mut bytes).expect("no entropy source");
        Self::Str(hex::encode(bytes))
    }
}

impl From<u64> for ElementKey {
    fn from(key: u64) -> Self {
        Self::U64(key)
    }
}

impl From<&str> for ElementKey {
    fn from(key: &str) -> Self {
        Self::Str(key.to_string())
    }
}

impl From<String> for ElementKey {
    fn from(key: String) -> Self {
        Self::Str(key)
    }
}

impl std::fmt::Display for ElementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::U64(key) => write!(f, "{}", key),
            Self::Str(key) => write!(f, "{}", key),
        }
    }
}

impl std::fmt::Debug for ElementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// A stable node identifier: the node's type name paired with a per-type
/// key. The canonical string form `"<type>.<key>"` keys serialized node
/// maps.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId {
    ty: TypeName,
    key: ElementKey,
}

impl NodeId {
    pub fn new(ty: impl Into<TypeName>, key: impl Into<ElementKey>) -> Self {
        Self {
            ty: ty.into(),
            key: key.into(),
        }
    }

    pub fn node_type(&self) -> &str {
        &self.ty
    }

    pub fn key(&self) -> &ElementKey {
        &self.key
    }

    /// Returns the canonical `"<type>.<key>"` form.
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.ty, self.key)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.ty, self.key)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.ty, self.key)
    }
}

impl std::str::FromStr for NodeId {
    type Err = crate::Error;

    /// Parses the canonical `"<type>.<key>"` form. Keys that parse as an
    /// unsigned integer become numeric keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, key) = s
            .split_once('.')
            .ok_or_else(|| crate::Error::reference(format!("not a canonical id: {:?}", s)))?;
        if ty.is_empty() || key.is_empty() {
            return Err(crate::Error::reference(format!(
                "not a canonical id: {:?}",
                s
            )));
        }
        let key = match key.parse::<u64>() {
            Ok(n) => ElementKey::U64(n),
            Err(_) => ElementKey::Str(key.to_string()),
        };
        Ok(Self::new(ty, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        let id = NodeId::new("Todo", 42u64);
        assert_eq!(id.canonical(), "Todo.42");
        assert_eq!(id.canonical().parse::<NodeId>().unwrap(), id);

        let id = NodeId::new("Member", "m1");
        assert_eq!(id.canonical(), "Member.m1");
        assert_eq!(id.canonical().parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn ordering_is_component_wise() {
        let a = NodeId::new("A", 1u64);
        let b = NodeId::new("A", 2u64);
        let c = NodeId::new("B", 1u64);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(ElementKey::generate(), ElementKey::generate());
    }
}
