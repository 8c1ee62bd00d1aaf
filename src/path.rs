use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::id::{FieldName, NodeId};
use crate::schema::LinkKind;

/// One step of a [`Path`], addressing a child within a parent's link field.
/// The element shape must match the schema-declared kind of the field it
/// names.
#[derive(Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum PathElement {
    /// Descend through a `Single` link field.
    Field(FieldName),
    /// Descend to the child at `index` of an `Array` link field.
    Index { field: FieldName, index: usize },
    /// Descend to the identified member of a `Set` link field.
    Key { field: FieldName, id: NodeId },
}

impl PathElement {
    /// The link field this element addresses.
    pub fn field(&self) -> &str {
        match self {
            Self::Field(field) => field,
            Self::Index { field, .. } => field,
            Self::Key { field, .. } => field,
        }
    }

    /// The link kind this element expects the field to have.
    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Field(_) => LinkKind::Single,
            Self::Index { .. } => LinkKind::Array,
            Self::Key { .. } => LinkKind::Set,
        }
    }
}

impl std::fmt::Debug for PathElement {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Field(field) => write!(f, "{}", field),
            Self::Index { field, index } => write!(f, "{}[{}]", field, index),
            Self::Key { field, id } => write!(f, "{}{{{}}}", field, id),
        }
    }
}

/// An owned sequence of path elements rooted at the document root.
#[derive(Clone, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PathBuf(SmallVec<[PathElement; 8]>);

impl PathBuf {
    /// Creates an empty path, which addresses the root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an element.
    pub fn push(&mut self, element: PathElement) {
        self.0.push(element);
    }

    /// Appends a `Single` field step.
    pub fn field(&mut self, field: impl Into<FieldName>) {
        self.push(PathElement::Field(field.into()));
    }

    /// Appends an `Array` index step.
    pub fn index(&mut self, field: impl Into<FieldName>, index: usize) {
        self.push(PathElement::Index {
            field: field.into(),
            index,
        });
    }

    /// Appends a `Set` member step.
    pub fn key(&mut self, field: impl Into<FieldName>, id: NodeId) {
        self.push(PathElement::Key {
            field: field.into(),
            id,
        });
    }

    /// Removes the last element.
    pub fn pop(&mut self) -> Option<PathElement> {
        self.0.pop()
    }

    /// Returns a borrowed path.
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Extends this path with the elements of another.
    pub fn extend(&mut self, path: Path) {
        self.0.extend(path.0.iter().cloned());
    }
}

impl FromIterator<PathElement> for PathBuf {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = PathElement>,
    {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<PathElement>> for PathBuf {
    fn from(elements: Vec<PathElement>) -> Self {
        Self(elements.into_iter().collect())
    }
}

impl std::fmt::Debug for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

impl std::fmt::Display for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

/// A borrowed slice of path elements.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Path<'a>(&'a [PathElement]);

impl<'a> Path<'a> {
    pub fn new(elements: &'a [PathElement]) -> Self {
        Self(elements)
    }

    /// Returns true if the path addresses the root.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&'a PathElement> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&'a PathElement> {
        self.0.last()
    }

    /// Returns the path without the last element.
    pub fn parent(&self) -> Option<Path<'a>> {
        if self.0.is_empty() {
            None
        } else {
            Some(Path(&self.0[..self.0.len() - 1]))
        }
    }

    /// Returns the first element and the path without it.
    pub fn split_first(&self) -> Option<(&'a PathElement, Path<'a>)> {
        let (first, rest) = self.0.split_first()?;
        Some((first, Path(rest)))
    }

    /// Returns the path without the last element and the last element.
    pub fn split_last(&self) -> Option<(Path<'a>, &'a PathElement)> {
        let (last, rest) = self.0.split_last()?;
        Some((Path(rest), last))
    }

    pub fn iter(&self) -> std::slice::Iter<'a, PathElement> {
        self.0.iter()
    }

    /// Returns an owned `PathBuf`.
    pub fn to_owned(&self) -> PathBuf {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for Path<'a> {
    type IntoIter = std::slice::Iter<'a, PathElement>;
    type Item = &'a PathElement;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'a> std::fmt::Debug for Path<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:?}", element)?;
        }
        Ok(())
    }
}

impl<'a> std::fmt::Display for Path<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_split() {
        let mut p = PathBuf::new();
        p.index("children", 0);
        p.field("owner");
        p.key("members", NodeId::new("Member", "m1"));
        assert_eq!(p.len(), 3);

        let (first, rest) = p.as_path().split_first().unwrap();
        assert_eq!(first, &PathElement::Index {
            field: "children".to_string(),
            index: 0
        });
        assert_eq!(rest.len(), 2);

        let (parent, last) = p.as_path().split_last().unwrap();
        assert_eq!(parent.len(), 2);
        assert_eq!(last.field(), "members");
        assert_eq!(last.kind(), LinkKind::Set);
    }

    #[test]
    fn render() {
        let mut p = PathBuf::new();
        p.index("children", 2);
        p.field("owner");
        assert_eq!(format!("{}", p), "children[2].owner");
    }

    #[test]
    fn empty_path_is_root() {
        let p = PathBuf::new();
        assert!(p.is_empty());
        assert!(p.as_path().split_first().is_none());
    }
}
