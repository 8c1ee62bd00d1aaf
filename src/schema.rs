use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::id::{ElementKey, FieldName, NodeId, TypeName};
use crate::node::{Node, NodeLink};
use crate::value::{Fields, Value};

/// Transient root-level array that holds detached nodes between the two
/// halves of an incompatible move. It is part of the wire-visible state
/// and empty in every settled document.
pub const ORPHANS_FIELD: &str = "__orphans";

/// How a parent field refers to child nodes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum LinkKind {
    /// At most one child.
    Single,
    /// Ordered children, duplicates disallowed.
    Array,
    /// Unordered membership keyed by canonical id.
    Set,
}

/// Declarative description of one node type: the shape of its data record
/// and the kinds of its child and non-child link fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeDef {
    data: Fields,
    children: BTreeMap<FieldName, LinkKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    links: BTreeMap<FieldName, LinkKind>,
}

impl NodeTypeDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a data field with its template (empty) value.
    pub fn with_field(mut self, name: impl Into<FieldName>, template: impl Into<Value>) -> Self {
        self.data.insert(name.into(), template.into());
        self
    }

    /// Declares a child link field.
    pub fn with_child(mut self, name: impl Into<FieldName>, kind: LinkKind) -> Self {
        self.children.insert(name.into(), kind);
        self
    }

    /// Declares a non-child link field.
    pub fn with_link(mut self, name: impl Into<FieldName>, kind: LinkKind) -> Self {
        self.links.insert(name.into(), kind);
        self
    }

    /// The fresh data record for a node of this type.
    pub fn data_template(&self) -> &Fields {
        &self.data
    }

    pub fn children(&self) -> &BTreeMap<FieldName, LinkKind> {
        &self.children
    }

    pub fn links(&self) -> &BTreeMap<FieldName, LinkKind> {
        &self.links
    }
}

/// A document schema: the root type plus a descriptor per node type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    document_type: String,
    root_type: TypeName,
    node_types: BTreeMap<TypeName, NodeTypeDef>,
}

impl Schema {
    pub fn new(document_type: impl Into<String>, root_type: impl Into<TypeName>) -> Self {
        Self {
            document_type: document_type.into(),
            root_type: root_type.into(),
            node_types: BTreeMap::new(),
        }
    }

    /// Registers a node type.
    pub fn with_type(mut self, name: impl Into<TypeName>, def: NodeTypeDef) -> Self {
        self.node_types.insert(name.into(), def);
        self
    }

    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    pub fn node_type(&self, ty: &str) -> Result<&NodeTypeDef> {
        self.node_types
            .get(ty)
            .ok_or_else(|| Error::constraint(format!("unknown node type {:?}", ty)))
    }

    pub fn has_type(&self, ty: &str) -> bool {
        self.node_types.contains_key(ty)
    }

    /// Returns the kind of a child link field, including the implicit
    /// `__orphans` array of the root type.
    pub fn child_kind(&self, ty: &str, field: &str) -> Result<LinkKind> {
        if ty == self.root_type && field == ORPHANS_FIELD {
            return Ok(LinkKind::Array);
        }
        self.node_type(ty)?
            .children
            .get(field)
            .copied()
            .ok_or_else(|| Error::constraint(format!("type {:?} has no child field {:?}", ty, field)))
    }

    /// Child fields of a type in declaration order, `__orphans` last for
    /// the root type.
    pub fn child_fields(&self, ty: &str) -> Result<Vec<(FieldName, LinkKind)>> {
        let def = self.node_type(ty)?;
        let mut fields: Vec<_> = def
            .children
            .iter()
            .map(|(name, kind)| (name.clone(), *kind))
            .collect();
        if ty == self.root_type {
            fields.push((ORPHANS_FIELD.to_string(), LinkKind::Array));
        }
        Ok(fields)
    }

    /// Checks a data patch against the declared data fields.
    pub fn validate_data(&self, ty: &str, data: &Fields) -> Result<()> {
        let def = self.node_type(ty)?;
        for field in data.keys() {
            if !def.data.contains_key(field) {
                return Err(Error::constraint(format!(
                    "type {:?} has no data field {:?}",
                    ty, field
                )));
            }
        }
        Ok(())
    }

    /// Constructs a node of `ty` with template data and empty link fields.
    pub fn empty_node(&self, ty: &str, key: ElementKey) -> Result<Node> {
        let def = self.node_type(ty)?;
        let mut children: BTreeMap<FieldName, NodeLink> = def
            .children
            .iter()
            .map(|(name, kind)| (name.clone(), NodeLink::empty(*kind)))
            .collect();
        if ty == self.root_type {
            children.insert(ORPHANS_FIELD.to_string(), NodeLink::empty(LinkKind::Array));
        }
        let links = def
            .links
            .iter()
            .map(|(name, kind)| (name.clone(), NodeLink::empty(*kind)))
            .collect();
        Ok(Node {
            id: NodeId::new(ty, key),
            data: def.data.clone(),
            children,
            links,
            parent: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::todo_schema;

    #[test]
    fn empty_node_has_template_data_and_empty_links() {
        let schema = todo_schema();
        let node = schema.empty_node("Node", "n1".into()).unwrap();
        assert_eq!(node.data.get("text"), Some(&Value::Str(String::new())));
        assert_eq!(node.data.get("isChecked"), Some(&Value::Bool(false)));
        assert_eq!(
            node.children.get("children"),
            Some(&NodeLink::Array(vec![]))
        );
        assert!(node.parent.is_none());
    }

    #[test]
    fn root_gets_orphans_array() {
        let schema = todo_schema();
        let root = schema.empty_node("Root", 1u64.into()).unwrap();
        assert_eq!(
            root.children.get(ORPHANS_FIELD),
            Some(&NodeLink::Array(vec![]))
        );
        assert_eq!(schema.child_kind("Root", ORPHANS_FIELD).unwrap(), LinkKind::Array);
    }

    #[test]
    fn unknown_type_and_field_are_constraint_errors() {
        let schema = todo_schema();
        assert!(matches!(
            schema.empty_node("Nope", 1u64.into()),
            Err(Error::Constraint(_))
        ));
        assert!(matches!(
            schema.child_kind("Node", "nope"),
            Err(Error::Constraint(_))
        ));
        let mut patch = Fields::new();
        patch.insert("nope".to_string(), Value::Null);
        assert!(matches!(
            schema.validate_data("Node", &patch),
            Err(Error::Constraint(_))
        ));
    }
}
