//! The declarative type description that drives the asset-bank framework.
//!
//! Asset types are not generated by a macro here; instead a [`Schema`] is
//! built at runtime (typically once, from a handful of
//! [`Schema::register`] calls in the application or a loaded text
//! description) and every node carries a `type_name` that's looked up
//! against it for validation. This keeps `AssetNode` itself schema-agnostic
//! - the same arena works for any game's type set.

use std::collections::HashMap;

use crate::bank::value::AttributeType;
use crate::error::{Error, Result};

/// An attribute declared for one asset type.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub name: String,
    pub ty: AttributeType,
}

/// A single asset type: its attributes and which child types it may
/// contain.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Stable ID assigned at registration order; used by the
    /// constructor dispatch table.
    pub id: u32,
    pub name: String,
    pub attributes: Vec<AttributeDef>,
    pub allowed_children: Vec<String>,
}

impl TypeDef {
    /// The presence-bitfield index of `name`, if this type declares it.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }
}

/// The full set of asset types known to a forest.
///
/// A 32-entry presence bitfield backs every node, so no single type may
/// declare more than 32 attributes; [`Schema::register`] enforces this.
#[derive(Debug, Default)]
pub struct Schema {
    types: Vec<TypeDef>,
    by_name: HashMap<String, u32>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new asset type, returning its stable type ID.
    pub fn register(
        &mut self,
        name: &str,
        attributes: Vec<(&str, AttributeType)>,
        allowed_children: Vec<&str>,
    ) -> Result<u32> {
        if attributes.len() > 32 {
            return Err(Error::SchemaViolation(format!(
                "type {name} declares {} attributes, at most 32 are addressable",
                attributes.len()
            )));
        }
        if self.by_name.contains_key(name) {
            return Err(Error::SchemaViolation(format!(
                "type {name} is already registered"
            )));
        }
        let id = self.types.len() as u32;
        self.types.push(TypeDef {
            id,
            name: name.to_string(),
            attributes: attributes
                .into_iter()
                .map(|(n, ty)| AttributeDef {
                    name: n.to_string(),
                    ty,
                })
                .collect(),
            allowed_children: allowed_children.into_iter().map(String::from).collect(),
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn type_by_name(&self, name: &str) -> Result<&TypeDef> {
        self.by_name
            .get(name)
            .map(|&id| &self.types[id as usize])
            .ok_or_else(|| Error::NotFound(format!("asset type {name}")))
    }

    pub fn type_by_id(&self, id: u32) -> &TypeDef {
        &self.types[id as usize]
    }

    pub fn allows_child(&self, parent_type: &str, child_type: &str) -> Result<bool> {
        let parent = self.type_by_name(parent_type)?;
        Ok(parent
            .allowed_children
            .iter()
            .any(|c| c == child_type))
    }

    /// Validate that `value` is a legal instance of `attr_name` on
    /// `type_name`, returning its presence-bitfield index.
    pub fn validate_attribute(
        &self,
        type_name: &str,
        attr_name: &str,
        value: &crate::bank::value::Value,
    ) -> Result<usize> {
        let type_def = self.type_by_name(type_name)?;
        let idx = type_def.attribute_index(attr_name).ok_or_else(|| {
            Error::SchemaViolation(format!("{type_name} has no attribute {attr_name}"))
        })?;
        if !type_def.attributes[idx].ty.matches(value) {
            return Err(Error::SchemaViolation(format!(
                "attribute {attr_name} of {type_name} expects {:?}, got {:?}",
                type_def.attributes[idx].ty,
                value.type_of()
            )));
        }
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::value::Value;

    fn test_schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .register("World", vec![("name", AttributeType::String)], vec!["Area"])
            .unwrap();
        schema
            .register(
                "Area",
                vec![
                    ("elevation", AttributeType::Float),
                    ("sky_ref", AttributeType::AssetLink),
                ],
                vec![],
            )
            .unwrap();
        schema
    }

    #[test]
    fn allows_child_reflects_declared_types() {
        let schema = test_schema();
        assert!(schema.allows_child("World", "Area").unwrap());
        assert!(!schema.allows_child("World", "World").unwrap());
    }

    #[test]
    fn validate_attribute_checks_type_and_name() {
        let schema = test_schema();
        assert!(
            schema
                .validate_attribute("Area", "elevation", &Value::Float(1.0))
                .is_ok()
        );
        assert!(matches!(
            schema.validate_attribute("Area", "elevation", &Value::Int(1)),
            Err(Error::SchemaViolation(_))
        ));
        assert!(matches!(
            schema.validate_attribute("Area", "missing", &Value::Int(1)),
            Err(Error::SchemaViolation(_))
        ));
    }

    #[test]
    fn rejects_types_with_too_many_attributes() {
        let mut schema = Schema::new();
        let attrs: Vec<(&str, AttributeType)> = (0..33)
            .map(|i| (Box::leak(format!("a{i}").into_boxed_str()) as &str, AttributeType::Int))
            .collect();
        assert!(matches!(
            schema.register("TooBig", attrs, vec![]),
            Err(Error::SchemaViolation(_))
        ));
    }
}
