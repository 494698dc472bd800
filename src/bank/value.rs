//! Typed attribute values and the attribute-type lattice they're checked
//! against.

/// A schema-declared attribute type.
///
/// `Array(T)` names the element type; nesting (`Array(Array(_))`) is legal
/// but unused by the shipped schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Int,
    Float,
    Bool,
    String,
    AssetLink,
    FileReference,
    Vec3,
    Color,
    Array(Box<AttributeType>),
}

impl AttributeType {
    /// Whether `value` is a legal instance of this type.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (AttributeType::Int, Value::Int(_)) => true,
            (AttributeType::Float, Value::Float(_)) => true,
            (AttributeType::Bool, Value::Bool(_)) => true,
            (AttributeType::String, Value::String(_)) => true,
            (AttributeType::AssetLink, Value::AssetLink(_)) => true,
            (AttributeType::FileReference, Value::FileReference(_)) => true,
            (AttributeType::Vec3, Value::Vec3(_)) => true,
            (AttributeType::Color, Value::Color(_)) => true,
            (AttributeType::Array(elem), Value::Array(items)) => {
                items.iter().all(|v| elem.matches(v))
            }
            _ => false,
        }
    }
}

/// A concrete attribute value stored on an [`super::node::AssetNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f32),
    Bool(bool),
    String(String),
    /// A `/`-separated link to another asset, resolved through the forest.
    AssetLink(String),
    /// A path to an external binary file, opened lazily by the bank.
    FileReference(String),
    Vec3([f32; 3]),
    /// Packed RGBA, one byte per channel.
    Color([u8; 4]),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_of(&self) -> AttributeType {
        match self {
            Value::Int(_) => AttributeType::Int,
            Value::Float(_) => AttributeType::Float,
            Value::Bool(_) => AttributeType::Bool,
            Value::String(_) => AttributeType::String,
            Value::AssetLink(_) => AttributeType::AssetLink,
            Value::FileReference(_) => AttributeType::FileReference,
            Value::Vec3(_) => AttributeType::Vec3,
            Value::Color(_) => AttributeType::Color,
            Value::Array(items) => AttributeType::Array(Box::new(
                items
                    .first()
                    .map(Value::type_of)
                    .unwrap_or(AttributeType::Int),
            )),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) | Value::AssetLink(v) | Value::FileReference(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_type_matches_homogeneous_elements() {
        let ty = AttributeType::Array(Box::new(AttributeType::Int));
        let good = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        let bad = Value::Array(vec![Value::Int(1), Value::Float(2.0)]);
        assert!(ty.matches(&good));
        assert!(!ty.matches(&bad));
    }

    #[test]
    fn scalar_types_reject_mismatched_value() {
        assert!(!AttributeType::Int.matches(&Value::Float(1.0)));
        assert!(AttributeType::Vec3.matches(&Value::Vec3([0.0, 0.0, 0.0])));
    }
}
