//! Metadata value model
//!
//! Library and chunk metadata is a string-keyed map of scalars or string
//! arrays. Maps are `BTreeMap` so serialized state and list output are
//! deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A metadata value: scalar or string array.
///
/// There is no coercion between types: `Int(1)` never equals `Float(1.0)`
/// under [`MetadataValue::eq`]. Numeric range filters compare through
/// [`MetadataValue::as_f64`], which is the only place the two meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// UTF-8 string.
    String(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Array of strings (tags).
    StringList(Vec<String>),
}

impl MetadataValue {
    /// Type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetadataValue::String(_) => "String",
            MetadataValue::Int(_) => "Int",
            MetadataValue::Float(_) => "Float",
            MetadataValue::Bool(_) => "Bool",
            MetadataValue::StringList(_) => "StringList",
        }
    }

    /// Numeric view for range comparisons; `None` for non-numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(v) => Some(*v as f64),
            MetadataValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view; `None` for non-string values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Metadata map attached to libraries and chunks.
pub type MetadataMap = BTreeMap<String, MetadataValue>;

/// A partial update to a metadata map: keys to set, keys to remove.
///
/// Removals are applied after sets, so a key named in both ends up removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    /// Keys to insert or overwrite.
    pub set: MetadataMap,
    /// Keys to delete.
    pub remove: Vec<String>,
}

impl MetadataPatch {
    /// A patch that only sets keys.
    pub fn set_only(set: MetadataMap) -> Self {
        MetadataPatch {
            set,
            remove: Vec::new(),
        }
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    /// Apply the patch to a map in place.
    pub fn apply(&self, target: &mut MetadataMap) {
        for (key, value) in &self.set {
            target.insert(key.clone(), value.clone());
        }
        for key in &self.remove {
            target.remove(key);
        }
    }
}
