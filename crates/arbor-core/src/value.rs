//! Stored values
//!
//! A directory key holds one `Value`. `Undefined` is a real stored
//! value, distinct from the key being absent; deleting a key removes it
//! entirely.

use serde::{Deserialize, Serialize};

use crate::TreePath;

/// Value held by a directory key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Explicitly stored "no payload" marker
    Undefined,
    /// Arbitrary JSON payload
    Json(serde_json::Value),
    /// Link to another directory subtree. Stores a reference only;
    /// ownership stays with the tree.
    Directory(TreePath),
}

impl Value {
    /// Shorthand for a JSON string value
    pub fn string(s: impl Into<String>) -> Self {
        Value::Json(serde_json::Value::String(s.into()))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// The JSON payload, if any
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The linked directory path, if any
    pub fn as_directory(&self) -> Option<&TreePath> {
        match self {
            Value::Directory(path) => Some(path),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Json(serde_json::Value::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Json(serde_json::Value::Bool(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_is_not_json_null() {
        let undefined = Value::Undefined;
        let null = Value::Json(serde_json::Value::Null);
        assert_ne!(undefined, null);
        assert!(undefined.is_undefined());
        assert!(!null.is_undefined());
    }

    #[test]
    fn test_serde_roundtrip() {
        let values = vec![
            Value::Undefined,
            Value::from("hello"),
            Value::from(42),
            Value::Json(serde_json::json!({"nested": [1, 2, 3]})),
            Value::Directory(TreePath::parse("/a/b").unwrap()),
        ];
        for value in values {
            let encoded = serde_json::to_string(&value).unwrap();
            let decoded: Value = serde_json::from_str(&encoded).unwrap();
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn test_directory_link() {
        let link = Value::Directory(TreePath::parse("/shared/team").unwrap());
        assert_eq!(link.as_directory().unwrap().as_str(), "/shared/team");
        assert!(link.as_json().is_none());
    }
}
