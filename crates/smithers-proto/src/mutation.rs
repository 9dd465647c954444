//! State mutations returned by node handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single key/value write requested by a handler.
///
/// Handlers return mutations instead of writing state themselves, so every
/// change between frames flows through the store and lands in its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMutation {
    pub key: String,
    pub value: Value,
}

impl StateMutation {
    /// Creates a mutation from any serializable value.
    ///
    /// Values that fail to serialize are written as `null`.
    pub fn set(key: impl Into<String>, value: impl Serialize) -> Self {
        Self {
            key: key.into(),
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_serializes_value() {
        let m = StateMutation::set("reviewed", true);
        assert_eq!(m.key, "reviewed");
        assert_eq!(m.value, Value::Bool(true));

        let m = StateMutation::set("files", vec!["a.rs", "b.rs"]);
        assert_eq!(m.value, serde_json::json!(["a.rs", "b.rs"]));
    }
}
