//! Tagged workflow state values.
//!
//! Workflow state is persisted in checkpoints and restored days later, so
//! entries are restricted to a closed set of value kinds with an explicit
//! wire form (`{"kind": "...", "value": ...}`) instead of arbitrary JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single state entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    /// Free text.
    Text(String),
    /// Signed integer.
    Integer(i64),
    /// Boolean flag.
    Flag(bool),
    /// UUID identifier.
    Id(Uuid),
    /// Ordered list of values.
    List(Vec<StateValue>),
    /// Nested map.
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Get as text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get as integer.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as flag.
    #[must_use]
    pub const fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as identifier.
    #[must_use]
    pub const fn as_id(&self) -> Option<Uuid> {
        match self {
            Self::Id(id) => Some(*id),
            _ => None,
        }
    }

    /// Get as list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get as nested map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the value kind, for logs and error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Flag(_) => "flag",
            Self::Id(_) => "id",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<Uuid> for StateValue {
    fn from(value: Uuid) -> Self {
        Self::Id(value)
    }
}

impl From<Vec<String>> for StateValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values.into_iter().map(Self::Text).collect())
    }
}

/// Key/value state bag carried by an execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateBag(BTreeMap<String, StateValue>);

impl StateBag {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Option<StateValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Get a raw value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.0.get(key)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.0.remove(key)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Get a text value.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(StateValue::as_text)
    }

    /// Get an integer value.
    #[must_use]
    pub fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(StateValue::as_integer)
    }

    /// Get a flag value.
    #[must_use]
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(StateValue::as_flag)
    }

    /// Get a list of text values, skipping entries of other kinds.
    #[must_use]
    pub fn text_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(StateValue::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(StateValue::as_text)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy every entry of `other` into this bag, overwriting on conflict.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Iterate over keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.0.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the checkpoint wire form.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from the checkpoint wire form.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a valid state bag.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl FromIterator<(String, StateValue)> for StateBag {
    fn from_iter<T: IntoIterator<Item = (String, StateValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_form_is_tagged() {
        let value = StateValue::Integer(7);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"kind":"integer","value":7}"#);
    }

    #[test]
    fn test_nested_round_trip() {
        let mut inner = BTreeMap::new();
        inner.insert("approved".to_string(), StateValue::Flag(false));
        inner.insert("reviewer".to_string(), StateValue::from("dana"));

        let mut bag = StateBag::new();
        bag.insert("analysis", "touches the billing module");
        bag.insert("attempt", 3_i64);
        bag.insert("run", Uuid::new_v4());
        bag.insert("affected", vec!["schema".to_string(), "test_cases".to_string()]);
        bag.insert("review", StateValue::Map(inner));

        let restored = StateBag::from_json(&bag.to_json().unwrap()).unwrap();
        assert_eq!(restored, bag);
        assert_eq!(restored.text_list("affected"), vec!["schema", "test_cases"]);
    }

    #[test]
    fn test_typed_getters_reject_other_kinds() {
        let mut bag = StateBag::new();
        bag.insert("count", 1_i64);
        assert_eq!(bag.text("count"), None);
        assert_eq!(bag.integer("count"), Some(1));
        assert_eq!(bag.flag("missing"), None);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = r#"{"x":{"kind":"float","value":1.5}}"#;
        assert!(StateBag::from_json(raw).is_err());
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = StateBag::new();
        base.insert("decision", "pending");
        let mut update = StateBag::new();
        update.insert("decision", "approved");
        base.merge(update);
        assert_eq!(base.text("decision"), Some("approved"));
    }
}
