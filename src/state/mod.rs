//! Run state: the key/value document stages read from and write into.
//!
//! The [`StateStore`] is owned by the scheduler for the lifetime of one run.
//! Stages only ever see a [`State`], an immutable copy taken at dispatch time,
//! and return a [`PartialState`] that the scheduler merges back.

mod store;

pub use store::{AccumulatedEntry, HistoryAction, HistoryEntry, StateStore};

use crate::errors::StageError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Name of a value in the run state.
pub type StateKey = String;

/// Keys and values returned by one stage invocation.
pub type PartialState = BTreeMap<StateKey, Value>;

/// Build a [`PartialState`] from `(key, value)` pairs.
pub fn partial<K: Into<StateKey>>(entries: impl IntoIterator<Item = (K, Value)>) -> PartialState {
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Merge policy for a state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Write-once per run epoch. A second write is a conflict.
    #[default]
    Singular,
    /// Last writer wins. Replacements are logged at warn level.
    Overwrite,
    /// Written by parallel branches; one entry per branch, in completion order.
    Accumulating,
}

/// Read-only view of the run state handed to a stage.
///
/// Accumulating keys appear as a JSON array of `{"branch": .., "value": ..}`
/// objects ordered by the time each branch result reached the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    values: BTreeMap<StateKey, Value>,
}

impl State {
    pub fn from_values(values: BTreeMap<StateKey, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a key a stage cannot proceed without.
    pub fn require(&self, key: &str) -> Result<&Value, StageError> {
        self.values
            .get(key)
            .ok_or_else(|| StageError::missing_input(key))
    }

    /// Deserialize a required key into a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, StageError> {
        let value = self.require(key)?;
        serde_json::from_value(value.clone())
            .map_err(|e| StageError::failed(format!("key '{}' has unexpected shape: {}", key, e)))
    }

    /// Values of an accumulating key as `(branch, value)` pairs in merge order.
    ///
    /// Returns an empty list when the key is unset or not accumulating.
    pub fn branch_values(&self, key: &str) -> Vec<(&str, &Value)> {
        let Some(Value::Array(entries)) = self.values.get(key) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let branch = entry.get("branch")?.as_str()?;
                let value = entry.get("value")?;
                Some((branch, value))
            })
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<StateKey, Value> {
        &self.values
    }

    pub fn into_values(self) -> BTreeMap<StateKey, Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_builder() {
        let p = partial([("a", json!(1)), ("b", json!("two"))]);
        assert_eq!(p.len(), 2);
        assert_eq!(p["b"], json!("two"));
    }

    #[test]
    fn test_require_missing_key() {
        let state = State::default();
        assert_eq!(
            state.require("profile").unwrap_err(),
            StageError::missing_input("profile")
        );
    }

    #[test]
    fn test_get_as_typed() {
        let state = State::from_values(partial([("score", json!(0.5))]));
        let score: f64 = state.get_as("score").unwrap();
        assert_eq!(score, 0.5);
        assert!(state.get_as::<String>("score").is_err());
    }

    #[test]
    fn test_branch_values() {
        let state = State::from_values(partial([(
            "sections",
            json!([
                {"branch": "b3", "value": "third"},
                {"branch": "b1", "value": "first"}
            ]),
        )]));
        let entries = state.branch_values("sections");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("b3", &json!("third")));
        assert!(state.branch_values("missing").is_empty());
    }

    #[test]
    fn test_state_serializes_transparently() {
        let state = State::from_values(partial([("x", json!(1))]));
        assert_eq!(serde_json::to_value(&state).unwrap(), json!({"x": 1}));
    }
}
