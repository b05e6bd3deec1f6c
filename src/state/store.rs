use super::{KeyPolicy, PartialState, State, StateKey};
use crate::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Writer name recorded for keys supplied as run input.
pub const INPUT_WRITER: &str = "input";
/// Writer name recorded for keys replaced through a resume override.
pub const OVERRIDE_WRITER: &str = "override";

/// One branch's contribution to an accumulating key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedEntry {
    pub branch: String,
    pub group: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Seed,
    Write,
    Override,
    Clear,
}

/// Append-only record of a state mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub action: HistoryAction,
    pub writer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub keys: Vec<StateKey>,
    pub timestamp: DateTime<Utc>,
}

/// Accumulating key/value store for one run.
///
/// Every mutation is all-or-nothing: a write that violates a key policy
/// leaves the store untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStore {
    policies: BTreeMap<StateKey, KeyPolicy>,
    values: BTreeMap<StateKey, Value>,
    writers: BTreeMap<StateKey, String>,
    accumulated: BTreeMap<StateKey, Vec<AccumulatedEntry>>,
    history: Vec<HistoryEntry>,
}

impl StateStore {
    /// Create an empty store. Keys without a declared policy are singular.
    pub fn new(policies: BTreeMap<StateKey, KeyPolicy>) -> Self {
        Self {
            policies,
            ..Default::default()
        }
    }

    pub fn policy(&self, key: &str) -> KeyPolicy {
        self.policies.get(key).copied().unwrap_or_default()
    }

    /// Write the run input. Input keys are recorded as written by `input`.
    pub fn seed(&mut self, input: PartialState) -> Result<()> {
        self.write(INPUT_WRITER, input, None, HistoryAction::Seed)
    }

    pub fn get(&self, key: &str) -> Result<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| OrchestratorError::MissingKey(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merge one stage's output into the store.
    ///
    /// `group` is the parallel group the writer belongs to. Accumulating keys
    /// may only be written from inside a group; singular keys may be written
    /// once; overwrite keys replace the previous value.
    pub fn set_many(&mut self, writer: &str, partial: PartialState, group: Option<&str>) -> Result<()> {
        self.write(writer, partial, group, HistoryAction::Write)
    }

    fn write(
        &mut self,
        writer: &str,
        partial: PartialState,
        group: Option<&str>,
        action: HistoryAction,
    ) -> Result<()> {
        for key in partial.keys() {
            self.check_write(writer, key, group)?;
        }
        if partial.is_empty() {
            return Ok(());
        }

        let keys: Vec<StateKey> = partial.keys().cloned().collect();
        for (key, value) in partial {
            match self.policy(&key) {
                KeyPolicy::Accumulating => {
                    // check_write guarantees a group here
                    let group = group.unwrap_or_default().to_string();
                    self.accumulated
                        .entry(key.clone())
                        .or_default()
                        .push(AccumulatedEntry {
                            branch: writer.to_string(),
                            group,
                            value,
                        });
                    self.materialize(&key);
                }
                KeyPolicy::Overwrite => {
                    if let Some(previous) = self.writers.get(&key)
                        && previous != writer
                    {
                        tracing::warn!(
                            key = %key,
                            previous = %previous,
                            writer,
                            "overwriting state key written by another stage"
                        );
                    }
                    self.values.insert(key.clone(), value);
                    self.writers.insert(key, writer.to_string());
                }
                KeyPolicy::Singular => {
                    self.values.insert(key.clone(), value);
                    self.writers.insert(key, writer.to_string());
                }
            }
        }

        self.record(action, writer, group, keys);
        Ok(())
    }

    fn check_write(&self, writer: &str, key: &str, group: Option<&str>) -> Result<()> {
        match self.policy(key) {
            KeyPolicy::Accumulating => {
                if group.is_none() {
                    return Err(OrchestratorError::AccumulatingOutsideGroup {
                        key: key.to_string(),
                        writer: writer.to_string(),
                    });
                }
                let already = self
                    .accumulated
                    .get(key)
                    .is_some_and(|entries| entries.iter().any(|e| e.branch == writer));
                if already {
                    return Err(OrchestratorError::StateConflict {
                        key: key.to_string(),
                        existing: writer.to_string(),
                        writer: writer.to_string(),
                    });
                }
            }
            KeyPolicy::Singular => {
                if let Some(existing) = self.writers.get(key) {
                    return Err(OrchestratorError::StateConflict {
                        key: key.to_string(),
                        existing: existing.clone(),
                        writer: writer.to_string(),
                    });
                }
            }
            KeyPolicy::Overwrite => {}
        }
        Ok(())
    }

    /// Replace a key's value on behalf of the caller of a resume.
    ///
    /// Accumulating keys are rejected: their value is derived from branch
    /// results and is rebuilt when the group re-runs.
    pub fn apply_override(&mut self, key: &str, value: Value) -> Result<()> {
        if self.policy(key) == KeyPolicy::Accumulating {
            return Err(OrchestratorError::InvalidOverride {
                key: key.to_string(),
                reason: "accumulating keys are merged from branch results".to_string(),
            });
        }
        self.values.insert(key.to_string(), value);
        self.writers
            .insert(key.to_string(), OVERRIDE_WRITER.to_string());
        self.record(
            HistoryAction::Override,
            OVERRIDE_WRITER,
            None,
            vec![key.to_string()],
        );
        Ok(())
    }

    /// Remove everything `stage` contributed under the given keys.
    ///
    /// Singular and overwrite keys are removed outright. Accumulating keys
    /// only lose the entry addressed by `stage`, so sibling branches survive.
    /// Returns the keys that changed.
    pub fn clear_stage_outputs(&mut self, stage: &str, keys: &[StateKey]) -> Vec<StateKey> {
        let mut cleared = Vec::new();
        for key in keys {
            match self.policy(key) {
                KeyPolicy::Accumulating => {
                    let Some(entries) = self.accumulated.get_mut(key) else {
                        continue;
                    };
                    let before = entries.len();
                    entries.retain(|e| e.branch != stage);
                    if entries.len() != before {
                        self.materialize(key);
                        cleared.push(key.clone());
                    }
                }
                KeyPolicy::Singular | KeyPolicy::Overwrite => {
                    if self.values.remove(key).is_some() {
                        self.writers.remove(key);
                        cleared.push(key.clone());
                    }
                }
            }
        }
        if !cleared.is_empty() {
            self.record(HistoryAction::Clear, stage, None, cleared.clone());
        }
        cleared
    }

    /// What `stage` last contributed under `keys`, for repair feedback.
    pub fn stage_output(&self, stage: &str, keys: &[StateKey]) -> PartialState {
        let mut output = PartialState::new();
        for key in keys {
            match self.policy(key) {
                KeyPolicy::Accumulating => {
                    if let Some(entry) = self
                        .accumulated
                        .get(key)
                        .and_then(|entries| entries.iter().find(|e| e.branch == stage))
                    {
                        output.insert(key.clone(), entry.value.clone());
                    }
                }
                KeyPolicy::Singular | KeyPolicy::Overwrite => {
                    if self.writers.get(key).is_some_and(|w| w == stage)
                        && let Some(value) = self.values.get(key)
                    {
                        output.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        output
    }

    /// Snapshot of the current values for handing to a stage.
    pub fn view(&self) -> State {
        State::from_values(self.values.clone())
    }

    pub fn writer_of(&self, key: &str) -> Option<&str> {
        self.writers.get(key).map(String::as_str)
    }

    pub fn accumulated(&self, key: &str) -> &[AccumulatedEntry] {
        self.accumulated
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
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

    fn materialize(&mut self, key: &str) {
        let entries = self.accumulated.get(key).filter(|e| !e.is_empty());
        match entries {
            Some(entries) => {
                let list = entries
                    .iter()
                    .map(|e| json!({ "branch": e.branch, "value": e.value }))
                    .collect();
                self.values.insert(key.to_string(), Value::Array(list));
            }
            None => {
                self.values.remove(key);
                self.accumulated.remove(key);
            }
        }
    }

    fn record(&mut self, action: HistoryAction, writer: &str, group: Option<&str>, keys: Vec<StateKey>) {
        self.history.push(HistoryEntry {
            seq: self.history.len() as u64 + 1,
            action,
            writer: writer.to_string(),
            group: group.map(str::to_string),
            keys,
            timestamp: Utc::now(),
        });
    }
}
