//! The values threaded through a run: prompt state, key-value state and the
//! read-only run context.

use crate::api::error::FlowError;
use crate::core::message::Message;
use serde::ser::{Serialize, Serializer};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Key of the first positional output.
pub const OUTPUT_KEY: &str = "_out_0";

/// Key of the `index`-th positional output (`_out_0`, `_out_1`, ...).
pub fn output_key(index: usize) -> String {
    format!("_out_{index}")
}

// --- ChatPrompt ---

/// An ordered list of messages; the input shape of a reasoner.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatPrompt {
    messages: Vec<Message>,
}

impl ChatPrompt {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// The `[{"role": .., "content": ..}, ...]` view handed to chat APIs.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.messages
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "role": m.role().to_string(),
                        "content": m.content(),
                    })
                })
                .collect(),
        )
    }
}

impl From<Vec<Message>> for ChatPrompt {
    fn from(messages: Vec<Message>) -> Self {
        Self::new(messages)
    }
}

// --- KvData ---

/// A flat string map whose keys are write-once.
///
/// Entries iterate in insertion order, which is the order positional
/// templates see them in. Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct KvData {
    entries: Vec<(String, String)>,
}

impl KvData {
    pub fn new() -> Self {
        Self::default()
    }

    /// A one-entry map.
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entries: vec![(key.into(), value.into())],
        }
    }

    /// Positional outputs keyed `_out_0.._out_{n-1}`.
    pub fn outputs(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            entries: values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (output_key(i), v.into()))
                .collect(),
        }
    }

    /// Builds a map from pairs, rejecting repeated keys.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self, FlowError> {
        let mut data = Self::new();
        for (k, v) in pairs {
            data.update(k, v)?;
        }
        Ok(data)
    }

    /// Inserts a new key. Existing keys are never overwritten.
    pub fn update(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), FlowError> {
        let key = key.into();
        if self.contains_key(&key) {
            return Err(FlowError::WriteConflict(key));
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`get`](Self::get) but fails with `KeyNotFound`.
    pub fn require(&self, key: &str) -> Result<&str, FlowError> {
        self.get(key)
            .ok_or_else(|| FlowError::key_not_found(key, "state"))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries.iter().cloned().collect()
    }
}

impl PartialEq for KvData {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for KvData {}

impl Serialize for KvData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl From<HashMap<String, String>> for KvData {
    fn from(map: HashMap<String, String>) -> Self {
        Self {
            entries: map.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for KvData {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self {
            entries: map.into_iter().collect(),
        }
    }
}

// --- State ---

/// The running value of a pipeline: exactly one of the two shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Prompt(ChatPrompt),
    Data(KvData),
}

impl State {
    /// Short shape name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            State::Prompt(_) => "prompt",
            State::Data(_) => "data",
        }
    }

    pub fn as_prompt(&self) -> Option<&ChatPrompt> {
        match self {
            State::Prompt(p) => Some(p),
            State::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&KvData> {
        match self {
            State::Data(d) => Some(d),
            State::Prompt(_) => None,
        }
    }

    /// Unwraps the prompt shape, reporting `block` on mismatch.
    pub fn into_prompt(self, block: &str) -> Result<ChatPrompt, FlowError> {
        match self {
            State::Prompt(p) => Ok(p),
            other => Err(FlowError::shape_mismatch(block, "prompt", other.kind())),
        }
    }

    /// Unwraps the key-value shape, reporting `block` on mismatch.
    pub fn into_data(self, block: &str) -> Result<KvData, FlowError> {
        match self {
            State::Data(d) => Ok(d),
            other => Err(FlowError::shape_mismatch(block, "data", other.kind())),
        }
    }
}

impl From<ChatPrompt> for State {
    fn from(prompt: ChatPrompt) -> Self {
        State::Prompt(prompt)
    }
}

impl From<KvData> for State {
    fn from(data: KvData) -> Self {
        State::Data(data)
    }
}

// --- Context ---

/// Caller-supplied values for one run. Never mutated once built; clones share
/// the same storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    values: Arc<KvData>,
}

impl Context {
    pub fn new(vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        let map: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: Arc::new(KvData::from(map)),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&str, FlowError> {
        self.get(key)
            .ok_or_else(|| FlowError::key_not_found(key, "context"))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Always fails: a context cannot change during a run.
    pub fn update(
        &self,
        key: impl Into<String>,
        _value: impl Into<String>,
    ) -> Result<(), FlowError> {
        Err(FlowError::ImmutableContextWrite(key.into()))
    }
}
