//! Run-scoped side channel: saved states by namespace plus token accounting.

use crate::api::error::FlowError;
use crate::core::state::{ChatPrompt, KvData, State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Token counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Accumulates token usage across every reasoner call of a run.
///
/// Clones share the same counters, so a meter can be handed to worker
/// threads without tying it to the borrow of the store.
#[derive(Debug, Clone, Default)]
pub struct UsageMeter {
    counters: Arc<Mutex<(u64, u64)>>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, prompt_tokens: u64, completion_tokens: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.0 += prompt_tokens;
        counters.1 += completion_tokens;
    }

    pub fn get_usage(&self) -> Usage {
        let (prompt_tokens, completion_tokens) =
            *self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One of the store's independent key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Prompts,
    Data,
    Misc,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Namespace::Prompts => "prompts",
            Namespace::Data => "data",
            Namespace::Misc => "misc",
        };
        f.write_str(s)
    }
}

impl FromStr for Namespace {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompts" => Ok(Namespace::Prompts),
            "data" => Ok(Namespace::Data),
            "misc" => Ok(Namespace::Misc),
            other => Err(FlowError::UnknownNamespace(other.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct Namespaces {
    prompts: HashMap<String, ChatPrompt>,
    data: HashMap<String, KvData>,
    misc: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct StoreInner {
    namespaces: Mutex<Namespaces>,
    usage: UsageMeter,
}

/// Mutable registry shared by every block of one run.
///
/// Writes go to the namespace matching the value's shape and replace any
/// previous entry under that key. Each read or write holds the lock for the
/// duration of that single operation.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        self.inner
            .namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Saves a state under `key` in the `prompts` or `data` namespace.
    pub fn update(&self, key: impl Into<String>, state: State) {
        let key = key.into();
        let mut ns = self.lock();
        match state {
            State::Prompt(prompt) => {
                ns.prompts.insert(key, prompt);
            }
            State::Data(data) => {
                ns.data.insert(key, data);
            }
        }
    }

    /// Saves an arbitrary value in the `misc` namespace.
    pub fn update_misc(&self, key: impl Into<String>, value: serde_json::Value) {
        self.lock().misc.insert(key.into(), value);
    }

    pub fn get_prompt(&self, key: &str) -> Result<ChatPrompt, FlowError> {
        self.lock()
            .prompts
            .get(key)
            .cloned()
            .ok_or_else(|| FlowError::key_not_found(key, "store prompts"))
    }

    pub fn get_data(&self, key: &str) -> Result<KvData, FlowError> {
        self.lock()
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| FlowError::key_not_found(key, "store data"))
    }

    pub fn get_misc(&self, key: &str) -> Result<serde_json::Value, FlowError> {
        self.lock()
            .misc
            .get(key)
            .cloned()
            .ok_or_else(|| FlowError::key_not_found(key, "store misc"))
    }

    /// Reads a saved state back from the `prompts` or `data` namespace.
    pub fn get_state(&self, namespace: Namespace, key: &str) -> Result<State, FlowError> {
        match namespace {
            Namespace::Prompts => self.get_prompt(key).map(State::Prompt),
            Namespace::Data => self.get_data(key).map(State::Data),
            Namespace::Misc => Err(FlowError::UnknownNamespace(namespace.to_string())),
        }
    }

    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        let ns = self.lock();
        match namespace {
            Namespace::Prompts => ns.prompts.contains_key(key),
            Namespace::Data => ns.data.contains_key(key),
            Namespace::Misc => ns.misc.contains_key(key),
        }
    }

    pub fn usage_meter(&self) -> &UsageMeter {
        &self.inner.usage
    }

    pub fn usage(&self) -> Usage {
        self.inner.usage.get_usage()
    }
}
