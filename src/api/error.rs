//! Error types for the library API.

use crate::core::message::Role;
use llm::error::LLMError;
use thiserror::Error;

/// Every way a block, a run, or the surrounding setup can fail.
///
/// The engine never retries: any error aborts the run and reaches the caller
/// unchanged.
#[derive(Error, Debug)]
pub enum FlowError {
    /// A block received a state of the wrong shape.
    #[error("Block '{block}' expected {expected} state, got {found} state")]
    ShapeMismatch {
        block: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A parallel branch returned something other than key-value state.
    #[error("Expected data state, got {found} state from branch {branch} of {total}")]
    BranchShapeMismatch {
        branch: usize,
        total: usize,
        found: &'static str,
    },

    /// A parallel branch returned other than exactly one value.
    #[error("Expected data with one key `_out_0`, got {found} keys from branch {branch} of {total}")]
    ArityMismatch {
        branch: usize,
        total: usize,
        found: usize,
    },

    /// A block that needs an input state was called without one.
    #[error("Block '{0}' received no state")]
    MissingState(String),

    /// A placeholder, context, store or state lookup failed.
    #[error("Key '{key}' not found in {location}")]
    KeyNotFound { key: String, location: &'static str },

    /// An existing key-value state key was written again.
    #[error("Key '{0}' already exists and cannot be overwritten")]
    WriteConflict(String),

    /// Something tried to write into the run context.
    #[error("Context is immutable, cannot write key '{0}'")]
    ImmutableContextWrite(String),

    /// A prompt modifier found no message of the role it rewrites.
    #[error("Could not find a {0} message to modify")]
    MissingMessage(Role),

    /// The run ended in prompt state where an answer was expected.
    #[error("Cannot parse a prompt state; the run must end in data state")]
    PromptOutput,

    /// The store namespace name is not one of `prompts`, `data`.
    #[error("Unknown store namespace '{0}'")]
    UnknownNamespace(String),

    /// An error originating from the underlying LLM backend.
    #[error("LLM backend error: {0}")]
    LLM(#[from] LLMError),

    /// A non-LLM reasoner or retriever failed.
    #[error("Reasoner error: {0}")]
    Reasoner(String),

    /// The API was used with an invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The config file is not valid TOML for [`Config`](crate::core::config::Config).
    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// An underlying file I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker thread or blocking task panicked or could not be started.
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl FlowError {
    pub(crate) fn key_not_found(key: impl Into<String>, location: &'static str) -> Self {
        FlowError::KeyNotFound {
            key: key.into(),
            location,
        }
    }

    pub(crate) fn shape_mismatch(
        block: impl Into<String>,
        expected: &'static str,
        found: &'static str,
    ) -> Self {
        FlowError::ShapeMismatch {
            block: block.into(),
            expected,
            found,
        }
    }
}
