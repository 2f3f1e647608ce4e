//! Blocks, composites and the run entry points.

pub mod block;
pub mod blocks;
pub mod error;
pub mod inline;
pub mod llm_bridge;
pub mod modifier;
pub mod output;
pub mod reasoner;
pub mod runner;

pub use block::{Block, BlockExt, BlockRef};
pub use blocks::{Identity, LoadState, PromptBuilder, SaveState, Squash};
pub use error::FlowError;
pub use inline::{BlockOutput, InlineBlock};
pub use llm_bridge::LlmReasoner;
pub use modifier::{
    InjectInto, ModifierBlock, PromptModifier, RetrievalAugmenter, RetrievedChunk, Retriever,
};
pub use output::{DefaultOutputParser, OutputParser};
pub use reasoner::{Reasoner, ReasonerBlock};
pub use runner::{Parallel, Pipeline};

use crate::core::store::Usage;
use serde::Serialize;

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutput {
    /// The value extracted by the pipeline's output parser.
    pub answer: String,
    /// Tokens spent by every reasoner in the run.
    pub usage: Usage,
}
