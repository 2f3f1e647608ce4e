//! Composable prompt pipelines.
//!
//! Blocks turn an evolving state (a chat prompt or a flat key-value map) into
//! a final answer. [`Pipeline`] runs blocks in order and [`Parallel`] fans one
//! input out to several blocks, merging their answers deterministically.
//!
//! ```
//! use prompt_flow::{BlockExt, Context, InlineBlock, Message, PromptBuilder, Squash, State, Store, FlowError};
//!
//! let render = InlineBlock::new(|state: Option<State>, _: &Context, _: &Store| {
//!     let prompt = state.and_then(|s| s.as_prompt().cloned()).unwrap_or_default();
//!     Ok::<_, FlowError>(prompt.iter().map(|m| m.content().to_string()).collect::<Vec<_>>())
//! });
//! let pipeline = PromptBuilder::new(vec![Message::user("Hello {name}")])
//!     .then(render)
//!     .then(Squash::new("{0}"));
//!
//! let out = pipeline.run(None, Context::new([("name", "World")])).unwrap();
//! assert_eq!(out.answer, "Hello World");
//! ```

pub mod api;
pub mod core;

pub use api::{
    Block, BlockExt, BlockOutput, BlockRef, DefaultOutputParser, FlowError, Identity, InjectInto,
    InlineBlock, LlmReasoner, LoadState, ModifierBlock, OutputParser, Parallel, Pipeline,
    PromptBuilder, PromptModifier, Reasoner, ReasonerBlock, RetrievalAugmenter, RetrievedChunk,
    Retriever, RunOutput, SaveState, Squash,
};
pub use crate::core::config::Config;
pub use crate::core::message::{Message, Role};
pub use crate::core::state::{ChatPrompt, Context, KvData, State, OUTPUT_KEY};
pub use crate::core::store::{Namespace, Store, Usage, UsageMeter};
