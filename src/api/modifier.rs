//! Prompt-to-prompt rewriting stages, including retrieval augmentation.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::block::{expect_prompt, Block};
use super::error::FlowError;
use crate::core::message::Role;
use crate::core::state::{ChatPrompt, Context, State};
use crate::core::store::Store;
use crate::core::utils::render_named;

/// Rewrites a prompt before it reaches a reasoner.
pub trait PromptModifier: Send + Sync + 'static {
    fn modify(
        &self,
        prompt: ChatPrompt,
        context: &Context,
        store: &Store,
    ) -> Result<ChatPrompt, FlowError>;

    fn required_context_keys(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Runs a [`PromptModifier`] as a block. Input and output are prompt state.
pub struct ModifierBlock<M: PromptModifier> {
    modifier: M,
}

impl<M: PromptModifier> ModifierBlock<M> {
    pub fn new(modifier: M) -> Self {
        Self { modifier }
    }
}

#[async_trait]
impl<M: PromptModifier> Block for ModifierBlock<M> {
    fn forward(
        &self,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let prompt = expect_prompt(state, self.name())?;
        Ok(State::Prompt(self.modifier.modify(prompt, context, store)?))
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.forward(state, context, store)
    }

    fn required_context_keys(&self) -> BTreeSet<String> {
        self.modifier.required_context_keys()
    }
}

// --- Retrieval ---

/// One retrieved document chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl RetrievedChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: None,
            score: None,
        }
    }
}

/// Looks up the chunks most relevant to a query.
pub trait Retriever: Send + Sync + 'static {
    fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<RetrievedChunk>, FlowError>;
}

/// Which message receives the retrieved documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectInto {
    #[default]
    System,
    User,
}

impl InjectInto {
    fn role(self) -> Role {
        match self {
            InjectInto::System => Role::System,
            InjectInto::User => Role::User,
        }
    }
}

pub const DEFAULT_RAG_TEMPLATE: &str = "\n{original_message}\n\nRelevant documents:\n{documents}\n";

/// Queries a [`Retriever`] with the last message and folds the results into
/// the first system (or user) message via a template with
/// `{original_message}` and `{documents}` placeholders.
pub struct RetrievalAugmenter<R: Retriever> {
    retriever: R,
    limit: usize,
    inject_into: InjectInto,
    template: String,
}

impl<R: Retriever> RetrievalAugmenter<R> {
    pub fn new(retriever: R) -> Self {
        Self {
            retriever,
            limit: 5,
            inject_into: InjectInto::System,
            template: DEFAULT_RAG_TEMPLATE.to_string(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn inject_into(mut self, target: InjectInto) -> Self {
        self.inject_into = target;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn into_block(self) -> ModifierBlock<Self> {
        ModifierBlock::new(self)
    }
}

impl<R: Retriever> PromptModifier for RetrievalAugmenter<R> {
    fn modify(
        &self,
        prompt: ChatPrompt,
        _context: &Context,
        _store: &Store,
    ) -> Result<ChatPrompt, FlowError> {
        let target = self.inject_into.role();
        let query = prompt
            .last()
            .ok_or(FlowError::MissingMessage(target))?
            .content()
            .to_string();
        let position = prompt
            .iter()
            .position(|m| m.role() == target)
            .ok_or(FlowError::MissingMessage(target))?;

        let chunks = self.retriever.retrieve(&query, self.limit)?;
        tracing::debug!(chunks = chunks.len(), role = %target, "injecting retrieved documents");
        let documents = chunks
            .iter()
            .map(|c| serde_json::to_string(c).unwrap_or_else(|_| c.content.clone()))
            .collect::<Vec<_>>()
            .join("\n");

        let mut messages = prompt.into_messages();
        let values = HashMap::from([
            (
                "original_message".to_string(),
                messages[position].content().to_string(),
            ),
            ("documents".to_string(), documents),
        ]);
        let rewritten = render_named(&self.template, &values)?;
        messages[position] = messages[position].rewritten(rewritten);
        Ok(ChatPrompt::new(messages))
    }
}
