//! The contract for components that answer a prompt.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::block::{expect_prompt, Block};
use super::error::FlowError;
use crate::core::state::{ChatPrompt, Context, KvData, State, OUTPUT_KEY};
use crate::core::store::{Store, UsageMeter};

/// Turns a prompt into a single answer, recording the tokens it spends.
///
/// Implement `process_prompt` for blocking clients. Async clients should
/// also override `async_process_prompt`; the default runs `process_prompt`
/// on tokio's blocking pool.
#[async_trait]
pub trait Reasoner: Send + Sync + 'static {
    fn process_prompt(&self, prompt: &ChatPrompt, usage: &UsageMeter) -> Result<String, FlowError>;

    async fn async_process_prompt(
        self: Arc<Self>,
        prompt: ChatPrompt,
        usage: UsageMeter,
    ) -> Result<String, FlowError> {
        tracing::warn!("reasoner has no async implementation, using the blocking pool");
        tokio::task::spawn_blocking(move || self.process_prompt(&prompt, &usage))
            .await
            .map_err(|e| FlowError::Worker(e.to_string()))?
    }
}

/// Runs a [`Reasoner`] as a pipeline stage: prompt in, `{_out_0: answer}` out.
pub struct ReasonerBlock<R: Reasoner> {
    reasoner: Arc<R>,
}

impl<R: Reasoner> ReasonerBlock<R> {
    pub fn new(reasoner: R) -> Self {
        Self::from_arc(Arc::new(reasoner))
    }

    /// Shares one reasoner between several blocks.
    pub fn from_arc(reasoner: Arc<R>) -> Self {
        Self { reasoner }
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }
}

impl<R: Reasoner> From<R> for ReasonerBlock<R> {
    fn from(reasoner: R) -> Self {
        Self::new(reasoner)
    }
}

#[async_trait]
impl<R: Reasoner> Block for ReasonerBlock<R> {
    fn forward(
        &self,
        state: Option<State>,
        _context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let prompt = expect_prompt(state, self.name())?;
        let answer = self.reasoner.process_prompt(&prompt, store.usage_meter())?;
        Ok(State::Data(KvData::single(OUTPUT_KEY, answer)))
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        _context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let prompt = expect_prompt(state, self.name())?;
        let answer = Arc::clone(&self.reasoner)
            .async_process_prompt(prompt, store.usage_meter().clone())
            .await?;
        Ok(State::Data(KvData::single(OUTPUT_KEY, answer)))
    }

    fn required_context_keys(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}
