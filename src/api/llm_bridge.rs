//! Bridge from the `llm` crate's providers to [`Reasoner`].

use async_trait::async_trait;
use llm::chat::ChatMessage;
use llm::LLMProvider;
use std::sync::Arc;

use super::block::block_on_detached;
use super::error::FlowError;
use super::reasoner::Reasoner;
use crate::core::config::Config;
use crate::core::message::Role;
use crate::core::state::ChatPrompt;
use crate::core::store::UsageMeter;

/// A reasoner backed by any `llm` chat provider.
pub struct LlmReasoner {
    provider: Box<dyn LLMProvider>,
}

impl LlmReasoner {
    pub fn new(provider: Box<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    /// Builds the provider registered under `[providers.<name>]`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, FlowError> {
        Ok(Self::new(config.build_provider(name)?))
    }

    async fn chat(&self, prompt: &ChatPrompt, usage: &UsageMeter) -> Result<String, FlowError> {
        let messages = to_chat_messages(prompt);
        let resp = self.provider.chat(&messages).await?;
        if let Some(counts) = resp.usage() {
            usage.increment(
                u64::from(counts.prompt_tokens),
                u64::from(counts.completion_tokens),
            );
        }
        Ok(resp.text().unwrap_or_default())
    }
}

/// `llm` chat requests carry only user and assistant turns; system and
/// untyped messages are sent as user turns.
fn to_chat_messages(prompt: &ChatPrompt) -> Vec<ChatMessage> {
    prompt
        .iter()
        .map(|message| match message.role() {
            Role::Assistant => ChatMessage::assistant().content(message.content()).build(),
            Role::User | Role::System | Role::Undefined => {
                ChatMessage::user().content(message.content()).build()
            }
        })
        .collect()
}

#[async_trait]
impl Reasoner for LlmReasoner {
    fn process_prompt(&self, prompt: &ChatPrompt, usage: &UsageMeter) -> Result<String, FlowError> {
        tracing::warn!("LLM providers are async, bridging from the sync path");
        block_on_detached(self.chat(prompt, usage))
    }

    async fn async_process_prompt(
        self: Arc<Self>,
        prompt: ChatPrompt,
        usage: UsageMeter,
    ) -> Result<String, FlowError> {
        self.chat(&prompt, &usage).await
    }
}
