//! Turning the terminal state of a run into its answer.

use super::error::FlowError;
use crate::core::state::{ChatPrompt, KvData, State, OUTPUT_KEY};

/// Converts the final state of a run into a single string.
///
/// Implementors supply one handler per state shape; `parse` dispatches.
pub trait OutputParser: Send + Sync {
    fn parse(&self, state: State) -> Result<String, FlowError> {
        match state {
            State::Prompt(prompt) => self.parse_prompt(prompt),
            State::Data(data) => self.parse_data(data),
        }
    }

    fn parse_prompt(&self, prompt: ChatPrompt) -> Result<String, FlowError>;

    fn parse_data(&self, data: KvData) -> Result<String, FlowError>;
}

/// Rejects prompt state and returns the `_out_0` value of key-value state.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOutputParser;

impl OutputParser for DefaultOutputParser {
    fn parse_prompt(&self, _prompt: ChatPrompt) -> Result<String, FlowError> {
        Err(FlowError::PromptOutput)
    }

    fn parse_data(&self, data: KvData) -> Result<String, FlowError> {
        data.require(OUTPUT_KEY).map(str::to_string)
    }
}
