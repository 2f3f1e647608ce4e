//! Sequential and fan-out composites, and the run entry points.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::Instrument;

use super::block::{expect_state, Block, BlockRef};
use super::error::FlowError;
use super::output::{DefaultOutputParser, OutputParser};
use super::RunOutput;
use crate::core::config::Config;
use crate::core::state::{output_key, Context, KvData, State, OUTPUT_KEY};
use crate::core::store::Store;

// --- Pipeline ---

/// An ordered sequence of blocks, itself a block.
///
/// Each block receives the previous block's output. A nested pipeline shares
/// the context and store of the run that contains it; only [`Pipeline::run`]
/// and [`Pipeline::async_run`] create them.
pub struct Pipeline {
    blocks: Vec<BlockRef>,
    output_parser: Arc<dyn OutputParser>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            output_parser: Arc::new(DefaultOutputParser),
        }
    }

    /// Appends a block.
    pub fn then(mut self, block: impl Block) -> Self {
        self.blocks.push(Arc::new(block));
        self
    }

    /// Appends an already shared block.
    pub fn add_block(mut self, block: BlockRef) -> Self {
        self.blocks.push(block);
        self
    }

    /// Replaces the parser that turns the final state into the answer.
    pub fn with_output_parser(mut self, parser: impl OutputParser + 'static) -> Self {
        self.output_parser = Arc::new(parser);
        self
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[BlockRef] {
        &self.blocks
    }

    /// Fails on the first context key some block needs but `context` lacks.
    pub fn check_context(&self, context: &Context) -> Result<(), FlowError> {
        match self
            .required_context_keys()
            .into_iter()
            .find(|key| !context.contains_key(key))
        {
            Some(key) => Err(FlowError::key_not_found(key, "context")),
            None => Ok(()),
        }
    }

    /// Runs the pipeline synchronously with a fresh store.
    pub fn run(&self, state: Option<State>, context: Context) -> Result<RunOutput, FlowError> {
        let span = tracing::info_span!("run", mode = "sync", blocks = self.blocks.len());
        let _guard = span.enter();
        self.check_context(&context)?;
        let store = Store::new();
        let final_state = self.forward(state, &context, &store)?;
        self.finish(final_state, &store)
    }

    /// Runs the pipeline on the async path with a fresh store.
    pub async fn async_run(
        &self,
        state: Option<State>,
        context: Context,
    ) -> Result<RunOutput, FlowError> {
        let span = tracing::info_span!("run", mode = "async", blocks = self.blocks.len());
        async {
            self.check_context(&context)?;
            let store = Store::new();
            let final_state = self.forward_async(state, &context, &store).await?;
            self.finish(final_state, &store)
        }
        .instrument(span)
        .await
    }

    fn finish(&self, final_state: State, store: &Store) -> Result<RunOutput, FlowError> {
        let answer = self.output_parser.parse(final_state)?;
        let usage = store.usage();
        tracing::info!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "run finished"
        );
        Ok(RunOutput { answer, usage })
    }

    async fn forward_async(
        &self,
        mut state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        for (stage, block) in self.blocks.iter().enumerate() {
            tracing::debug!(stage, block = block.name(), "running block");
            state = Some(Arc::clone(block).async_forward(state, context, store).await?);
        }
        expect_state(state, self.name())
    }
}

#[async_trait]
impl Block for Pipeline {
    fn forward(
        &self,
        mut state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        for (stage, block) in self.blocks.iter().enumerate() {
            tracing::debug!(stage, block = block.name(), "running block");
            state = Some(block.forward(state, context, store)?);
        }
        expect_state(state, self.name())
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.forward_async(state, context, store).await
    }

    fn required_context_keys(&self) -> BTreeSet<String> {
        self.blocks
            .iter()
            .flat_map(|b| b.required_context_keys())
            .collect()
    }
}

// --- Parallel ---

/// Runs every branch on the same input and merges their answers.
///
/// Branch outputs are merged in declaration order into
/// `{_out_0: .., _out_1: .., ...}`; each branch must produce key-value state
/// holding exactly `_out_0`. If the first branch produces a prompt, that
/// prompt is returned and the other outputs are ignored.
///
/// All branches are awaited before any error is reported. When several fail,
/// the error of the lowest-indexed branch is returned.
pub struct Parallel {
    branches: Vec<BlockRef>,
    max_workers: Option<usize>,
}

impl Default for Parallel {
    fn default() -> Self {
        Self::new()
    }
}

impl Parallel {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            max_workers: None,
        }
    }

    /// Applies `[engine] max_parallel_workers` from the config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            branches: Vec::new(),
            max_workers: config.engine.max_parallel_workers,
        }
    }

    /// Adds a branch.
    pub fn with_parallel(mut self, block: impl Block) -> Self {
        self.branches.push(Arc::new(block));
        self
    }

    /// Adds an already shared branch.
    pub fn add_block(mut self, block: BlockRef) -> Self {
        self.branches.push(block);
        self
    }

    /// Caps how many branches run at once. Defaults to one per branch.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn branches(&self) -> &[BlockRef] {
        &self.branches
    }

    fn worker_limit(&self) -> usize {
        let total = self.branches.len().max(1);
        self.max_workers.unwrap_or(total).clamp(1, total)
    }
}

/// Fan-in in declaration order.
fn merge(results: Vec<Result<State, FlowError>>) -> Result<State, FlowError> {
    let total = results.len();
    let mut states = results.into_iter().collect::<Result<Vec<_>, _>>()?;

    if matches!(states.first(), Some(State::Prompt(_))) {
        tracing::debug!(total, "first branch returned a prompt, skipping merge");
        return Ok(states.swap_remove(0));
    }

    let mut merged = KvData::new();
    for (branch, state) in states.into_iter().enumerate() {
        let data = match state {
            State::Data(data) => data,
            other => {
                return Err(FlowError::BranchShapeMismatch {
                    branch,
                    total,
                    found: other.kind(),
                })
            }
        };
        if data.len() != 1 {
            return Err(FlowError::ArityMismatch {
                branch,
                total,
                found: data.len(),
            });
        }
        merged.update(output_key(branch), data.require(OUTPUT_KEY)?)?;
    }
    Ok(State::Data(merged))
}

#[async_trait]
impl Block for Parallel {
    fn forward(
        &self,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let total = self.branches.len();
        if total == 0 {
            return Ok(State::Data(KvData::new()));
        }

        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Result<State, FlowError>>>> =
            Mutex::new((0..total).map(|_| None).collect());
        let (next, slots_ref, state) = (&next, &slots, &state);

        std::thread::scope(|s| {
            let workers: Vec<_> = (0..self.worker_limit())
                .map(|_| {
                    s.spawn(move || loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(branch) = self.branches.get(index) else {
                            break;
                        };
                        tracing::debug!(branch = index, block = branch.name(), "running branch");
                        let result = branch.forward(state.clone(), context, store);
                        slots_ref.lock().unwrap_or_else(PoisonError::into_inner)[index] =
                            Some(result);
                    })
                })
                .collect();
            let joined: Vec<_> = workers.into_iter().map(|worker| worker.join()).collect();
            match joined.iter().filter(|j| j.is_err()).count() {
                0 => Ok(()),
                panicked => Err(FlowError::Worker(format!(
                    "{} parallel worker(s) panicked",
                    panicked
                ))),
            }
        })?;

        let results = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(FlowError::Worker(format!("branch {} produced no result", index)))
                })
            })
            .collect();
        merge(results)
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        if self.branches.is_empty() {
            return Ok(State::Data(KvData::new()));
        }

        let mut pending = Vec::with_capacity(self.branches.len());
        for (index, branch) in self.branches.iter().enumerate() {
            let branch = Arc::clone(branch);
            let state = state.clone();
            pending.push(async move {
                tracing::debug!(branch = index, block = branch.name(), "running branch");
                branch.async_forward(state, context, store).await
            });
        }

        let results: Vec<Result<State, FlowError>> = stream::iter(pending)
            .buffered(self.worker_limit())
            .collect()
            .await;
        merge(results)
    }

    fn required_context_keys(&self) -> BTreeSet<String> {
        self.branches
            .iter()
            .flat_map(|b| b.required_context_keys())
            .collect()
    }
}
