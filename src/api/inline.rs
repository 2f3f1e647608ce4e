//! Blocks built from plain closures.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use super::block::{block_on_detached, Block};
use super::error::FlowError;
use crate::core::state::{ChatPrompt, Context, KvData, State, OUTPUT_KEY};
use crate::core::store::Store;

/// The loose return shapes an inline function may produce.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutput {
    /// Used as-is.
    State(State),
    /// Becomes key-value state.
    Map(HashMap<String, String>),
    /// Becomes `{_out_0: text}`.
    Text(String),
    /// Becomes `{_out_0: .., _out_1: .., ...}`.
    List(Vec<String>),
}

impl BlockOutput {
    pub fn into_state(self) -> State {
        match self {
            BlockOutput::State(state) => state,
            BlockOutput::Map(map) => State::Data(KvData::from(map)),
            BlockOutput::Text(text) => State::Data(KvData::single(OUTPUT_KEY, text)),
            BlockOutput::List(values) => State::Data(KvData::outputs(values)),
        }
    }
}

impl From<State> for BlockOutput {
    fn from(state: State) -> Self {
        BlockOutput::State(state)
    }
}

impl From<ChatPrompt> for BlockOutput {
    fn from(prompt: ChatPrompt) -> Self {
        BlockOutput::State(State::Prompt(prompt))
    }
}

impl From<KvData> for BlockOutput {
    fn from(data: KvData) -> Self {
        BlockOutput::State(State::Data(data))
    }
}

impl From<HashMap<String, String>> for BlockOutput {
    fn from(map: HashMap<String, String>) -> Self {
        BlockOutput::Map(map)
    }
}

impl From<BTreeMap<String, String>> for BlockOutput {
    fn from(map: BTreeMap<String, String>) -> Self {
        BlockOutput::Map(map.into_iter().collect())
    }
}

impl From<String> for BlockOutput {
    fn from(text: String) -> Self {
        BlockOutput::Text(text)
    }
}

impl From<&str> for BlockOutput {
    fn from(text: &str) -> Self {
        BlockOutput::Text(text.to_string())
    }
}

impl From<Vec<String>> for BlockOutput {
    fn from(values: Vec<String>) -> Self {
        BlockOutput::List(values)
    }
}

impl From<Vec<&str>> for BlockOutput {
    fn from(values: Vec<&str>) -> Self {
        BlockOutput::List(values.into_iter().map(str::to_string).collect())
    }
}

type SyncFn =
    dyn Fn(Option<State>, &Context, &Store) -> Result<BlockOutput, FlowError> + Send + Sync;
type AsyncFn = dyn Fn(Option<State>, Context, Store) -> BoxFuture<'static, Result<BlockOutput, FlowError>>
    + Send
    + Sync;

enum InlineFn {
    Sync(Box<SyncFn>),
    Async(Box<AsyncFn>),
}

/// Wraps a caller-supplied function as a block.
///
/// Async functions receive owned [`Context`] and [`Store`] handles; clones
/// share the run's data, so writes are visible to later blocks.
///
/// ```
/// use prompt_flow::{Block, Context, FlowError, InlineBlock, State, Store};
///
/// let shout = InlineBlock::new(|state: Option<State>, _ctx: &Context, _store: &Store| {
///     let data = state.and_then(|s| s.as_data().cloned()).unwrap_or_default();
///     Ok::<_, FlowError>(data.get("_out_0").unwrap_or("").to_uppercase())
/// });
/// ```
pub struct InlineBlock {
    func: InlineFn,
    required_context_keys: BTreeSet<String>,
    name: &'static str,
}

impl InlineBlock {
    pub fn new<F, R>(func: F) -> Self
    where
        F: Fn(Option<State>, &Context, &Store) -> Result<R, FlowError> + Send + Sync + 'static,
        R: Into<BlockOutput>,
    {
        Self::from_fn(InlineFn::Sync(Box::new(move |state, context, store| {
            func(state, context, store).map(Into::into)
        })))
    }

    pub fn new_async<F, Fut, R>(func: F) -> Self
    where
        F: Fn(Option<State>, Context, Store) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, FlowError>> + Send + 'static,
        R: Into<BlockOutput>,
    {
        Self::from_fn(InlineFn::Async(Box::new(move |state, context, store| {
            let fut = func(state, context, store);
            Box::pin(async move { fut.await.map(Into::into) })
        })))
    }

    fn from_fn(func: InlineFn) -> Self {
        Self {
            func,
            required_context_keys: BTreeSet::new(),
            name: "InlineBlock",
        }
    }

    /// Declares the context keys the function reads.
    pub fn with_required_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_context_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the name shown in logs and errors.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    fn call_sync(
        &self,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<BlockOutput, FlowError> {
        match &self.func {
            InlineFn::Sync(func) => func(state, context, store),
            InlineFn::Async(func) => {
                tracing::warn!(block = self.name, "called forward on an async inline block");
                block_on_detached(func(state, context.clone(), store.clone()))
            }
        }
    }
}

#[async_trait]
impl Block for InlineBlock {
    fn name(&self) -> &'static str {
        self.name
    }

    fn forward(
        &self,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.call_sync(state, context, store)
            .map(BlockOutput::into_state)
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let output = match &self.func {
            InlineFn::Async(func) => func(state, context.clone(), store.clone()).await?,
            InlineFn::Sync(_) => {
                tracing::warn!(block = self.name, "called async_forward on a sync inline block");
                let context = context.clone();
                let store = store.clone();
                let this = Arc::clone(&self);
                tokio::task::spawn_blocking(move || this.call_sync(state, &context, &store))
                    .await
                    .map_err(|e| FlowError::Worker(e.to_string()))??
            }
        };
        Ok(output.into_state())
    }

    fn required_context_keys(&self) -> BTreeSet<String> {
        self.required_context_keys.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;

    fn run(block: &InlineBlock, state: Option<State>) -> State {
        block
            .forward(state, &Context::empty(), &Store::new())
            .unwrap()
    }

    #[test]
    fn state_output_passes_through() {
        let fixed = State::Data(KvData::single("_out_0", "Hello"));
        let expected = fixed.clone();
        let block = InlineBlock::new(move |_, _: &Context, _: &Store| Ok(fixed.clone()));
        let out = run(&block, Some(State::Data(KvData::single("_out_0", "World"))));
        assert_eq!(out, expected);
    }

    #[test]
    fn text_output_becomes_out_0() {
        let block = InlineBlock::new(|_, _: &Context, _: &Store| Ok("answer"));
        assert_eq!(run(&block, None), State::Data(KvData::single("_out_0", "answer")));
    }

    #[test]
    fn list_output_becomes_positional_keys() {
        let block = InlineBlock::new(|_, _: &Context, _: &Store| Ok(vec!["a", "b", "c"]));
        let out = run(&block, None);
        assert_eq!(out, State::Data(KvData::outputs(["a", "b", "c"])));
    }

    #[test]
    fn map_output_becomes_data() {
        let block = InlineBlock::new(|_, _: &Context, _: &Store| {
            Ok(HashMap::from([("k".to_string(), "v".to_string())]))
        });
        assert_eq!(run(&block, None), State::Data(KvData::single("k", "v")));
    }

    #[test]
    fn prompt_output_is_kept() {
        let block = InlineBlock::new(|_, _: &Context, _: &Store| {
            Ok(ChatPrompt::new(vec![Message::user("hi")]))
        });
        assert!(run(&block, None).as_prompt().is_some());
    }

    #[test]
    fn function_sees_context_and_store() {
        let block = InlineBlock::new(|_, ctx: &Context, store: &Store| {
            store.update("seen", State::Data(KvData::single("_out_0", "yes")));
            Ok(ctx.require("who")?.to_string())
        })
        .with_required_keys(["who"]);
        let store = Store::new();
        let out = block
            .forward(None, &Context::new([("who", "Ada")]), &store)
            .unwrap();
        assert_eq!(out, State::Data(KvData::single("_out_0", "Ada")));
        assert!(store.get_data("seen").is_ok());
        assert_eq!(
            block.required_context_keys(),
            BTreeSet::from(["who".to_string()])
        );
    }

    #[test]
    fn errors_propagate() {
        let block = InlineBlock::new(|_, ctx: &Context, _: &Store| {
            Ok(ctx.require("missing")?.to_string())
        });
        let err = block
            .forward(None, &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::KeyNotFound { .. }));
    }

    #[test]
    fn async_function_on_sync_path() {
        let block = InlineBlock::new_async(|_, ctx: Context, _| async move {
            tokio::task::yield_now().await;
            Ok::<_, FlowError>(format!("hello {}", ctx.require("name")?))
        });
        let out = block
            .forward(None, &Context::new([("name", "World")]), &Store::new())
            .unwrap();
        assert_eq!(out, State::Data(KvData::single("_out_0", "hello World")));
    }

    #[tokio::test]
    async fn async_function_on_async_path() {
        let block = Arc::new(InlineBlock::new_async(|state: Option<State>, _, _| async move {
            let data = state.and_then(|s| s.as_data().cloned()).unwrap_or_default();
            Ok::<_, FlowError>(vec![data.get("_out_0").unwrap_or("").to_string(), "tail".to_string()])
        }));
        let out = block
            .async_forward(
                Some(State::Data(KvData::single("_out_0", "head"))),
                &Context::empty(),
                &Store::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, State::Data(KvData::outputs(["head", "tail"])));
    }

    #[tokio::test]
    async fn sync_function_on_async_path() {
        let block = Arc::new(InlineBlock::new(|_, _: &Context, _: &Store| Ok("sync")).named("Sync"));
        assert_eq!(block.name(), "Sync");
        let out = block
            .async_forward(None, &Context::empty(), &Store::new())
            .await
            .unwrap();
        assert_eq!(out, State::Data(KvData::single("_out_0", "sync")));
    }
}
