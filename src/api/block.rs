//! The unit of computation and the bridges between the sync and async paths.

use async_trait::async_trait;
use std::any::type_name;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use super::error::FlowError;
use super::runner::{Parallel, Pipeline};
use crate::core::state::{ChatPrompt, Context, KvData, State};
use crate::core::store::Store;

/// Shared handle to a block, as held by composites.
pub type BlockRef = Arc<dyn Block>;

/// A single step that maps the running state to a new state.
///
/// A block may read the [`Context`] and read or write the [`Store`]; it never
/// keeps either beyond the call. `forward` is the synchronous path and
/// `async_forward` the asynchronous one. A block that only implements
/// `forward` still works on the async path: the default `async_forward` runs
/// it on tokio's blocking pool and logs a warning.
#[async_trait]
pub trait Block: Send + Sync + 'static {
    /// Name used in logs and error messages.
    fn name(&self) -> &'static str {
        short_type_name::<Self>()
    }

    fn forward(
        &self,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError>;

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        tracing::warn!(
            block = self.name(),
            "block has no async implementation, running forward on the blocking pool"
        );
        let context = context.clone();
        let store = store.clone();
        tokio::task::spawn_blocking(move || self.forward(state, &context, &store))
            .await
            .map_err(|e| FlowError::Worker(e.to_string()))?
    }

    /// Context keys this block (and its children) will read.
    fn required_context_keys(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Graph-building helpers available on every block.
pub trait BlockExt: Block + Sized {
    /// Sequences `self` then `next` in a new pipeline.
    fn then(self, next: impl Block) -> Pipeline {
        Pipeline::new().then(self).then(next)
    }

    /// Fans the input out to `self` and `other` in a new parallel block.
    fn with_parallel(self, other: impl Block) -> Parallel {
        Parallel::new().with_parallel(self).with_parallel(other)
    }

    /// Wraps `self` in a one-block pipeline, e.g. to call `run` on it.
    fn into_pipeline(self) -> Pipeline {
        Pipeline::new().then(self)
    }
}

impl<B: Block> BlockExt for B {}

/// `path::to::Type<Arg>` becomes `Type`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

pub(crate) fn expect_state(state: Option<State>, block: &str) -> Result<State, FlowError> {
    state.ok_or_else(|| FlowError::MissingState(block.to_string()))
}

pub(crate) fn expect_prompt(state: Option<State>, block: &str) -> Result<ChatPrompt, FlowError> {
    match state {
        Some(s) => s.into_prompt(block),
        None => Err(FlowError::shape_mismatch(block, "prompt", "no")),
    }
}

pub(crate) fn expect_data(state: Option<State>, block: &str) -> Result<KvData, FlowError> {
    match state {
        Some(s) => s.into_data(block),
        None => Err(FlowError::shape_mismatch(block, "data", "no")),
    }
}

/// Drives an async computation to completion from synchronous code.
///
/// The future runs on a fresh single-threaded runtime owned by a scoped
/// helper thread, so this is safe to call whether or not the caller is
/// itself inside a tokio runtime.
pub(crate) fn block_on_detached<F, T>(fut: F) -> Result<T, FlowError>
where
    F: Future<Output = Result<T, FlowError>> + Send,
    T: Send,
{
    std::thread::scope(|s| {
        s.spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(fut)
        })
        .join()
        .map_err(|_| FlowError::Worker("async bridge thread panicked".to_string()))?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::blocks::Identity;

    struct Upper;

    impl Block for Upper {
        fn forward(
            &self,
            state: Option<State>,
            _context: &Context,
            _store: &Store,
        ) -> Result<State, FlowError> {
            let data = expect_data(state, self.name())?;
            let value = data.require("_out_0")?.to_uppercase();
            Ok(State::Data(KvData::single("_out_0", value)))
        }

        fn required_context_keys(&self) -> BTreeSet<String> {
            BTreeSet::from(["unused".to_string()])
        }
    }

    #[test]
    fn default_name_is_the_short_type_name() {
        assert_eq!(Upper.name(), "Upper");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[tokio::test]
    async fn sync_only_block_runs_on_async_path() {
        let out = Arc::new(Upper)
            .async_forward(
                Some(State::Data(KvData::single("_out_0", "abc"))),
                &Context::empty(),
                &Store::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, State::Data(KvData::single("_out_0", "ABC")));
    }

    #[tokio::test]
    async fn async_fallback_propagates_errors() {
        let err = Arc::new(Upper)
            .async_forward(None, &Context::empty(), &Store::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch { found: "no", .. }));
    }

    #[test]
    fn then_builds_a_pipeline_in_order() {
        let pipeline = Upper.then(Identity);
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.blocks()[0].name(), "Upper");
        assert_eq!(pipeline.blocks()[1].name(), "Identity");
    }

    #[test]
    fn with_parallel_builds_branches() {
        let parallel = Identity.with_parallel(Upper).with_parallel(Identity);
        assert_eq!(parallel.len(), 3);
        assert_eq!(parallel.branches()[1].name(), "Upper");
    }

    #[test]
    fn block_on_detached_runs_future() {
        let value = block_on_detached(async { Ok::<_, FlowError>(41 + 1) }).unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn block_on_detached_works_inside_a_runtime() {
        let value = block_on_detached(async {
            tokio::task::yield_now().await;
            Ok::<_, FlowError>("done")
        })
        .unwrap();
        assert_eq!(value, "done");
    }
}
