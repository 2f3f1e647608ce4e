//! Built-in blocks: pass-through, squash, prompt building and store access.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::block::{expect_data, expect_state, Block};
use super::error::FlowError;
use crate::core::message::Message;
use crate::core::state::{output_key, ChatPrompt, Context, KvData, State, OUTPUT_KEY};
use crate::core::store::{Namespace, Store};
use crate::core::utils::{placeholder_names, render_named, render_positional};

// --- Identity ---

/// Returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

#[async_trait]
impl Block for Identity {
    fn forward(
        &self,
        state: Option<State>,
        _context: &Context,
        _store: &Store,
    ) -> Result<State, FlowError> {
        expect_state(state, self.name())
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.forward(state, context, store)
    }
}

// --- Squash ---

/// Collapses every value of a key-value state into one `_out_0` entry by
/// formatting `template` positionally (`{0}`, `{1}`, ... or `{}`).
///
/// Typically placed right after a [`Parallel`](super::runner::Parallel).
#[derive(Debug, Clone)]
pub struct Squash {
    template: String,
}

impl Squash {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl Block for Squash {
    fn forward(
        &self,
        state: Option<State>,
        _context: &Context,
        _store: &Store,
    ) -> Result<State, FlowError> {
        let data = expect_data(state, self.name())?;
        let values: Vec<&str> = data.values().collect();
        let squashed = render_positional(&self.template, &values)?;
        Ok(State::Data(KvData::single(OUTPUT_KEY, squashed)))
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.forward(state, context, store)
    }
}

// --- PromptBuilder ---

/// Renders message templates into a prompt state.
///
/// Each `{name}` placeholder is resolved, in order, from a state binding,
/// a store binding, and finally the run context. Bindings are declared with
/// [`from_state`](Self::from_state)/[`bind_state`](Self::bind_state) and
/// [`from_store`](Self::from_store)/[`bind_store`](Self::bind_store); only the
/// unbound placeholders are reported by `required_context_keys`.
///
/// ```
/// use prompt_flow::{Context, Message, PromptBuilder, Block, Store};
///
/// let builder = PromptBuilder::new(vec![Message::user("Hello {name}")]);
/// let ctx = Context::new([("name", "World")]);
/// let prompt = builder.forward(None, &ctx, &Store::new()).unwrap();
/// assert_eq!(prompt.as_prompt().unwrap().messages()[0].content(), "Hello World");
/// ```
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    messages: Vec<Message>,
    from_state: HashMap<String, String>,
    from_store: HashMap<String, String>,
    placeholders: BTreeSet<String>,
}

impl PromptBuilder {
    pub fn new(messages: Vec<Message>) -> Self {
        let placeholders = messages
            .iter()
            .flat_map(|m| placeholder_names(m.content()))
            .collect();
        Self {
            messages,
            from_state: HashMap::new(),
            from_store: HashMap::new(),
            placeholders,
        }
    }

    /// Binds placeholders positionally: the i-th name reads `_out_i` of the
    /// incoming state.
    pub fn from_state(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for (i, name) in names.into_iter().enumerate() {
            self.from_state.insert(name.into(), output_key(i));
        }
        self
    }

    /// Binds `placeholder` to `key` of the incoming state.
    pub fn bind_state(mut self, placeholder: impl Into<String>, key: impl Into<String>) -> Self {
        self.from_state.insert(placeholder.into(), key.into());
        self
    }

    /// Binds each placeholder to the `_out_0` value of the store data entry
    /// with the same name.
    pub fn from_store(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for name in names {
            let name = name.into();
            self.from_store.insert(name.clone(), name);
        }
        self
    }

    /// Binds `placeholder` to a store data entry. `path` is `key.field`, or a
    /// bare `key` meaning `key._out_0`.
    pub fn bind_store(mut self, placeholder: impl Into<String>, path: impl Into<String>) -> Self {
        self.from_store.insert(placeholder.into(), path.into());
        self
    }

    pub fn placeholders(&self) -> &BTreeSet<String> {
        &self.placeholders
    }

    fn resolve_store(store: &Store, path: &str) -> Result<String, FlowError> {
        let (key, field) = path.split_once('.').unwrap_or((path, OUTPUT_KEY));
        let data = store.get_data(key)?;
        data.get(field)
            .map(str::to_string)
            .ok_or_else(|| FlowError::key_not_found(path, "store data"))
    }
}

#[async_trait]
impl Block for PromptBuilder {
    fn forward(
        &self,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let data = state.map(|s| s.into_data(self.name())).transpose()?;

        let mut values = HashMap::with_capacity(self.placeholders.len());
        for name in &self.placeholders {
            let value = if let Some(key) = self.from_state.get(name) {
                let data = data
                    .as_ref()
                    .ok_or_else(|| FlowError::shape_mismatch(self.name(), "data", "no"))?;
                data.require(key)?.to_string()
            } else if let Some(path) = self.from_store.get(name) {
                Self::resolve_store(store, path)?
            } else {
                context.require(name)?.to_string()
            };
            values.insert(name.clone(), value);
        }

        let messages = self
            .messages
            .iter()
            .map(|m| Ok(m.rewritten(render_named(m.content(), &values)?)))
            .collect::<Result<Vec<_>, FlowError>>()?;
        Ok(State::Prompt(ChatPrompt::new(messages)))
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
        self.placeholders
            .iter()
            .filter(|n| !self.from_state.contains_key(*n) && !self.from_store.contains_key(*n))
            .cloned()
            .collect()
    }
}

// --- SaveState / LoadState ---

/// Copies the running state into the store under `key` and passes it on.
#[derive(Debug, Clone)]
pub struct SaveState {
    key: String,
}

impl SaveState {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Block for SaveState {
    fn forward(
        &self,
        state: Option<State>,
        _context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        let state = expect_state(state, self.name())?;
        tracing::debug!(key = %self.key, shape = state.kind(), "saving state");
        store.update(self.key.clone(), state.clone());
        Ok(state)
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.forward(state, context, store)
    }
}

/// Replaces the running state with a state saved earlier in the run.
#[derive(Debug, Clone)]
pub struct LoadState {
    namespace: Namespace,
    key: String,
}

impl LoadState {
    /// `namespace` must be `"prompts"` or `"data"`.
    pub fn new(namespace: &str, key: impl Into<String>) -> Result<Self, FlowError> {
        match namespace.parse::<Namespace>()? {
            ns @ (Namespace::Prompts | Namespace::Data) => Ok(Self {
                namespace: ns,
                key: key.into(),
            }),
            Namespace::Misc => Err(FlowError::UnknownNamespace(namespace.to_string())),
        }
    }

    pub fn prompts(key: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Prompts,
            key: key.into(),
        }
    }

    pub fn data(key: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Data,
            key: key.into(),
        }
    }
}

#[async_trait]
impl Block for LoadState {
    fn forward(
        &self,
        _state: Option<State>,
        _context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        tracing::debug!(namespace = %self.namespace, key = %self.key, "loading state");
        store.get_state(self.namespace, &self.key)
    }

    async fn async_forward(
        self: Arc<Self>,
        state: Option<State>,
        context: &Context,
        store: &Store,
    ) -> Result<State, FlowError> {
        self.forward(state, context, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> State {
        State::Data(KvData::from_pairs(pairs.iter().copied()).unwrap())
    }

    fn first_content(state: &State) -> &str {
        state.as_prompt().unwrap().messages()[0].content()
    }

    #[test]
    fn identity_passes_state_through() {
        let state = data(&[("_out_0", "Hello")]);
        let out = Identity
            .forward(Some(state.clone()), &Context::empty(), &Store::new())
            .unwrap();
        assert_eq!(out, state);
    }

    #[test]
    fn identity_without_state_fails() {
        let err = Identity
            .forward(None, &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::MissingState(name) if name == "Identity"));
    }

    #[test]
    fn squash_formats_values_in_order() {
        let out = Squash::new("{0} {1}")
            .forward(
                Some(data(&[("_out_0", "Hello"), ("_out_1", "World")])),
                &Context::empty(),
                &Store::new(),
            )
            .unwrap();
        assert_eq!(out, data(&[("_out_0", "Hello World")]));
    }

    #[test]
    fn squash_rejects_prompt_state() {
        let prompt = State::Prompt(ChatPrompt::new(vec![Message::user("x")]));
        let err = Squash::new("{0}")
            .forward(Some(prompt), &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch { expected: "data", .. }));
    }

    #[test]
    fn squash_missing_position_fails() {
        let err = Squash::new("{0} {1}")
            .forward(Some(data(&[("_out_0", "a")])), &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::KeyNotFound { .. }));
    }

    #[test]
    fn prompt_builder_reads_state_binding() {
        let pb = PromptBuilder::new(vec![Message::new("Hello {name}")]).from_state(["name"]);
        let out = pb
            .forward(
                Some(data(&[("_out_0", "World")])),
                &Context::new([("name", "Context")]),
                &Store::new(),
            )
            .unwrap();
        assert_eq!(first_content(&out), "Hello World");
    }

    #[test]
    fn prompt_builder_falls_back_to_context() {
        let pb = PromptBuilder::new(vec![
            Message::system("You greet {name}."),
            Message::user("Say hi to {name} in {lang}"),
        ]);
        let ctx = Context::new([("name", "Ada"), ("lang", "French")]);
        let out = pb.forward(None, &ctx, &Store::new()).unwrap();
        let prompt = out.as_prompt().unwrap();
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt.messages()[0].content(), "You greet Ada.");
        assert_eq!(prompt.messages()[0].role(), crate::core::message::Role::System);
        assert_eq!(prompt.messages()[1].content(), "Say hi to Ada in French");
    }

    #[test]
    fn prompt_builder_reads_store_binding() {
        let store = Store::new();
        store.update("profile", data(&[("city", "Paris"), ("_out_0", "Ada")]));
        let pb = PromptBuilder::new(vec![Message::user("{who} lives in {city}")])
            .bind_store("city", "profile.city")
            .bind_store("who", "profile");
        let out = pb.forward(None, &Context::empty(), &store).unwrap();
        assert_eq!(first_content(&out), "Ada lives in Paris");
    }

    #[test]
    fn prompt_builder_state_wins_over_store_and_context() {
        let store = Store::new();
        store.update("x", data(&[("_out_0", "from store")]));
        let pb = PromptBuilder::new(vec![Message::user("{x}")])
            .bind_state("x", "_out_0")
            .bind_store("x", "x");
        let out = pb
            .forward(
                Some(data(&[("_out_0", "from state")])),
                &Context::new([("x", "from context")]),
                &store,
            )
            .unwrap();
        assert_eq!(first_content(&out), "from state");
    }

    #[test]
    fn prompt_builder_unresolved_placeholder_fails() {
        let pb = PromptBuilder::new(vec![Message::user("Hello {name}")]);
        let err = pb
            .forward(None, &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::KeyNotFound { ref key, location: "context" } if key == "name"
        ));
    }

    #[test]
    fn prompt_builder_state_binding_without_state_fails() {
        let pb = PromptBuilder::new(vec![Message::user("{a}")]).from_state(["a"]);
        let err = pb
            .forward(None, &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch { found: "no", .. }));
    }

    #[test]
    fn prompt_builder_required_keys_exclude_bound_names() {
        let pb = PromptBuilder::new(vec![Message::user("{a} {b} {c} {{d}}")])
            .from_state(["a"])
            .from_store(["b"]);
        assert_eq!(
            pb.required_context_keys(),
            BTreeSet::from(["c".to_string()])
        );
    }

    #[test]
    fn save_state_stores_and_passes_through() {
        let store = Store::new();
        let state = data(&[("_out_0", "Hello")]);
        let out = SaveState::new("key")
            .forward(Some(state.clone()), &Context::empty(), &store)
            .unwrap();
        assert_eq!(out, state);
        assert_eq!(State::Data(store.get_data("key").unwrap()), state);
    }

    #[test]
    fn save_state_routes_prompts() {
        let store = Store::new();
        let prompt = State::Prompt(ChatPrompt::new(vec![Message::user("q")]));
        SaveState::new("p")
            .forward(Some(prompt.clone()), &Context::empty(), &store)
            .unwrap();
        assert!(store.contains(Namespace::Prompts, "p"));
        assert!(!store.contains(Namespace::Data, "p"));
    }

    #[test]
    fn load_state_ignores_running_state() {
        let store = Store::new();
        let saved = data(&[("_out_0", "Hello")]);
        store.update("key", saved.clone());
        let out = LoadState::new("data", "key")
            .unwrap()
            .forward(Some(data(&[("other", "x")])), &Context::empty(), &store)
            .unwrap();
        assert_eq!(out, saved);
    }

    #[test]
    fn load_state_missing_key_fails() {
        let err = LoadState::prompts("absent")
            .forward(None, &Context::empty(), &Store::new())
            .unwrap_err();
        assert!(matches!(err, FlowError::KeyNotFound { location: "store prompts", .. }));
    }

    #[test]
    fn load_state_rejects_unknown_namespace() {
        assert!(matches!(
            LoadState::new("context", "k"),
            Err(FlowError::UnknownNamespace(_))
        ));
        assert!(matches!(
            LoadState::new("misc", "k"),
            Err(FlowError::UnknownNamespace(_))
        ));
    }

    #[tokio::test]
    async fn native_async_paths_match_sync() {
        let store = Store::new();
        let ctx = Context::new([("name", "World")]);
        let prompt = Arc::new(PromptBuilder::new(vec![Message::user("Hello {name}")]))
            .async_forward(None, &ctx, &store)
            .await
            .unwrap();
        assert_eq!(first_content(&prompt), "Hello World");

        let squashed = Arc::new(Squash::new("{}!"))
            .async_forward(Some(data(&[("_out_0", "hi")])), &ctx, &store)
            .await
            .unwrap();
        assert_eq!(squashed, data(&[("_out_0", "hi!")]));
    }
}
