use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use rhai::{Dynamic, Engine, Scope, Variant};
use serde_json::Value;

use crate::{
    capability::{Capability, CapabilityFilter, CapabilityId, CapabilityTable},
    config::ScriptConfig,
    engine::build_engine,
    error::{Error, Result, ScriptError},
    include::{IncludeResolver, Resolution},
    provider::SourceProvider,
    supervisor::{ExecutionHandle, Supervisor},
};

/// Immutable script session: source, allow-list, bindings, providers and limits.
///
/// Cloning is cheap. Every call to [`evaluate`](Session::evaluate) runs in its
/// own worker with a private snapshot of the bindings, so concurrent
/// evaluations never observe each other's variable assignments. Values bound
/// with [`SessionBuilder::with_shared_variable`] are the exception: all
/// evaluations see the same cell, and coordinating them is up to the host.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    source: String,
    filter: CapabilityFilter,
    capabilities: CapabilityTable,
    bindings: BTreeMap<String, Dynamic>,
    hidden: BTreeSet<String>,
    providers: Vec<Arc<dyn SourceProvider>>,
    config: ScriptConfig,
}

impl Session {
    /// Start configuring a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The raw, unresolved source text.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// The capability allow-list.
    pub fn filter(&self) -> &CapabilityFilter {
        &self.inner.filter
    }

    /// Execution limits.
    pub fn config(&self) -> &ScriptConfig {
        &self.inner.config
    }

    /// Names of the bindings visible to scripts, in sorted order.
    pub fn visible_bindings(&self) -> impl Iterator<Item = &str> {
        self.inner
            .bindings
            .keys()
            .filter(|name| !self.inner.hidden.contains(*name))
            .map(String::as_str)
    }

    /// Expand include directives in the session source.
    pub fn resolve(&self) -> Resolution {
        IncludeResolver::new(&self.inner.providers)
            .with_max_depth(self.inner.config.max_include_depth)
            .resolve_detailed(&self.inner.source)
    }

    /// Run the session on the current Tokio runtime.
    pub fn evaluate(&self) -> Result<ExecutionHandle> {
        Ok(Supervisor::current()?.execute(self, None))
    }

    /// Run the session, invoking `on_error` once if the script fails.
    pub fn evaluate_with<F>(&self, on_error: F) -> Result<ExecutionHandle>
    where
        F: FnOnce(&ScriptError) + Send + 'static,
    {
        Ok(Supervisor::current()?.execute(self, Some(Box::new(on_error))))
    }

    /// Fresh engine with the allowed capabilities installed.
    pub(crate) fn engine(&self) -> Engine {
        let mut engine = build_engine(&self.inner.config);
        self.inner
            .capabilities
            .install_allowed(&mut engine, &self.inner.filter);
        engine
    }

    /// Private scope snapshot for one execution, without hidden bindings.
    pub(crate) fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in &self.inner.bindings {
            if self.inner.hidden.contains(name) {
                tracing::debug!(binding = %name, "hidden binding skipped");
                continue;
            }
            scope.push_dynamic(name.as_str(), value.clone());
        }
        scope
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("source", &self.inner.source)
            .field("filter", &self.inner.filter)
            .field("capabilities", &self.inner.capabilities)
            .field("bindings", &self.inner.bindings.keys().collect::<Vec<_>>())
            .field("hidden", &self.inner.hidden)
            .field("providers", &self.inner.providers.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    filter: CapabilityFilter,
    capabilities: CapabilityTable,
    bindings: BTreeMap<String, Dynamic>,
    hidden: BTreeSet<String>,
    providers: Vec<Arc<dyn SourceProvider>>,
    config: ScriptConfig,
}

impl SessionBuilder {
    /// Offer a capability and allow it.
    pub fn capability(mut self, capability: impl Capability) -> Self {
        self.filter.register(capability.id());
        self.capabilities.offer(Arc::new(capability));
        self
    }

    /// Offer a capability without allowing it. It stays invisible unless its
    /// id is allowed through [`allow`](Self::allow) or [`expose`](Self::expose).
    pub fn offer(mut self, capability: impl Capability) -> Self {
        self.capabilities.offer(Arc::new(capability));
        self
    }

    /// Allow a capability identifier.
    pub fn allow(mut self, id: impl Into<CapabilityId>) -> Self {
        self.filter.register(id);
        self
    }

    /// Allow the capability keyed by host type `T`.
    pub fn expose<T: ?Sized + 'static>(self) -> Self {
        self.allow(CapabilityId::of::<T>())
    }

    /// Bind a host value. Its type is allowed automatically.
    pub fn with_variable<T: Variant + Clone>(self, name: impl Into<String>, value: T) -> Self {
        self.bind::<T>(name.into(), Dynamic::from(value))
    }

    /// Bind a host value that every evaluation shares and may mutate.
    ///
    /// The value sits in a locked cell; each access locks it, but nothing
    /// serialises whole scripts against each other.
    pub fn with_shared_variable<T: Variant + Clone>(
        self,
        name: impl Into<String>,
        value: T,
    ) -> Self {
        self.bind::<T>(name.into(), Dynamic::from(value).into_shared())
    }

    /// Bind JSON data as native script values (maps, arrays, strings, numbers).
    pub fn with_json_variable(mut self, name: impl Into<String>, value: Value) -> Result<Self> {
        let name = name.into();
        let value = rhai::serde::to_dynamic(value).map_err(|err| Error::InvalidBinding {
            name: name.clone(),
            message: err.to_string(),
        })?;
        self.bindings.insert(name, value);
        Ok(self)
    }

    /// Keep a binding out of script visibility.
    pub fn hide(mut self, name: impl Into<String>) -> Self {
        self.hidden.insert(name.into());
        self
    }

    /// Append an include provider. Earlier providers take precedence.
    pub fn with_provider(mut self, provider: impl SourceProvider) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Set the wall-clock budget for each evaluation.
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.config.max_runtime = max_runtime;
        self
    }

    /// Replace all execution limits.
    pub fn with_config(mut self, config: ScriptConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish the session around `source`.
    pub fn build(self, source: impl Into<String>) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                source: source.into(),
                filter: self.filter,
                capabilities: self.capabilities,
                bindings: self.bindings,
                hidden: self.hidden,
                providers: self.providers,
                config: self.config,
            }),
        }
    }

    fn bind<T: 'static>(mut self, name: String, value: Dynamic) -> Self {
        self.filter.register(CapabilityId::of::<T>());
        self.bindings.insert(name, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        capability::TypeCapability, config::DEFAULT_MAX_RUNTIME, provider::MemoryProvider,
    };

    #[derive(Debug, Clone)]
    struct Account {
        balance: i64,
    }

    #[test]
    fn defaults_apply() {
        let session = Session::builder().build("1 + 1");
        assert_eq!(session.source(), "1 + 1");
        assert_eq!(session.config().max_runtime, DEFAULT_MAX_RUNTIME);
        assert!(session.filter().is_empty());
    }

    #[test]
    fn variables_allow_their_type() {
        let session = Session::builder()
            .with_variable("account", Account { balance: 5 })
            .build("account");
        assert!(session.filter().is_allowed(CapabilityId::of::<Account>().as_str()));
    }

    #[test]
    fn offered_capabilities_stay_hidden_until_allowed() {
        let surface = || {
            TypeCapability::<Account>::new(|engine| {
                engine.register_fn("open_account", || Account { balance: 3 });
                engine.register_get("balance", |a: &mut Account| a.balance);
            })
        };
        let offered = Session::builder().offer(surface()).build("");
        assert!(offered.filter().is_empty());
        assert!(offered.engine().eval::<i64>("open_account().balance").is_err());

        let allowed = Session::builder()
            .offer(surface())
            .expose::<Account>()
            .with_variable("account", Account { balance: 9 })
            .build("");
        let engine = allowed.engine();
        assert_eq!(engine.eval::<i64>("open_account().balance").unwrap(), 3);
        let mut scope = allowed.scope();
        let value = engine
            .eval_with_scope::<i64>(&mut scope, "account.balance")
            .unwrap();
        assert_eq!(value, 9);
    }

    #[test]
    fn hidden_bindings_are_not_in_scope() {
        let session = Session::builder()
            .with_variable("visible", 1_i64)
            .with_variable("secret", 2_i64)
            .hide("secret")
            .build("");
        let scope = session.scope();
        assert!(scope.contains("visible"));
        assert!(!scope.contains("secret"));
        assert_eq!(session.visible_bindings().collect::<Vec<_>>(), vec!["visible"]);
    }

    #[test]
    fn bound_values_always_reach_the_scope() {
        let session = Session::builder()
            .with_variable("account", Account { balance: 4 })
            .with_json_variable("args", json!([1, 2]))
            .unwrap()
            .build("");
        assert!(session.filter().is_allowed(CapabilityId::of::<Account>().as_str()));
        let scope = session.scope();
        assert!(scope.contains("account"));
        assert!(scope.contains("args"));
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn scopes_are_independent_snapshots() {
        let session = Session::builder().with_variable("n", 1_i64).build("");
        let engine = session.engine();
        let mut first = session.scope();
        engine.run_with_scope(&mut first, "n = 100;").unwrap();
        let second = session.scope();
        assert_eq!(second.get_value::<i64>("n"), Some(1));
    }

    #[test]
    fn shared_variables_share_state() {
        let session = Session::builder()
            .with_shared_variable("hits", 0_i64)
            .build("");
        let engine = session.engine();
        let mut first = session.scope();
        engine.run_with_scope(&mut first, "hits += 1;").unwrap();
        let mut second = session.scope();
        engine.run_with_scope(&mut second, "hits += 1;").unwrap();
        assert_eq!(session.scope().get_value::<i64>("hits"), Some(2));
    }

    #[test]
    fn json_variables_become_native_values() {
        let session = Session::builder()
            .with_json_variable("args", json!({"name": "ada", "n": 3}))
            .unwrap()
            .build("");
        let engine = session.engine();
        let mut scope = session.scope();
        let name = engine
            .eval_with_scope::<String>(&mut scope, "args.name")
            .unwrap();
        assert_eq!(name, "ada");
    }

    #[test]
    fn resolve_uses_session_providers() {
        let session = Session::builder()
            .with_provider(
                MemoryProvider::new("lib/a")
                    .unwrap()
                    .with_source("lib/a", "let a = 1;"),
            )
            .build("#include lib/a\na + 1");
        let resolution = session.resolve();
        assert_eq!(resolution.text, "let a = 1;\na + 1");
        assert!(resolution.unresolved.is_empty());
    }
}
