//! Default-deny capability allow-list and the host surfaces it gates.
//!
//! A [`Capability`] describes one surface a host can expose to scripts: usually
//! a host type together with the functions, getters and methods registered for
//! it. Surfaces are offered to a session through a [`CapabilityTable`] and only
//! reach the engine when their [`CapabilityId`] has been registered in the
//! session's [`CapabilityFilter`].

use std::{
    any::type_name,
    borrow::{Borrow, Cow},
    collections::BTreeSet,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use rhai::{Engine, Variant};

/// Identifier naming a host type or a named surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityId(Cow<'static, str>);

impl CapabilityId {
    /// Identifier for a host type, derived from its Rust type name.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(Cow::Borrowed(type_name::<T>()))
    }

    /// Identifier for an arbitrary named surface.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CapabilityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CapabilityId {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for CapabilityId {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Append-only allow-list of capability identifiers.
///
/// Nothing is allowed until it is registered, and nothing can be removed once
/// registered.
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    allowed: BTreeSet<CapabilityId>,
}

impl CapabilityFilter {
    /// Create an empty filter that denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow an identifier. Returns `false` if it was already allowed.
    pub fn register(&mut self, id: impl Into<CapabilityId>) -> bool {
        self.allowed.insert(id.into())
    }

    /// Check whether an identifier has been allowed.
    pub fn is_allowed(&self, id: &str) -> bool {
        self.allowed.contains(id)
    }

    /// Number of allowed identifiers.
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// Whether the filter allows nothing.
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Iterate allowed identifiers in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityId> {
        self.allowed.iter()
    }
}

/// A host surface that can be installed into a script engine.
pub trait Capability: Send + Sync + 'static {
    /// Identifier the filter must allow before this surface is installed.
    fn id(&self) -> CapabilityId;

    /// Register types, functions and modules on the engine.
    fn install(&self, engine: &mut Engine);
}

/// Installer closure shared by the built-in capability kinds.
type Installer = Box<dyn Fn(&mut Engine) + Send + Sync>;

/// Capability keyed by a host type.
///
/// Installing it registers `T` under its short type name and then runs the
/// supplied closure, which registers exactly the methods and properties the
/// host wants scripts to see.
pub struct TypeCapability<T> {
    install: Installer,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Variant + Clone> TypeCapability<T> {
    /// Create a capability for `T` with the given surface registration.
    pub fn new<F>(install: F) -> Self
    where
        F: Fn(&mut Engine) + Send + Sync + 'static,
    {
        Self {
            install: Box::new(install),
            _marker: PhantomData,
        }
    }
}

impl<T: Variant + Clone> Capability for TypeCapability<T> {
    fn id(&self) -> CapabilityId {
        CapabilityId::of::<T>()
    }

    fn install(&self, engine: &mut Engine) {
        engine.register_type_with_name::<T>(short_type_name::<T>());
        (self.install)(engine);
    }
}

/// Capability identified by name rather than by type.
pub struct FnCapability {
    id: CapabilityId,
    install: Installer,
}

impl FnCapability {
    /// Create a named capability.
    pub fn new<F>(id: impl Into<CapabilityId>, install: F) -> Self
    where
        F: Fn(&mut Engine) + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            install: Box::new(install),
        }
    }
}

impl Capability for FnCapability {
    fn id(&self) -> CapabilityId {
        self.id.clone()
    }

    fn install(&self, engine: &mut Engine) {
        (self.install)(engine);
    }
}

/// Surfaces offered to a session, in registration order.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: Vec<Arc<dyn Capability>>,
}

impl CapabilityTable {
    /// Offer a surface. It stays invisible until its id is allowed.
    pub fn offer(&mut self, capability: Arc<dyn Capability>) {
        self.entries.push(capability);
    }

    /// Number of offered surfaces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been offered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install every offered surface the filter allows. Returns the number
    /// installed.
    pub fn install_allowed(&self, engine: &mut Engine, filter: &CapabilityFilter) -> usize {
        let mut installed = 0;
        for capability in &self.entries {
            let id = capability.id();
            if filter.is_allowed(id.as_str()) {
                capability.install(engine);
                installed += 1;
                tracing::debug!(capability = %id, "installed capability");
            } else {
                tracing::debug!(capability = %id, "capability not allowed; skipped");
            }
        }
        installed
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.id()))
            .finish()
    }
}

/// `my_crate::module::Counter<u8>` becomes `Counter`.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
