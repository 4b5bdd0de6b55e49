//! Registry of signal specs.
//!
//! Signals must be registered to be visible to scripts. Built-in specs are
//! inserted by [`SignalRegistry::init`] with a refcount of 1 and live until
//! [`SignalRegistry::shutdown`]. A script may declare more at runtime with
//! [`SignalRegistry::register`]: a new name creates a dynamic spec with a
//! refcount of 1, registering the same name again (with the same signature)
//! and binding a handler to it both add a reference. Unregistering and
//! unbinding drop references, and a dynamic spec whose refcount reaches zero
//! leaves the registry.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, Deref};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use super::builtins::BUILTIN_SIGNALS;
use super::types::{is_prefix_name, TypeSignature, PREFIX_SEPARATOR};
use crate::{BridgeError, Result};

/// Descriptor of one signal kind.
#[derive(Debug)]
pub struct SignalSpec {
    name: String,
    signature: TypeSignature,
    is_prefix: bool,
    dynamic: bool,
    refcount: Cell<usize>,
}

impl SignalSpec {
    fn new(name: &str, signature: TypeSignature, dynamic: bool) -> Self {
        Self {
            name: name.to_string(),
            signature,
            is_prefix: is_prefix_name(name),
            dynamic,
            refcount: Cell::new(1),
        }
    }

    /// Declared name. For a prefix spec this ends in the separator.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &TypeSignature {
        &self.signature
    }

    /// Whether this spec matches every name starting with [`Self::name`].
    pub fn is_prefix(&self) -> bool {
        self.is_prefix
    }

    /// Whether a script declared this spec at runtime.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn refcount(&self) -> usize {
        self.refcount.get()
    }
}

/// Byte-wise prefix test used for parametric signal families.
fn prefix_matches(prefix: &str, name: &str) -> bool {
    !prefix.is_empty()
        && prefix.ends_with(PREFIX_SEPARATOR)
        && name.as_bytes().starts_with(prefix.as_bytes())
}

/// A spec found by [`SignalRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedSignal {
    pub spec: Rc<SignalSpec>,
    /// Full name when a prefix spec matched a longer concrete name.
    pub override_name: Option<String>,
}

impl ResolvedSignal {
    /// The name the host knows this signal by.
    pub fn concrete_name(&self) -> &str {
        self.override_name.as_deref().unwrap_or(self.spec.name())
    }
}

/// What [`SignalRegistry::register`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new dynamic spec was created.
    Created,
    /// An existing dynamic spec gained a reference.
    Shared,
    /// The name is a built-in with the same signature; nothing to release later.
    Builtin,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Every spec by declared name, prefix specs included.
    specs: HashMap<String, Rc<SignalSpec>>,
    /// Prefix specs only, sorted by name.
    prefixes: BTreeMap<String, Rc<SignalSpec>>,
    initialized: bool,
}

impl RegistryState {
    fn insert(&mut self, spec: Rc<SignalSpec>) -> Result<()> {
        if spec.name.is_empty() {
            return Err(BridgeError::InvalidName("signal name is empty".to_string()));
        }

        if self.specs.contains_key(&spec.name) {
            return Err(BridgeError::conflict(&spec.name, "name already registered"));
        }

        if spec.is_prefix {
            if let Some(other) = self.overlapping_prefix(&spec.name) {
                return Err(BridgeError::conflict(
                    &spec.name,
                    format!("prefix overlaps the '{other}' family"),
                ));
            }
            self.prefixes.insert(spec.name.clone(), Rc::clone(&spec));
        }

        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// A registered prefix that nests with `prefix` either way.
    fn overlapping_prefix(&self, prefix: &str) -> Option<&str> {
        self.prefixes
            .keys()
            .find(|existing| existing.starts_with(prefix) || prefix.starts_with(existing.as_str()))
            .map(String::as_str)
    }

    fn remove(&mut self, spec: &SignalSpec) {
        let same = |candidate: &Rc<SignalSpec>| std::ptr::eq(Rc::as_ptr(candidate), spec);

        if self.specs.get(&spec.name).is_some_and(same) {
            self.specs.remove(&spec.name);
        }
        if spec.is_prefix && self.prefixes.get(&spec.name).is_some_and(same) {
            self.prefixes.remove(&spec.name);
        }
    }
}

/// Drop one reference, removing a dynamic spec at zero.
fn release(state: &RefCell<RegistryState>, spec: &SignalSpec) {
    let count = spec.refcount.get();
    assert!(
        count >= 1,
        "signal '{}' released with a refcount of zero",
        spec.name
    );

    if count == 1 {
        assert!(
            spec.dynamic,
            "refcount of built-in signal '{}' dropped to zero",
            spec.name
        );
        state.borrow_mut().remove(spec);
        debug!(signal = %spec.name, "dynamic signal removed");
    }

    spec.refcount.set(count - 1);
}

/// Counted reference to a spec.
///
/// Holding one keeps the spec registered; dropping it releases the reference.
#[derive(Debug)]
pub struct SpecRef {
    spec: Rc<SignalSpec>,
    registry: Weak<RefCell<RegistryState>>,
}

impl SpecRef {
    pub fn spec(&self) -> &Rc<SignalSpec> {
        &self.spec
    }
}

impl Deref for SpecRef {
    type Target = SignalSpec;

    fn deref(&self) -> &SignalSpec {
        &self.spec
    }
}

impl Drop for SpecRef {
    fn drop(&mut self) {
        if let Some(state) = self.registry.upgrade() {
            release(&state, &self.spec);
        }
    }
}

/// Shared handle to the process-wide signal registry.
///
/// Clones refer to the same registry. Lookups hand out `Rc` clones and never
/// hold a borrow across a call back into script code, so handlers may
/// register and unregister while a signal they were bound through is being
/// dispatched.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    state: Rc<RefCell<RegistryState>>,
}

impl SignalRegistry {
    /// Create an empty, uninitialized registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry populated with [`BUILTIN_SIGNALS`].
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        registry.init(BUILTIN_SIGNALS)?;
        Ok(registry)
    }

    /// Populate the registry with its built-in specs.
    ///
    /// A bad table leaves the registry untouched.
    ///
    /// # Panics
    ///
    /// Panics if the registry is already initialized.
    pub fn init(&self, builtins: &[(&str, &str)]) -> Result<()> {
        assert!(
            !self.state.borrow().initialized,
            "signal registry initialized twice"
        );

        let mut fresh = RegistryState::default();
        for (name, signature) in builtins {
            let signature: TypeSignature = signature.parse()?;
            fresh.insert(Rc::new(SignalSpec::new(name, signature, false)))?;
        }
        fresh.initialized = true;

        debug!(count = fresh.specs.len(), "signal registry initialized");
        *self.state.borrow_mut() = fresh;
        Ok(())
    }

    /// Tear the registry down.
    ///
    /// # Panics
    ///
    /// Panics if a dynamic spec is still registered or a built-in spec is
    /// still referenced by a binding.
    pub fn shutdown(&self) {
        let mut state = self.state.borrow_mut();
        if !state.initialized {
            warn!("shutdown of an uninitialized signal registry");
            return;
        }

        for spec in state.specs.values() {
            assert!(
                !spec.dynamic,
                "dynamic signal '{}' still registered at shutdown",
                spec.name
            );
            assert_eq!(
                spec.refcount(),
                1,
                "built-in signal '{}' still referenced at shutdown",
                spec.name
            );
        }

        *state = RegistryState::default();
        debug!("signal registry shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().initialized
    }

    /// Exact match against non-prefix specs.
    pub fn lookup_exact(&self, name: &str) -> Option<Rc<SignalSpec>> {
        self.state
            .borrow()
            .specs
            .get(name)
            .filter(|spec| !spec.is_prefix)
            .cloned()
    }

    /// Match against prefix specs.
    ///
    /// Registered prefixes never nest, so the greatest prefix not above
    /// `name` is the only candidate.
    pub fn lookup_prefix(&self, name: &str) -> Option<Rc<SignalSpec>> {
        self.state
            .borrow()
            .prefixes
            .range::<str, _>((Bound::Unbounded, Bound::Included(name)))
            .next_back()
            .filter(|(prefix, _)| prefix_matches(prefix, name))
            .map(|(_, spec)| Rc::clone(spec))
    }

    /// Exact match first, then prefix match.
    pub fn resolve(&self, name: &str) -> Option<ResolvedSignal> {
        if let Some(spec) = self.lookup_exact(name) {
            return Some(ResolvedSignal {
                spec,
                override_name: None,
            });
        }

        self.lookup_prefix(name).map(|spec| {
            let override_name = (spec.name() != name).then(|| name.to_string());
            ResolvedSignal {
                spec,
                override_name,
            }
        })
    }

    /// Declare a dynamic signal, or add a reference to an existing one.
    ///
    /// A name ending in a space declares a parametric family.
    pub fn register(&self, name: &str, signature: &str) -> Result<RegisterOutcome> {
        if name.is_empty() {
            return Err(BridgeError::InvalidName("signal name is empty".to_string()));
        }
        let signature: TypeSignature = signature.parse()?;

        let mut state = self.state.borrow_mut();
        if let Some(existing) = state.specs.get(name) {
            if existing.signature != signature {
                return Err(BridgeError::conflict(
                    name,
                    format!(
                        "type signature \"{signature}\" differs from registered \"{}\"",
                        existing.signature
                    ),
                ));
            }

            if !existing.dynamic {
                return Ok(RegisterOutcome::Builtin);
            }

            existing.refcount.set(existing.refcount.get() + 1);
            debug!(signal = name, refcount = existing.refcount(), "signal registered again");
            return Ok(RegisterOutcome::Shared);
        }

        state.insert(Rc::new(SignalSpec::new(name, signature, true)))?;
        debug!(signal = name, "dynamic signal created");
        Ok(RegisterOutcome::Created)
    }

    /// Drop a reference taken by [`Self::register`].
    ///
    /// Only the exact declared name is accepted; a concrete member of a
    /// parametric family does not unregister the family.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let spec = self
            .state
            .borrow()
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::SignalNotFound(name.to_string()))?;

        if !spec.dynamic {
            return Err(BridgeError::NotDynamic(name.to_string()));
        }

        release(&self.state, &spec);
        Ok(())
    }

    /// Take a counted reference to `spec`.
    pub fn acquire(&self, spec: &Rc<SignalSpec>) -> SpecRef {
        debug_assert!(
            self.state.borrow().specs.contains_key(spec.name()),
            "acquire of unregistered signal '{}'",
            spec.name()
        );

        spec.refcount.set(spec.refcount.get() + 1);
        SpecRef {
            spec: Rc::clone(spec),
            registry: Rc::downgrade(&self.state),
        }
    }

    /// The spec declared as `name`, prefix or not.
    pub fn get(&self, name: &str) -> Option<Rc<SignalSpec>> {
        self.state.borrow().specs.get(name).cloned()
    }

    /// Current refcount of the spec declared as `name`.
    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.state.borrow().specs.get(name).map(|spec| spec.refcount())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.borrow().specs.contains_key(name)
    }

    /// Number of registered specs.
    pub fn len(&self) -> usize {
        self.state.borrow().specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().specs.is_empty()
    }

    /// Names of the dynamic specs, sorted.
    pub fn dynamic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .borrow()
            .specs
            .values()
            .filter(|spec| spec.dynamic)
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }
}
