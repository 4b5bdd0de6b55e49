//! Binding script handlers to host signals and commands.
//!
//! A [`BindingRecord`] is one installed handler. Binding resolves the name
//! through the registry, takes a counted reference to the spec and installs a
//! trampoline with the host. The trampoline converts the native slots to Lua
//! values using the spec's signature, calls the handler and writes reference
//! arguments back. Unbinding removes the installation; the spec reference is
//! released once the host lets go of the trampoline, which is immediately
//! unless the binding is in the middle of being dispatched.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use mlua::{Function, Lua, MultiValue, Table, Value};
use serde::Deserialize;
use tracing::{debug, error, trace, warn};

use super::builtins::SEND_COMMAND;
use super::codec::{describe, integer_of, string_list, to_native, to_script, NativeSlot};
use super::host::{empty_args, HandlerId, HostHandler, SignalArgs, SignalHost};
use super::registry::{SignalRegistry, SignalSpec, SpecRef};
use super::types::{TypeCode, TypeSignature, MAX_SIGNAL_ARGS};
use crate::{BridgeError, Result};

/// What to do when a handler returns a non-integer for an `I` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritebackPolicy {
    /// Ignore the value and count it.
    #[default]
    Permissive,
    /// Report the value as a handler diagnostic.
    Strict,
}

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Priority used when a binding does not give one.
    pub default_priority: i32,
    pub writeback: WritebackPolicy,
}

/// State the trampolines share with their dispatcher.
///
/// Holds the host weakly since the host owns the trampolines.
struct DispatchShared {
    policy: WritebackPolicy,
    ignored_writebacks: Cell<u64>,
    host: Weak<dyn SignalHost>,
}

impl DispatchShared {
    fn diagnostic(&self, message: &str) {
        if let Some(host) = self.host.upgrade() {
            host.diagnostic(message);
        }
    }
}

struct BindingInner {
    /// Signature source for the trampoline. Outlives `reference`.
    spec: Rc<SignalSpec>,
    /// Counted hold on the spec, released when the binding is detached.
    reference: RefCell<Option<SpecRef>>,
    handler: Function,
    lua: Lua,
    script: String,
    /// Name the host dispatches this binding under.
    host_key: String,
    shared: Rc<DispatchShared>,
}

impl BindingInner {
    /// Body of the trampoline.
    fn dispatch(&self, args: &mut SignalArgs) {
        let signature = self.spec.signature();

        let mut values = Vec::with_capacity(signature.len());
        for (position, code) in signature.iter().enumerate() {
            match to_script(&self.lua, code, &args[position]) {
                Ok(value) => values.push(value),
                Err(e) => {
                    self.fault(&format!("argument {position} could not be converted: {e}"));
                    return;
                }
            }
        }

        trace!(script = %self.script, signal = %self.host_key, "calling handler");
        let returns = match self
            .handler
            .call::<MultiValue>(MultiValue::from_vec(values.clone()))
        {
            Ok(returns) => returns,
            Err(e) => {
                self.fault(&e.to_string());
                return;
            }
        };

        self.write_back(signature, args, &values, returns);
    }

    /// Copy reference arguments back into the native slots.
    ///
    /// `I` positions take the handler's return values in order, `G` positions
    /// take the contents of the table the handler received.
    fn write_back(
        &self,
        signature: &TypeSignature,
        args: &mut SignalArgs,
        values: &[Value],
        returns: MultiValue,
    ) {
        if !signature.has_references() {
            return;
        }

        let mut returns = returns.into_iter();
        for (position, code) in signature.iter().enumerate() {
            match code {
                TypeCode::IntRef => {
                    let returned = returns.next().unwrap_or(Value::Nil);
                    self.write_int(position, &mut args[position], &returned);
                }
                TypeCode::StrList => self.write_list(position, &args[position], &values[position]),
                _ => {}
            }
        }
    }

    fn write_int(&self, position: usize, slot: &mut NativeSlot, returned: &Value) {
        if returned.is_nil() {
            return;
        }

        let Some(value) = integer_of(returned) else {
            match self.shared.policy {
                WritebackPolicy::Permissive => {
                    self.shared
                        .ignored_writebacks
                        .set(self.shared.ignored_writebacks.get() + 1);
                    debug!(
                        script = %self.script,
                        signal = %self.host_key,
                        position,
                        returned = describe(returned),
                        "ignored non-integer return for reference argument"
                    );
                }
                WritebackPolicy::Strict => {
                    let message = format!(
                        "{}: handler for '{}' returned {} for integer argument {position}",
                        self.script,
                        self.host_key,
                        describe(returned)
                    );
                    warn!("{}", message);
                    self.shared.diagnostic(&message);
                }
            }
            return;
        };

        match slot {
            NativeSlot::IntRef(cell) => cell.set(value),
            other => *other = NativeSlot::Int(value),
        }
    }

    fn write_list(&self, position: usize, slot: &NativeSlot, value: &Value) {
        let (NativeSlot::StrList(list), Value::Table(table)) = (slot, value) else {
            return;
        };

        match string_list(table, position) {
            Ok(items) => *list.borrow_mut() = items,
            Err(e) => {
                let message = format!(
                    "{}: handler for '{}' left a bad list: {e}",
                    self.script, self.host_key
                );
                warn!("{}", message);
                self.shared.diagnostic(&message);
            }
        }
    }

    fn fault(&self, detail: &str) {
        let message = format!(
            "{}: error in handler for '{}': {detail}",
            self.script, self.host_key
        );
        error!("{}", message);
        self.shared.diagnostic(&message);
    }
}

fn trampoline(inner: &Rc<BindingInner>) -> HostHandler {
    let inner = Rc::clone(inner);
    Rc::new(move |args: &mut SignalArgs| inner.dispatch(args))
}

/// Where a binding is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    Signal,
    Command { category: Option<String> },
}

/// One handler installed with the host.
///
/// Dropping a record that is still installed removes it from the host.
pub struct BindingRecord {
    inner: Rc<BindingInner>,
    kind: BindingKind,
    /// Name the script bound: a signal name or a command name.
    name: String,
    override_name: Option<String>,
    host_id: HandlerId,
    installed: bool,
}

impl BindingRecord {
    pub fn kind(&self) -> &BindingKind {
        &self.kind
    }

    pub fn is_command(&self) -> bool {
        matches!(self.kind, BindingKind::Command { .. })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concrete name when the binding matched a prefix spec.
    pub fn override_name(&self) -> Option<&str> {
        self.override_name.as_deref()
    }

    /// Key of the host table entry.
    pub fn host_key(&self) -> &str {
        &self.inner.host_key
    }

    pub fn spec(&self) -> &Rc<SignalSpec> {
        &self.inner.spec
    }

    pub fn script(&self) -> &str {
        &self.inner.script
    }

    pub fn handler(&self) -> &Function {
        &self.inner.handler
    }

    /// Whether `handler` is the function this record calls.
    pub fn calls(&self, handler: &Function) -> bool {
        self.inner.handler.to_pointer() == handler.to_pointer()
    }

    /// Remove the host installation and release the spec reference.
    /// Returns whether the host had the installation.
    ///
    /// A trampoline still running keeps its signature, but the registry
    /// count drops here.
    fn detach(&mut self, host: &dyn SignalHost) -> bool {
        if !self.installed {
            return false;
        }
        self.installed = false;

        let removed = match self.kind {
            BindingKind::Signal => host.remove_signal_handler(&self.inner.host_key, self.host_id),
            BindingKind::Command { .. } => {
                host.remove_command_handler(&self.inner.host_key, self.host_id)
            }
        };
        let reference = self.inner.reference.borrow_mut().take();
        drop(reference);
        removed
    }
}

impl Drop for BindingRecord {
    fn drop(&mut self) {
        if self.installed {
            if let Some(host) = self.inner.shared.host.upgrade() {
                self.detach(&*host);
            }
        }
    }
}

impl fmt::Debug for BindingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRecord")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("override_name", &self.override_name)
            .field("script", &self.inner.script)
            .field("spec", &self.inner.spec.name())
            .finish()
    }
}

struct DispatcherInner {
    registry: SignalRegistry,
    host: Rc<dyn SignalHost>,
    shared: Rc<DispatchShared>,
    default_priority: i32,
}

/// Binds handlers and emits signals against one registry and one host.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

/// Non-owning handle to a [`Dispatcher`], for closures stored in Lua.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<DispatcherInner>,
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl Dispatcher {
    pub fn new(registry: SignalRegistry, host: Rc<dyn SignalHost>) -> Self {
        Self::with_options(registry, host, DispatchOptions::default())
    }

    pub fn with_options(
        registry: SignalRegistry,
        host: Rc<dyn SignalHost>,
        options: DispatchOptions,
    ) -> Self {
        let shared = Rc::new(DispatchShared {
            policy: options.writeback,
            ignored_writebacks: Cell::new(0),
            host: Rc::downgrade(&host),
        });
        Self {
            inner: Rc::new(DispatcherInner {
                registry,
                host,
                shared,
                default_priority: options.default_priority,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.inner.registry
    }

    pub fn host(&self) -> &Rc<dyn SignalHost> {
        &self.inner.host
    }

    pub fn default_priority(&self) -> i32 {
        self.inner.default_priority
    }

    pub fn writeback_policy(&self) -> WritebackPolicy {
        self.inner.shared.policy
    }

    /// Non-integer `I` returns dropped under the permissive policy.
    pub fn ignored_writebacks(&self) -> u64 {
        self.inner.shared.ignored_writebacks.get()
    }

    fn make_inner(
        &self,
        lua: &Lua,
        spec: &Rc<SignalSpec>,
        handler: Function,
        script: &str,
        host_key: &str,
    ) -> Rc<BindingInner> {
        Rc::new(BindingInner {
            spec: Rc::clone(spec),
            reference: RefCell::new(Some(self.inner.registry.acquire(spec))),
            handler,
            lua: lua.clone(),
            script: script.to_string(),
            host_key: host_key.to_string(),
            shared: Rc::clone(&self.inner.shared),
        })
    }

    /// Install `handler` for the signal `name`.
    ///
    /// Exact names win over prefix families.
    pub fn bind_signal(
        &self,
        lua: &Lua,
        name: &str,
        handler: Function,
        priority: Option<i32>,
        script: &str,
    ) -> Result<BindingRecord> {
        if name.is_empty() {
            return Err(BridgeError::InvalidName("signal name is empty".to_string()));
        }

        let resolved = self
            .inner
            .registry
            .resolve(name)
            .ok_or_else(|| BridgeError::SignalNotFound(name.to_string()))?;
        let priority = priority.unwrap_or(self.inner.default_priority);
        let host_key = resolved.concrete_name().to_string();

        let inner = self.make_inner(lua, &resolved.spec, handler, script, &host_key);
        let host_id = self
            .inner
            .host
            .install_signal_handler(&host_key, priority, trampoline(&inner));

        debug!(
            script,
            signal = %host_key,
            priority,
            refcount = resolved.spec.refcount(),
            "signal bound"
        );

        Ok(BindingRecord {
            inner,
            kind: BindingKind::Signal,
            name: name.to_string(),
            override_name: resolved.override_name,
            host_id,
            installed: true,
        })
    }

    /// Install `handler` as the command `command`.
    pub fn bind_command(
        &self,
        lua: &Lua,
        command: &str,
        category: Option<&str>,
        handler: Function,
        priority: Option<i32>,
        script: &str,
    ) -> Result<BindingRecord> {
        if command.is_empty() {
            return Err(BridgeError::InvalidName("command name is empty".to_string()));
        }

        let spec = self
            .inner
            .registry
            .lookup_exact(SEND_COMMAND)
            .ok_or_else(|| BridgeError::SignalNotFound(SEND_COMMAND.to_string()))?;
        let priority = priority.unwrap_or(self.inner.default_priority);

        let inner = self.make_inner(lua, &spec, handler, script, command);
        let host_id =
            self.inner
                .host
                .install_command_handler(command, priority, category, trampoline(&inner));

        debug!(script, command, ?category, priority, "command bound");

        Ok(BindingRecord {
            inner,
            kind: BindingKind::Command {
                category: category.map(str::to_string),
            },
            name: command.to_string(),
            override_name: None,
            host_id,
            installed: true,
        })
    }

    /// Remove a binding from the host and release its spec reference.
    ///
    /// # Panics
    ///
    /// Panics if the host no longer has the installation.
    pub fn unbind(&self, mut record: BindingRecord) {
        let removed = record.detach(&*self.inner.host);
        assert!(
            removed,
            "binding of '{}' by '{}' was not installed with the host",
            record.host_key(),
            record.script()
        );

        let spec_name = record.spec().name().to_string();
        let kind = if record.is_command() { "command" } else { "signal" };
        let host_key = record.host_key().to_string();
        drop(record);

        debug!(
            kind,
            name = %host_key,
            refcount = ?self.inner.registry.refcount(&spec_name),
            "binding removed"
        );
    }

    /// Convert script arguments to native slots for `signature`.
    ///
    /// Arguments past the signature are ignored; missing ones stay null.
    fn marshal(&self, signature: &TypeSignature, args: &[Value]) -> Result<SignalArgs> {
        if args.len() > MAX_SIGNAL_ARGS {
            return Err(BridgeError::TooManyArguments {
                max: MAX_SIGNAL_ARGS,
                got: args.len(),
            });
        }
        if args.len() > signature.len() {
            trace!(
                declared = signature.len(),
                given = args.len(),
                "ignoring extra signal arguments"
            );
        }

        let mut slots = empty_args();
        for (position, (code, value)) in signature.iter().zip(args).enumerate() {
            slots[position] = to_native(code, value, position)?;
        }
        Ok(slots)
    }

    /// Raise the signal `name` with script arguments.
    ///
    /// Lists passed for `G` positions are refreshed with what the handlers
    /// left in them.
    pub fn emit(&self, name: &str, args: &[Value]) -> Result<()> {
        if args.len() > MAX_SIGNAL_ARGS {
            return Err(BridgeError::TooManyArguments {
                max: MAX_SIGNAL_ARGS,
                got: args.len(),
            });
        }

        let resolved = self
            .inner
            .registry
            .resolve(name)
            .ok_or_else(|| BridgeError::SignalNotFound(name.to_string()))?;
        let signature = resolved.spec.signature().clone();
        let mut slots = self.marshal(&signature, args)?;

        trace!(signal = %resolved.concrete_name(), "emitting");
        self.inner
            .host
            .raw_emit(resolved.concrete_name(), signature.len(), &mut slots);

        refresh_lists(&signature, args, &slots)
    }

    /// Hand new arguments to the rest of the current emission.
    pub fn continue_emission(&self, args: &[Value]) -> Result<()> {
        let current = self
            .inner
            .host
            .current_emission()
            .ok_or(BridgeError::NoActiveSignal)?;
        let resolved = self
            .inner
            .registry
            .resolve(&current)
            .ok_or_else(|| BridgeError::SignalNotFound(current.clone()))?;
        let signature = resolved.spec.signature().clone();
        let mut slots = self.marshal(&signature, args)?;

        if !self
            .inner
            .host
            .continue_emission(signature.len(), &mut slots)
        {
            return Err(BridgeError::NoActiveSignal);
        }

        refresh_lists(&signature, args, &slots)
    }

    pub fn stop_emission(&self) {
        self.inner.host.stop_emission();
    }

    pub fn stop_emission_by_name(&self, name: &str) {
        self.inner.host.stop_emission_by_name(name);
    }

    pub fn current_emission(&self) -> Option<String> {
        self.inner.host.current_emission()
    }
}

/// Copy final `G` lists into the tables the script emitted with.
fn refresh_lists(signature: &TypeSignature, args: &[Value], slots: &SignalArgs) -> Result<()> {
    for (position, code) in signature.iter().enumerate() {
        if code != TypeCode::StrList {
            continue;
        }
        if let (Some(Value::Table(table)), NativeSlot::StrList(list)) =
            (args.get(position), &slots[position])
        {
            replace_sequence(table, &list.borrow())?;
        }
    }
    Ok(())
}

fn replace_sequence(table: &Table, items: &[String]) -> mlua::Result<()> {
    let old_len = table.raw_len();
    for (index, item) in items.iter().enumerate() {
        table.raw_set(index + 1, item.as_str())?;
    }
    for index in items.len() + 1..=old_len {
        table.raw_set(index, Value::Nil)?;
    }
    Ok(())
}
