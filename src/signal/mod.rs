//! Signal marshaling core.
//!
//! Scripts subscribe to host signals, emit them and bind commands through a
//! [`Dispatcher`]. Every signal kind is described by a [`SignalSpec`] in the
//! [`SignalRegistry`]; its type signature drives conversion between native
//! slots and Lua values in both directions. Each script's bindings and
//! registrations are collected in a [`ScriptBindingSet`] so unloading the
//! script can release all of them.

pub mod binding_set;
pub mod builtins;
pub mod codec;
pub mod dispatch;
pub mod host;
pub mod registry;
pub mod types;

pub use binding_set::{ScriptBindingSet, TeardownSummary};
pub use builtins::{BUILTIN_SIGNALS, SEND_COMMAND};
pub use codec::{to_native, to_script, NativeSlot, ObjectHandle, ObjectRef};
pub use dispatch::{
    BindingKind, BindingRecord, DispatchOptions, Dispatcher, WeakDispatcher, WritebackPolicy,
};
pub use host::{empty_args, HandlerId, HostHandler, LocalHost, SignalArgs, SignalHost};
pub use registry::{RegisterOutcome, ResolvedSignal, SignalRegistry, SignalSpec, SpecRef};
pub use types::{ObjectKind, TypeCode, TypeSignature, MAX_SIGNAL_ARGS, PREFIX_SEPARATOR};
