//! Test helpers for integration tests.
//!
//! Provides a [`TestBridge`]: a [`LocalHost`] with a [`ScriptManager`] on top,
//! plus helpers for raising signals from the host side.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use mlua::FromLua;

use sigbridge::signal::{empty_args, NativeSlot, ObjectKind, ObjectRef, SignalArgs};
use sigbridge::{Config, LocalHost, ScriptManager, SignalHost};

/// Host and script manager wired together.
pub struct TestBridge {
    pub host: Rc<LocalHost>,
    pub manager: ScriptManager,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let host = Rc::new(LocalHost::new());
        let manager = ScriptManager::new(&config, host.clone()).unwrap();
        Self { host, manager }
    }

    /// Load a script, panicking with the error if it fails.
    pub fn load(&mut self, name: &str, source: &str) {
        if let Err(e) = self.manager.load(name, source) {
            panic!("failed to load '{name}': {e}");
        }
    }

    /// Raise `name` from the host with `slots`, returning the final slots.
    pub fn emit(&self, name: &str, slots: Vec<NativeSlot>) -> SignalArgs {
        let arity = slots.len();
        let mut args = empty_args();
        for (position, slot) in slots.into_iter().enumerate() {
            args[position] = slot;
        }
        self.host.raw_emit(name, arity, &mut args);
        args
    }

    pub fn global<V: FromLua>(&self, script: &str, name: &str) -> V {
        self.manager.global(script, name).unwrap()
    }

    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.manager.registry().refcount(name)
    }

    /// Install a native handler recording every call's slots.
    pub fn record(&self, name: &str, arity: usize) -> Rc<RefCell<Vec<Vec<NativeSlot>>>> {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&calls);
        self.host.install_signal_handler(
            name,
            100,
            Rc::new(move |args: &mut SignalArgs| {
                sink.borrow_mut().push(args[..arity].to_vec());
            }),
        );
        calls
    }
}

pub fn server(id: u64) -> NativeSlot {
    NativeSlot::Object(ObjectRef::new(ObjectKind::Server, id))
}

pub fn channel(id: u64) -> NativeSlot {
    NativeSlot::Object(ObjectRef::new(ObjectKind::Channel, id))
}

pub fn text(s: &str) -> NativeSlot {
    NativeSlot::Str(s.to_string())
}

/// Slots for "message public": server, msg, nick, address, target.
pub fn public_message(msg: &str) -> Vec<NativeSlot> {
    vec![
        server(1),
        text(msg),
        text("alice"),
        text("alice@example.org"),
        text("#rust"),
    ]
}
