//! Signal API for Lua scripts.
//!
//! Provides the `bridge` global table. Every binding or registration a script
//! makes through it is recorded in that script's [`ScriptBindingSet`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use mlua::{ExternalError, Function, Lua, Result as LuaResult, Table, Value, Variadic};

use crate::signal::{Dispatcher, RegisterOutcome, ScriptBindingSet, WeakDispatcher};
use crate::BridgeError;

/// Builder registering the `bridge` table for one script.
///
/// Closures stored in Lua hold the dispatcher and the binding set weakly: the
/// host keeps the Lua state alive through installed handlers, so strong
/// references would never be released.
#[derive(Clone)]
pub struct BridgeApi {
    script: Rc<str>,
    dispatcher: WeakDispatcher,
    bindings: Weak<RefCell<ScriptBindingSet>>,
}

impl BridgeApi {
    pub fn new(
        script: &str,
        dispatcher: &Dispatcher,
        bindings: &Rc<RefCell<ScriptBindingSet>>,
    ) -> Self {
        Self {
            script: Rc::from(script),
            dispatcher: dispatcher.downgrade(),
            bindings: Rc::downgrade(bindings),
        }
    }

    /// Register the `bridge` table with the Lua environment.
    pub fn register(self, lua: &Lua) -> LuaResult<()> {
        let bridge = lua.create_table()?;

        self.register_signal_functions(lua, &bridge)?;
        self.register_command_functions(lua, &bridge)?;
        self.register_registration_functions(lua, &bridge)?;
        self.register_emission_functions(lua, &bridge)?;
        bridge.set("script_name", &*self.script)?;

        lua.globals().set("bridge", bridge)?;
        Ok(())
    }

    fn dispatcher(&self) -> LuaResult<Dispatcher> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| "signal bridge has been shut down".into_lua_err())
    }

    fn bindings(&self) -> LuaResult<Rc<RefCell<ScriptBindingSet>>> {
        self.bindings
            .upgrade()
            .ok_or_else(|| format!("script '{}' is no longer loaded", self.script).into_lua_err())
    }

    /// Unbind the script's bindings of `name` of one kind, optionally only
    /// those calling `func`.
    fn remove_bindings(&self, name: &str, func: Option<&Function>, commands: bool) -> LuaResult<()> {
        let dispatcher = self.dispatcher()?;
        let taken = self.bindings()?.borrow_mut().take_bindings(|record| {
            record.is_command() == commands
                && record.name() == name
                && func.map_or(true, |func| record.calls(func))
        });

        if taken.is_empty() {
            return Err(BridgeError::SignalNotFound(name.to_string()).into_lua_err());
        }
        for record in taken {
            dispatcher.unbind(record);
        }
        Ok(())
    }

    /// Register signal_add/signal_remove.
    fn register_signal_functions(&self, lua: &Lua, bridge: &Table) -> LuaResult<()> {
        // bridge.signal_add(name, func[, priority])
        let api = self.clone();
        let signal_add = lua.create_function(
            move |lua, (name, func, priority): (String, Function, Option<i32>)| {
                let record = api
                    .dispatcher()?
                    .bind_signal(lua, &name, func, priority, &api.script)
                    .map_err(ExternalError::into_lua_err)?;
                api.bindings()?.borrow_mut().add_binding(record);
                Ok(())
            },
        )?;
        bridge.set("signal_add", signal_add)?;

        // bridge.signal_remove(name[, func])
        let api = self.clone();
        let signal_remove =
            lua.create_function(move |_, (name, func): (String, Option<Function>)| {
                api.remove_bindings(&name, func.as_ref(), false)
            })?;
        bridge.set("signal_remove", signal_remove)?;

        Ok(())
    }

    /// Register command_bind/command_unbind.
    fn register_command_functions(&self, lua: &Lua, bridge: &Table) -> LuaResult<()> {
        // bridge.command_bind(name, func[, category][, priority])
        let api = self.clone();
        let command_bind = lua.create_function(
            move |lua, (name, func, rest): (String, Function, Variadic<Value>)| {
                let (category, priority) = command_options(&rest)?;
                let record = api
                    .dispatcher()?
                    .bind_command(lua, &name, category.as_deref(), func, priority, &api.script)
                    .map_err(ExternalError::into_lua_err)?;
                api.bindings()?.borrow_mut().add_binding(record);
                Ok(())
            },
        )?;
        bridge.set("command_bind", command_bind)?;

        // bridge.command_unbind(name[, func])
        let api = self.clone();
        let command_unbind =
            lua.create_function(move |_, (name, func): (String, Option<Function>)| {
                api.remove_bindings(&name, func.as_ref(), true)
            })?;
        bridge.set("command_unbind", command_unbind)?;

        Ok(())
    }

    /// Register signal_register/signal_unregister.
    fn register_registration_functions(&self, lua: &Lua, bridge: &Table) -> LuaResult<()> {
        // bridge.signal_register(name, signature)
        let api = self.clone();
        let signal_register =
            lua.create_function(move |_, (name, signature): (String, String)| {
                let outcome = api
                    .dispatcher()?
                    .registry()
                    .register(&name, &signature)
                    .map_err(ExternalError::into_lua_err)?;
                if outcome != RegisterOutcome::Builtin {
                    api.bindings()?.borrow_mut().add_registration(name);
                }
                Ok(())
            })?;
        bridge.set("signal_register", signal_register)?;

        // bridge.signal_unregister(name)
        let api = self.clone();
        let signal_unregister = lua.create_function(move |_, name: String| {
            let dispatcher = api.dispatcher()?;
            let registry = dispatcher.registry();

            let error = match registry.get(&name) {
                Some(spec) if !spec.is_dynamic() => Some(BridgeError::NotDynamic(name.clone())),
                Some(_) if api.bindings()?.borrow_mut().remove_registration(&name) => None,
                _ => Some(BridgeError::SignalNotFound(name.clone())),
            };
            if let Some(error) = error {
                return Err(error.into_lua_err());
            }

            registry.unregister(&name).map_err(ExternalError::into_lua_err)
        })?;
        bridge.set("signal_unregister", signal_unregister)?;

        Ok(())
    }

    /// Register emission control functions.
    fn register_emission_functions(&self, lua: &Lua, bridge: &Table) -> LuaResult<()> {
        // bridge.signal_emit(name, ...)
        let api = self.clone();
        let signal_emit =
            lua.create_function(move |_, (name, args): (String, Variadic<Value>)| {
                api.dispatcher()?
                    .emit(&name, &args)
                    .map_err(ExternalError::into_lua_err)
            })?;
        bridge.set("signal_emit", signal_emit)?;

        // bridge.signal_continue(...)
        let api = self.clone();
        let signal_continue = lua.create_function(move |_, args: Variadic<Value>| {
            api.dispatcher()?
                .continue_emission(&args)
                .map_err(ExternalError::into_lua_err)
        })?;
        bridge.set("signal_continue", signal_continue)?;

        // bridge.signal_stop()
        let api = self.clone();
        let signal_stop = lua.create_function(move |_, ()| {
            api.dispatcher()?.stop_emission();
            Ok(())
        })?;
        bridge.set("signal_stop", signal_stop)?;

        // bridge.signal_stop_by_name(name)
        let api = self.clone();
        let signal_stop_by_name = lua.create_function(move |_, name: String| {
            api.dispatcher()?.stop_emission_by_name(&name);
            Ok(())
        })?;
        bridge.set("signal_stop_by_name", signal_stop_by_name)?;

        // bridge.signal_get_emitted() - name of the signal being emitted, or nil
        let api = self.clone();
        let signal_get_emitted =
            lua.create_function(move |_, ()| Ok(api.dispatcher()?.current_emission()))?;
        bridge.set("signal_get_emitted", signal_get_emitted)?;

        Ok(())
    }
}

/// Split the optional `category` and `priority` of `command_bind`.
///
/// A string is the category, a number the priority, in either order.
fn command_options(rest: &[Value]) -> LuaResult<(Option<String>, Option<i32>)> {
    let mut category = None;
    let mut priority = None;

    for value in rest {
        match value {
            Value::Nil => {}
            Value::String(s) if category.is_none() => category = Some(s.to_str()?.to_string()),
            Value::Integer(i) if priority.is_none() => {
                priority = Some(i32::try_from(*i).map_err(ExternalError::into_lua_err)?)
            }
            other => {
                return Err(format!(
                    "command_bind: unexpected {} argument",
                    other.type_name()
                )
                .into_lua_err())
            }
        }
    }
    Ok((category, priority))
}
