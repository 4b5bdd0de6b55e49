//! Lua script engine with sandboxing.

use std::cell::Cell;
use std::rc::Rc;

use mlua::{HookTriggers, Lua, Value, VmState};

use crate::{BridgeError, Result};

/// Instructions between two checks of the instruction budget.
const HOOK_INTERVAL: u32 = 10_000;

/// Resource limits for script execution.
///
/// The limits cover the main chunk only. The instruction hook is removed
/// once [`ScriptEngine::execute`] returns, so handlers the host calls later
/// run unmetered and a handler that never returns blocks the host thread.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of instructions for one [`ScriptEngine::execute`] (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Globals removed from every script environment.
const SANDBOXED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "loadfile",
    "dofile",
    "load",
    "require",
    "package",
    "debug",
    "collectgarbage",
];

/// Lua state of one script, with sandboxing.
pub struct ScriptEngine {
    lua: Lua,
    instruction_count: Rc<Cell<u64>>,
    limits: ResourceLimits,
}

impl ScriptEngine {
    /// Create a new ScriptEngine with default resource limits.
    pub fn new() -> Result<Self> {
        Self::with_limits(ResourceLimits::default())
    }

    /// Create a new ScriptEngine with custom resource limits.
    pub fn with_limits(limits: ResourceLimits) -> Result<Self> {
        let lua = Lua::new();
        Self::apply_sandbox(&lua)?;

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory)
                .map_err(|e| BridgeError::Script(format!("failed to set memory limit: {e}")))?;
        }

        Ok(Self {
            lua,
            instruction_count: Rc::new(Cell::new(0)),
            limits,
        })
    }

    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in SANDBOXED_GLOBALS {
            globals
                .set(*name, Value::Nil)
                .map_err(|e| BridgeError::Script(format!("failed to disable {name}: {e}")))?;
        }
        Ok(())
    }

    /// Run a chunk under the instruction budget.
    ///
    /// `name` shows up in Lua error messages and tracebacks.
    pub fn execute(&self, name: &str, source: &str) -> Result<()> {
        self.instruction_count.set(0);

        if self.limits.max_instructions > 0 {
            let count = Rc::clone(&self.instruction_count);
            let limit = self.limits.max_instructions;

            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    let current = count.get() + u64::from(HOOK_INTERVAL);
                    count.set(current);
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let result = self.lua.load(source).set_name(name).exec();
        self.lua.remove_hook();

        result.map_err(|e| BridgeError::Script(e.to_string()))
    }

    /// Set a global value in the Lua environment.
    pub fn set_global<V: mlua::IntoLua>(&self, name: &str, value: V) -> Result<()> {
        self.lua
            .globals()
            .set(name, value)
            .map_err(|e| BridgeError::Script(format!("failed to set global '{name}': {e}")))
    }

    /// Get a global value from the Lua environment.
    pub fn get_global<V: mlua::FromLua>(&self, name: &str) -> Result<V> {
        self.lua
            .globals()
            .get(name)
            .map_err(|e| BridgeError::Script(format!("failed to get global '{name}': {e}")))
    }

    /// Instructions counted during the last [`Self::execute`], in hook intervals.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.get()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Get a reference to the underlying Lua instance.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}
