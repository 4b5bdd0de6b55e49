//! Lua scripting on top of the signal core.
//!
//! Each script runs in its own sandboxed Lua state and reaches the host
//! through the `bridge` table. Unloading a script releases every binding and
//! registration it made.

pub mod api;
pub mod engine;
pub mod manager;

pub use api::BridgeApi;
pub use engine::{ResourceLimits, ScriptEngine};
pub use manager::{ScriptInfo, ScriptManager};
