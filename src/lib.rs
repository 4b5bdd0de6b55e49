//! sigbridge - signal marshaling between Lua scripts and a host event bus
//!
//! Scripts subscribe to host signals, raise them and bind commands. Native
//! arguments are converted to Lua values and back according to each signal's
//! type signature.

pub mod config;
pub mod error;
pub mod logging;
pub mod script;
pub mod signal;

pub use config::Config;
pub use error::{BridgeError, Result};
pub use script::{ScriptInfo, ScriptManager};
pub use signal::{Dispatcher, LocalHost, SignalHost, SignalRegistry};
