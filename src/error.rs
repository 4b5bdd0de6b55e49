//! Error types for sigbridge.

use thiserror::Error;

/// Common error type for sigbridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No registered signal matches the name, exactly or by prefix.
    #[error("unable to find signal '{0}'")]
    SignalNotFound(String),

    /// No loaded script has this name.
    #[error("script '{0}' is not loaded")]
    ScriptNotFound(String),

    /// A script with this name is already loaded.
    #[error("script '{0}' is already loaded")]
    ScriptExists(String),

    /// A registration clashes with an existing one.
    ///
    /// The registry is left unchanged when this is returned.
    #[error("signal '{name}' conflicts with an existing registration: {reason}")]
    Conflict { name: String, reason: String },

    /// Attempt to unregister a signal from the built-in table.
    #[error("signal '{0}' is built in and cannot be unregistered")]
    NotDynamic(String),

    /// A script value does not fit the type code of its argument position.
    ///
    /// `position` is the 0-based argument index.
    #[error("argument {position}: expected {expected}, got {actual}")]
    TypeMismatch {
        position: usize,
        expected: &'static str,
        actual: String,
    },

    /// Type signature contains an unknown code or too many positions.
    #[error("invalid type signature: {0}")]
    InvalidSignature(String),

    /// Empty or otherwise unusable signal or command name.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// More script arguments than the host can carry.
    #[error("no more than {max} arguments for a signal accepted, got {got}")]
    TooManyArguments { max: usize, got: usize },

    /// `signal_continue` called while no signal is being emitted.
    #[error("no signal is currently being emitted")]
    NoActiveSignal,

    /// Lua compile or runtime error.
    #[error("script error: {0}")]
    Script(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub(crate) fn conflict(name: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Conflict {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<mlua::Error> for BridgeError {
    fn from(e: mlua::Error) -> Self {
        BridgeError::Script(e.to_string())
    }
}

/// Result type alias for sigbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
