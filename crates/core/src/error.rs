use crate::EngineState;

/// Result alias that carries the custom [`EngineError`] type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A second controller was constructed while another one holds the
    /// registry slot. This is a configuration error and is never retried.
    #[error("an engine controller is already registered; dispose the earlier instance first")]
    AlreadyRegistered,
    /// The requested operation is not valid from the current state.
    #[error("cannot {operation} while the engine is {state:?}")]
    InvalidTransition {
        state: EngineState,
        operation: &'static str,
    },
    /// `start()` was called before `create()` configured the output.
    #[error("engine output has not been configured")]
    NotConfigured,
    /// Device input was requested but the output has no input channels.
    #[error("no input channels are configured")]
    NoInputChannels,
    /// The operating system refused to spawn the render thread.
    #[error("failed to spawn render thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    /// A lock was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for EngineError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for EngineError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
