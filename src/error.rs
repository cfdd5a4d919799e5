use thiserror::Error;

use crate::async_bridge::{WaitId, WaitState};
use crate::context::ContextId;
use crate::value::HandleId;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failures surfaced by the script bridge. Inside script calls these are rethrown as exceptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("invalid module path (out of source root): {0}")]
    ModuleResolution(String),
    #[error("require module load failed: {0}")]
    ModuleLoadFailed(String),
    #[error("failed to construct script object for '{type_name}': {reason}")]
    BridgeConstruction { type_name: String, reason: String },
    #[error("async completion for wait {wait} ignored (state {state:?})")]
    AsyncCompletionMisuse { wait: WaitId, state: Option<WaitState> },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("value handle {0} is no longer held")]
    StaleHandle(HandleId),
    #[error("script context {0} has been destroyed")]
    ContextDestroyed(ContextId),
    #[error("script runtime has been destroyed")]
    RuntimeDestroyed,
    #[error("{0}")]
    Script(String),
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<rquickjs::Error> for BridgeError {
    fn from(err: rquickjs::Error) -> Self {
        BridgeError::Engine(err.to_string())
    }
}
