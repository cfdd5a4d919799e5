pub mod async_bridge;
pub mod atoms;
pub mod buffers;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fs;
pub mod logger;
pub mod module;
pub mod object_cache;
pub mod runtime;
pub mod timers;
pub mod value;

pub use async_bridge::{AsyncOperation, Awaitable, Completer, WaitId, WaitState};
pub use atoms::AtomId;
pub use buffers::{ByteBuffer, ByteBufferPool};
pub use config::RuntimeConfig;
pub use context::{ContextId, ScriptContext};
pub use error::{BridgeError, BridgeResult};
pub use events::LifecycleEvent;
pub use fs::{DefaultFileSystem, FileResolver, FileSystem, MemoryFileSystem, SearchPathResolver};
pub use logger::{BufferedLogger, LogLevel, ScriptLogger, StderrLogger};
pub use object_cache::{ObjectBridge, ObjectId};
pub use runtime::{RuntimeHandle, ScriptRuntime, TeardownStats};
pub use value::{HandleId, ValueHandle};
