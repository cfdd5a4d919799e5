use std::fmt;

use crate::context::ContextId;
use crate::logger::{LogLevel, ScriptLogger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ContextCreated { context: ContextId },
    ContextDestroyed { context: ContextId },
    RuntimeDestroying,
    RuntimeDestroyed,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::ContextCreated { context } => write!(f, "ContextCreated context={context}"),
            LifecycleEvent::ContextDestroyed { context } => write!(f, "ContextDestroyed context={context}"),
            LifecycleEvent::RuntimeDestroying => f.write_str("RuntimeDestroying"),
            LifecycleEvent::RuntimeDestroyed => f.write_str("RuntimeDestroyed"),
        }
    }
}

pub type LifecycleListener = Box<dyn FnMut(&LifecycleEvent) -> anyhow::Result<()>>;

/// Fans lifecycle events out to host listeners. A failing listener is logged and skipped.
#[derive(Default)]
pub struct LifecycleBus {
    listeners: Vec<LifecycleListener>,
    history: Vec<LifecycleEvent>,
}

impl LifecycleBus {
    pub fn subscribe(&mut self, listener: LifecycleListener) {
        self.listeners.push(listener);
    }

    pub fn emit(&mut self, event: LifecycleEvent, logger: &dyn ScriptLogger) {
        for listener in self.listeners.iter_mut() {
            if let Err(err) = listener(&event) {
                logger.write(LogLevel::Error, &format!("lifecycle listener failed on {event}: {err:?}"));
            }
        }
        self.history.push(event);
    }

    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        self.history.drain(..).collect()
    }
}
