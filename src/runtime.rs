use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rquickjs::{CaughtError, Ctx, Exception, Value};

use crate::async_bridge::CompletionQueue;
use crate::buffers::ByteBufferPool;
use crate::config::RuntimeConfig;
use crate::context::{ContextId, ScriptContext};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{LifecycleBus, LifecycleEvent, LifecycleListener};
use crate::fs::{FileResolver, FileSystem, SearchPathResolver};
use crate::logger::{self, LogLevel, ScriptLogger, SourcePositionFn};
use crate::module::esm::{ModuleLoader, ModuleResolver};
use crate::object_cache::ObjectId;
use crate::timers::ScriptTimers;
use crate::value::{FreeKind, HandleId, HandleTable, ReleaseQueue, ValueHandle};

/// Runtime-wide services shared by every context on the owning thread.
pub(crate) struct RuntimeShared {
    pub(crate) logger: Arc<dyn ScriptLogger>,
    pub(crate) file_system: Box<dyn FileSystem>,
    pub(crate) resolver: RefCell<Box<dyn FileResolver>>,
    pub(crate) handles: RefCell<HandleTable>,
    pub(crate) releases: Arc<ReleaseQueue>,
    pub(crate) completions: Arc<CompletionQueue>,
    pub(crate) timers: RefCell<ScriptTimers>,
    pub(crate) buffers: Arc<ByteBufferPool>,
    pub(crate) stacktrace: Cell<bool>,
    source_map: RefCell<Option<Rc<SourcePositionFn>>>,
}

impl RuntimeShared {
    pub(crate) fn hold<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> ValueHandle {
        let id = self.handles.borrow_mut().insert(ctx, value);
        ValueHandle::new(id, self.releases.clone())
    }

    fn release(&self, id: HandleId) -> bool {
        self.handles.borrow_mut().release(id)
    }

    pub(crate) fn format_stack(&self, stack: &str) -> String {
        let translate = self.source_map.borrow().clone();
        logger::format_stack(stack, translate.as_deref())
    }

    fn describe_exception(&self, exception: &Exception<'_>) -> String {
        let name = exception.as_object().get::<_, Option<String>>("name").ok().flatten();
        let message = exception.message().unwrap_or_default();
        let mut text = match name {
            Some(name) if !name.is_empty() => format!("{name}: {message}"),
            _ => message,
        };
        if let Some(stack) = exception.stack() {
            let stack = self.format_stack(&stack);
            if !stack.is_empty() {
                text.push('\n');
                text.push_str(&stack);
            }
        }
        text
    }

    pub(crate) fn describe_value(&self, value: &Value<'_>) -> String {
        if let Some(exception) = value.as_exception() {
            return self.describe_exception(exception);
        }
        match value.as_string().and_then(|text| text.to_string().ok()) {
            Some(text) => text,
            None => format!("uncaught {value:?}"),
        }
    }

    /// Renders a caught script error with its formatted stack.
    pub(crate) fn describe_caught(&self, err: CaughtError<'_>) -> String {
        match err {
            CaughtError::Exception(exception) => self.describe_exception(&exception),
            CaughtError::Value(value) => self.describe_value(&value),
            CaughtError::Error(err) => err.to_string(),
        }
    }
}

/// Runs the engine job queue until it is empty. A throwing job is reported and draining continues.
pub(crate) fn drain_jobs(rt: &rquickjs::Runtime, host: &RuntimeShared) {
    loop {
        match rt.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => break,
            Err(job) => {
                let message = job.0.with(|ctx| host.describe_value(&ctx.catch()));
                host.logger.write(LogLevel::Error, &format!("uncaught exception in job: {message}"));
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownStats {
    pub contexts: usize,
    pub cancelled_waits: usize,
    pub released_handles: usize,
}

pub type UpdateHook = Box<dyn FnMut(Duration)>;

/// Process-wide engine handle. Lives on the thread that created it; other threads reach it
/// only through `RuntimeHandle`, `ValueHandle` and `Completer`.
pub struct ScriptRuntime {
    rt: Option<rquickjs::Runtime>,
    shared: Rc<RuntimeShared>,
    contexts: BTreeMap<ContextId, ScriptContext>,
    main: Option<ContextId>,
    next_context: u32,
    update_hooks: Vec<UpdateHook>,
    lifecycle: LifecycleBus,
    valid: bool,
}

impl ScriptRuntime {
    pub fn new(
        config: &RuntimeConfig,
        file_system: Box<dyn FileSystem>,
        logger: Arc<dyn ScriptLogger>,
    ) -> BridgeResult<Self> {
        let rt = rquickjs::Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            rt.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            rt.set_max_stack_size(size);
        }
        let mut resolver = SearchPathResolver::new();
        for path in &config.search_paths {
            resolver.add_search_path(path);
        }
        let shared = Rc::new(RuntimeShared {
            logger,
            file_system,
            resolver: RefCell::new(Box::new(resolver)),
            handles: RefCell::new(HandleTable::default()),
            releases: Arc::new(ReleaseQueue::default()),
            completions: Arc::new(CompletionQueue::default()),
            timers: RefCell::new(ScriptTimers::default()),
            buffers: ByteBufferPool::new(config.buffer_pool_size),
            stacktrace: Cell::new(config.stacktrace),
            source_map: RefCell::new(None),
        });
        rt.set_loader(ModuleResolver::new(&shared), ModuleLoader::new(&shared));
        Ok(Self {
            rt: Some(rt),
            shared,
            contexts: BTreeMap::new(),
            main: None,
            next_context: 0,
            update_hooks: Vec::new(),
            lifecycle: LifecycleBus::default(),
            valid: true,
        })
    }

    fn engine(&self) -> BridgeResult<&rquickjs::Runtime> {
        match (&self.rt, self.valid) {
            (Some(rt), true) => Ok(rt),
            _ => Err(BridgeError::RuntimeDestroyed),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn logger(&self) -> Arc<dyn ScriptLogger> {
        self.shared.logger.clone()
    }

    /// Replaces the module resolver. Search paths added before the swap are not carried over.
    pub fn set_file_resolver(&mut self, resolver: Box<dyn FileResolver>) {
        *self.shared.resolver.borrow_mut() = resolver;
    }

    pub fn add_search_path(&mut self, path: &str) {
        self.shared.resolver.borrow_mut().add_search_path(path);
    }

    /// Allocates a new realm with the builtins installed. The first context becomes the main one.
    pub fn create_context(&mut self) -> BridgeResult<ContextId> {
        self.engine()?;
        self.next_context += 1;
        let id = ContextId::new(self.next_context);
        let context = ScriptContext::new(id, self.engine()?, self.shared.clone())?;
        self.contexts.insert(id, context);
        self.main.get_or_insert(id);
        self.lifecycle.emit(LifecycleEvent::ContextCreated { context: id }, &*self.shared.logger);
        Ok(id)
    }

    pub fn context(&self, id: ContextId) -> Option<&ScriptContext> {
        self.contexts.get(&id)
    }

    pub fn main_context(&self) -> Option<&ScriptContext> {
        self.main.and_then(|id| self.contexts.get(&id))
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.contexts.keys().copied().collect()
    }

    /// Destroys one context. Returns the number of waits that were cancelled.
    pub fn destroy_context(&mut self, id: ContextId) -> BridgeResult<usize> {
        let context = self.contexts.remove(&id).ok_or(BridgeError::ContextDestroyed(id))?;
        if self.main == Some(id) {
            self.main = None;
        }
        let cancelled = context.destroy();
        self.lifecycle.emit(LifecycleEvent::ContextDestroyed { context: id }, &*self.shared.logger);
        self.drain_releases();
        Ok(cancelled)
    }

    /// Loads `file_name` through the resolver and runs it as the entry module of the main context,
    /// creating the context if needed. Script errors are logged; only lookup failures are returned.
    pub fn eval_main(&mut self, file_name: &str) -> BridgeResult<()> {
        let id = match self.main {
            Some(id) => id,
            None => self.create_context()?,
        };
        let context = self.contexts.get(&id).ok_or(BridgeError::ContextDestroyed(id))?;
        context.eval_main_file(file_name)
    }

    /// Releases `handle` right away. This is the owning-thread release path.
    pub fn free_value(&self, handle: ValueHandle) -> BridgeResult<()> {
        let id = handle.into_id();
        if self.shared.release(id) {
            Ok(())
        } else {
            Err(BridgeError::StaleHandle(id))
        }
    }

    /// Adds an owner to the slot behind `handle`.
    pub fn dup_value(&self, handle: &ValueHandle) -> BridgeResult<ValueHandle> {
        self.shared.handles.borrow_mut().retain(handle.id())?;
        Ok(ValueHandle::new(handle.id(), self.shared.releases.clone()))
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle { releases: self.shared.releases.clone() }
    }

    pub fn live_handles(&self) -> usize {
        self.shared.handles.borrow().len()
    }

    pub fn pending_frees(&self) -> usize {
        self.shared.releases.len()
    }

    /// Pool for host I/O buffers. Released buffers are recycled at the end of each `update`.
    pub fn buffers(&self) -> Arc<ByteBufferPool> {
        self.shared.buffers.clone()
    }

    pub fn pending_completions(&self) -> usize {
        self.shared.completions.len()
    }

    pub fn on_update(&mut self, hook: UpdateHook) {
        self.update_hooks.push(hook);
    }

    pub fn on_lifecycle(&mut self, listener: LifecycleListener) {
        self.lifecycle.subscribe(listener);
    }

    pub fn drain_lifecycle_events(&mut self) -> Vec<LifecycleEvent> {
        self.lifecycle.drain()
    }

    pub fn enable_stacktrace(&self) {
        self.shared.stacktrace.set(true);
    }

    pub fn disable_stacktrace(&self) {
        self.shared.stacktrace.set(false);
    }

    /// Installs the translator applied to every logged stack frame.
    pub fn set_source_map(&self, translate: impl Fn(&str, &str, u32) -> String + 'static) {
        *self.shared.source_map.borrow_mut() = Some(Rc::new(translate));
    }

    pub fn clear_source_map(&self) {
        self.shared.source_map.borrow_mut().take();
    }

    pub fn run_gc(&self) {
        if let Ok(rt) = self.engine() {
            rt.run_gc();
        }
        for context in self.contexts.values() {
            context.flush_deferred();
        }
    }

    pub fn execute_pending_jobs(&self) {
        if let Ok(rt) = self.engine() {
            drain_jobs(rt, &self.shared);
        }
    }

    /// One host tick: frees, hooks, jobs, timers, completions and waits, jobs again, then buffer recycling.
    pub fn update(&mut self, elapsed: Duration) {
        if !self.valid {
            return;
        }
        self.drain_releases();
        for context in self.contexts.values() {
            context.begin_tick();
        }
        for hook in self.update_hooks.iter_mut() {
            hook(elapsed);
        }
        self.execute_pending_jobs();
        self.fire_timers(elapsed);
        self.apply_completions();
        for context in self.contexts.values() {
            context.advance_waits(elapsed);
        }
        self.execute_pending_jobs();
        self.shared.buffers.drain();
    }

    /// Applies queued releases in enqueue order. Releases queued while draining are applied too.
    fn drain_releases(&self) -> usize {
        let mut released = 0;
        loop {
            let actions = self.shared.releases.drain();
            if actions.is_empty() {
                return released;
            }
            for action in actions {
                if let FreeKind::Uncache { context, object } = action.kind {
                    if let Some(context) = self.contexts.get(&context) {
                        context.invalidate_object(object);
                    }
                }
                if self.shared.release(action.handle) {
                    released += 1;
                }
            }
        }
    }

    fn fire_timers(&self, elapsed: Duration) {
        let due = self.shared.timers.borrow_mut().advance(elapsed);
        for timer in due {
            if let Some(context) = self.contexts.get(&timer.context) {
                context.invoke(timer.callback);
            }
        }
    }

    fn apply_completions(&self) {
        for completion in self.shared.completions.drain() {
            match self.contexts.get(&completion.context) {
                Some(context) => context.complete_wait(completion.wait, completion.outcome),
                None => {
                    let message = format!(
                        "dropping completion for wait {} of destroyed context {}",
                        completion.wait, completion.context
                    );
                    self.shared.logger.write(LogLevel::Warn, &message);
                }
            }
        }
    }

    /// Tears everything down: contexts, waits, timers, handles and finally the engine. Idempotent.
    pub fn destroy(&mut self) -> TeardownStats {
        if !self.valid {
            return TeardownStats::default();
        }
        self.valid = false;
        self.lifecycle.emit(LifecycleEvent::RuntimeDestroying, &*self.shared.logger);
        self.shared.timers.borrow_mut().clear_all();
        for context in self.contexts.values() {
            context.flush_objects();
        }
        self.drain_releases();

        let mut stats = TeardownStats::default();
        let contexts = std::mem::take(&mut self.contexts);
        self.main = None;
        for (id, context) in contexts {
            stats.contexts += 1;
            stats.cancelled_waits += context.destroy();
            self.lifecycle.emit(LifecycleEvent::ContextDestroyed { context: id }, &*self.shared.logger);
        }

        stats.released_handles = self.shared.handles.borrow_mut().clear();
        self.drain_releases();
        self.shared.releases.close();
        self.shared.completions.close();
        self.shared.buffers.close();
        self.update_hooks.clear();
        if let Some(rt) = self.rt.take() {
            rt.run_gc();
        }
        self.lifecycle.emit(LifecycleEvent::RuntimeDestroyed, &*self.shared.logger);
        stats
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// `Send + Sync` access to the runtime's release queue, for threads that do not own the runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    releases: Arc<ReleaseQueue>,
}

impl RuntimeHandle {
    /// Queues the release of `handle` for the next update.
    pub fn free_value(&self, handle: ValueHandle) {
        handle.release();
    }

    /// Queues the release of `handle` and the removal of the bridge record `object` in `context`.
    pub fn free_bridged(&self, handle: ValueHandle, context: ContextId, object: ObjectId) {
        handle.release_and_uncache(context, object);
    }

    pub fn pending_frees(&self) -> usize {
        self.releases.len()
    }

    pub fn is_closed(&self) -> bool {
        self.releases.is_closed()
    }
}
