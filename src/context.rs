use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{CatchResultExt, Ctx, Exception, Function, Module, Object, Persistent, Value};

use crate::async_bridge::{self, AsyncBridge, AsyncOperation, Outcome, WaitId, WaitState};
use crate::atoms::{AtomCache, AtomId};
use crate::error::{BridgeError, BridgeResult};
use crate::logger::LogLevel;
use crate::module::{esm, loader, path, ModuleCache};
use crate::object_cache::ObjectBridge;
use crate::runtime::{drain_jobs, RuntimeShared};
use crate::timers;
use crate::value::ValueHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl ContextId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

pub type DestroyListener = Box<dyn FnMut(ContextId) -> anyhow::Result<()>>;

const CONSOLE_METHODS: [(&str, LogLevel); 6] = [
    ("log", LogLevel::Log),
    ("info", LogLevel::Log),
    ("debug", LogLevel::Log),
    ("warn", LogLevel::Warn),
    ("error", LogLevel::Error),
    ("assert", LogLevel::Assert),
];

/// State reachable from script callbacks. Callbacks hold it weakly so a destroyed context
/// turns them into exceptions instead of keeping the realm alive.
pub(crate) struct ContextState {
    pub(crate) id: ContextId,
    pub(crate) host: Rc<RuntimeShared>,
    pub(crate) atoms: RefCell<AtomCache>,
    pub(crate) modules: RefCell<ModuleCache>,
    pub(crate) objects: Rc<ObjectBridge>,
    pub(crate) waits: RefCell<AsyncBridge>,
    module_cache: RefCell<Option<Persistent<Object<'static>>>>,
    valid: Cell<bool>,
}

impl ContextState {
    /// The object scripts see as `require.cache` and `module.cache`.
    pub(crate) fn module_cache_object<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let saved = self.module_cache.borrow().clone();
        match saved {
            Some(saved) => saved.restore(ctx),
            None => Err(Exception::throw_internal(ctx, "module cache is not available")),
        }
    }

    pub(crate) fn intern(&self, name: &str) -> (AtomId, Rc<str>) {
        let mut atoms = self.atoms.borrow_mut();
        let atom = atoms.get_atom(name);
        let shared = atoms.shared_name(atom).unwrap_or_else(|| Rc::from(name));
        (atom, shared)
    }

    pub(crate) fn resolve(&self, base_id: &str, requested: &str) -> BridgeResult<String> {
        let resolver = self.host.resolver.borrow();
        path::resolve_module_id(&*self.host.file_system, &**resolver, base_id, requested)
    }
}

pub(crate) fn live_state(ctx: &Ctx<'_>, state: &Weak<ContextState>) -> rquickjs::Result<Rc<ContextState>> {
    match state.upgrade() {
        Some(state) if state.valid.get() => Ok(state),
        _ => Err(Exception::throw_internal(ctx, "script context has been destroyed")),
    }
}

/// Raises `err` as a script exception.
pub(crate) fn throw(ctx: &Ctx<'_>, err: &BridgeError) -> rquickjs::Error {
    match err {
        BridgeError::InvalidArgument(message) => Exception::throw_type(ctx, message),
        other => Exception::throw_message(ctx, &other.to_string()),
    }
}

fn print_function<'js>(ctx: &Ctx<'js>, state: Weak<ContextState>, level: LogLevel) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Coerced<String>>| -> rquickjs::Result<()> {
        let Some(state) = state.upgrade() else {
            return Ok(());
        };
        let mut message = args.0.into_iter().map(|arg| arg.0).collect::<Vec<_>>().join(" ");
        if state.host.stacktrace.get() {
            let stack = Exception::from_message(ctx.clone(), "")?.stack().unwrap_or_default();
            let stack = state.host.format_stack(&stack);
            if !stack.is_empty() {
                message.push('\n');
                message.push_str(&stack);
            }
        }
        state.host.logger.script_write(level, &message);
        Ok(())
    })
}

/// One script realm: its globals, module cache, atoms, bridged objects and suspended waits.
pub struct ScriptContext {
    id: ContextId,
    context: rquickjs::Context,
    runtime: rquickjs::Runtime,
    state: Rc<ContextState>,
    listeners: RefCell<Vec<DestroyListener>>,
}

impl ScriptContext {
    pub(crate) fn new(id: ContextId, runtime: &rquickjs::Runtime, host: Rc<RuntimeShared>) -> BridgeResult<Self> {
        let context = rquickjs::Context::full(runtime)?;
        let state = Rc::new(ContextState {
            id,
            host,
            atoms: RefCell::new(AtomCache::default()),
            modules: RefCell::new(ModuleCache::default()),
            objects: ObjectBridge::new(),
            waits: RefCell::new(AsyncBridge::default()),
            module_cache: RefCell::new(None),
            valid: Cell::new(true),
        });
        let script_context =
            Self { id, context, runtime: runtime.clone(), state, listeners: RefCell::new(Vec::new()) };
        script_context.register_builtins()?;
        Ok(script_context)
    }

    /// Installs `print`, `console`, `require`, the timer functions and the `jsb` namespace.
    fn register_builtins(&self) -> BridgeResult<()> {
        let state = &self.state;
        self.context.with(|ctx| -> rquickjs::Result<()> {
            let weak = Rc::downgrade(state);
            let cache = Object::new(ctx.clone())?;
            *state.module_cache.borrow_mut() = Some(Persistent::save(&ctx, cache));

            let globals = ctx.globals();
            globals.set("require", loader::new_require(&ctx, state, Rc::from(""))?)?;
            globals.set("print", print_function(&ctx, weak.clone(), LogLevel::Log)?)?;
            let console = Object::new(ctx.clone())?;
            for (name, level) in CONSOLE_METHODS {
                console.set(name, print_function(&ctx, weak.clone(), level)?)?;
            }
            globals.set("console", console)?;
            timers::register(&ctx, weak)?;
            async_bridge::register(&ctx, state)?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid.get()
    }

    fn ensure_valid(&self) -> BridgeResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(BridgeError::ContextDestroyed(self.id))
        }
    }

    /// Runs `f` inside the realm. Not re-entrant: never call from within a script callback.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.context.with(f)
    }

    pub fn get_atom(&self, name: &str) -> AtomId {
        self.state.atoms.borrow_mut().get_atom(name)
    }

    pub fn atom_count(&self) -> usize {
        self.state.atoms.borrow().len()
    }

    pub fn atom_name(&self, atom: AtomId) -> Option<String> {
        self.state.atoms.borrow().name(atom).map(str::to_string)
    }

    /// Evaluates `source` as the entry module named `file_name`. Script errors are logged, not returned.
    pub fn eval_main(&self, source: &[u8], file_name: &str) {
        if !self.is_valid() {
            return;
        }
        let state = &self.state;
        let outcome = self.context.with(|ctx| {
            let (atom, canonical) = state.intern(&path::normalize_separators(file_name));
            loader::run_commonjs(&ctx, state, atom, canonical, source)
                .map(|_| ())
                .catch(&ctx)
                .map_err(|err| state.host.describe_caught(err))
        });
        if let Err(message) = outcome {
            state.host.logger.write(LogLevel::Error, &format!("{file_name}: {message}"));
        }
        self.drain_jobs();
    }

    /// Resolves `file_name` from the source root, reads it and runs it through `eval_main`.
    pub fn eval_main_file(&self, file_name: &str) -> BridgeResult<()> {
        self.ensure_valid()?;
        let resolved = self.state.resolve("", file_name)?;
        let source = self
            .state
            .host
            .file_system
            .read_all_bytes(&resolved)
            .ok_or_else(|| BridgeError::ModuleLoadFailed(resolved.clone()))?;
        self.eval_main(&source, &resolved);
        Ok(())
    }

    /// Evaluates `source` as the entry ES module named `file_name`, with `import.meta.main` set.
    /// Script errors are logged, not returned. A module still suspended on top-level `await` keeps
    /// running from later updates.
    pub fn eval_module(&self, source: &[u8], file_name: &str) {
        if !self.is_valid() {
            return;
        }
        let state = &self.state;
        let outcome = self.context.with(|ctx| {
            esm::declare(&ctx, &path::normalize_separators(file_name), source, true)
                .and_then(|module| module.eval())
                .and_then(|(_, promise)| match promise.finish::<()>() {
                    Err(rquickjs::Error::WouldBlock) => Ok(()),
                    other => other,
                })
                .catch(&ctx)
                .map_err(|err| state.host.describe_caught(err))
        });
        if let Err(message) = outcome {
            state.host.logger.write(LogLevel::Error, &format!("{file_name}: {message}"));
        }
        self.drain_jobs();
    }

    pub fn eval_module_file(&self, file_name: &str) -> BridgeResult<()> {
        self.ensure_valid()?;
        let resolved = self.state.resolve("", file_name)?;
        let source = self
            .state
            .host
            .file_system
            .read_all_bytes(&resolved)
            .ok_or_else(|| BridgeError::ModuleLoadFailed(resolved.clone()))?;
        self.eval_module(&source, &resolved);
        Ok(())
    }

    /// Host-side `import()`: loads and evaluates an ES module and returns its namespace object.
    pub fn import_module(&self, id: &str) -> BridgeResult<ValueHandle> {
        self.ensure_valid()?;
        let resolved = self.state.resolve("", id)?;
        let state = &self.state;
        let result = self.context.with(|ctx| {
            let namespace = Module::import(&ctx, resolved.as_str())
                .and_then(|promise| promise.finish::<Value>())
                .catch(&ctx)
                .map_err(|err| BridgeError::Script(state.host.describe_caught(err)))?;
            Ok(state.host.hold(&ctx, namespace))
        });
        self.drain_jobs();
        result
    }

    /// Evaluates a plain global script. Script errors are logged, not returned.
    pub fn eval_source(&self, source: &str, file_name: &str) {
        if !self.is_valid() {
            return;
        }
        let state = &self.state;
        let outcome = self.context.with(|ctx| {
            ctx.eval::<(), _>(source).catch(&ctx).map_err(|err| state.host.describe_caught(err))
        });
        if let Err(message) = outcome {
            state.host.logger.write(LogLevel::Error, &format!("{file_name}: {message}"));
        }
        self.drain_jobs();
    }

    /// Evaluates an expression and reads the result back as JSON.
    pub fn eval_json(&self, source: &str) -> BridgeResult<serde_json::Value> {
        self.ensure_valid()?;
        let state = &self.state;
        let result = self.context.with(|ctx| {
            let value = ctx
                .eval::<Value, _>(source)
                .catch(&ctx)
                .map_err(|err| BridgeError::Script(state.host.describe_caught(err)))?;
            async_bridge::js_to_json(&ctx, value)
        });
        self.drain_jobs();
        result
    }

    /// Evaluates an expression and keeps the result alive behind a handle.
    pub fn eval_handle(&self, source: &str) -> BridgeResult<ValueHandle> {
        self.ensure_valid()?;
        let state = &self.state;
        let result = self.context.with(|ctx| {
            let value = ctx
                .eval::<Value, _>(source)
                .catch(&ctx)
                .map_err(|err| BridgeError::Script(state.host.describe_caught(err)))?;
            Ok(state.host.hold(&ctx, value))
        });
        self.drain_jobs();
        result
    }

    /// Host-side `require` from the source root.
    pub fn require(&self, id: &str) -> BridgeResult<ValueHandle> {
        self.ensure_valid()?;
        let resolved = self.state.resolve("", id)?;
        let state = &self.state;
        let result = self.context.with(|ctx| {
            let exports = loader::load_module(&ctx, state, &resolved)
                .catch(&ctx)
                .map_err(|err| BridgeError::Script(state.host.describe_caught(err)))?;
            Ok(state.host.hold(&ctx, exports))
        });
        self.drain_jobs();
        result
    }

    pub fn is_module_loaded(&self, canonical_id: &str) -> Option<bool> {
        let atom = self.state.atoms.borrow().lookup(canonical_id)?;
        let loaded = self.state.modules.borrow().is_loaded(atom);
        loaded
    }

    pub fn loaded_module_count(&self) -> usize {
        self.state.modules.borrow().len()
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.state.modules.borrow().ids().iter().map(|id| id.to_string()).collect()
    }

    pub fn to_json(&self, handle: &ValueHandle) -> BridgeResult<serde_json::Value> {
        self.ensure_valid()?;
        self.context.with(|ctx| {
            let value = self.state.host.handles.borrow().restore(&ctx, handle.id())?;
            async_bridge::js_to_json(&ctx, value)
        })
    }

    pub fn with_value<F, R>(&self, handle: &ValueHandle, f: F) -> BridgeResult<R>
    where
        F: for<'js> FnOnce(&Ctx<'js>, Value<'js>) -> R,
    {
        self.ensure_valid()?;
        self.context.with(|ctx| {
            let value = self.state.host.handles.borrow().restore(&ctx, handle.id())?;
            Ok(f(&ctx, value))
        })
    }

    pub fn set_global(&self, name: &str, handle: &ValueHandle) -> BridgeResult<()> {
        self.ensure_valid()?;
        self.context.with(|ctx| {
            let value = self.state.host.handles.borrow().restore(&ctx, handle.id())?;
            ctx.globals().set(name, value)?;
            Ok(())
        })
    }

    pub fn object_bridge(&self) -> &Rc<ObjectBridge> {
        &self.state.objects
    }

    pub fn register_type<T, F>(&self, name: &str, installer: F)
    where
        T: Any,
        F: for<'js> Fn(&Ctx<'js>, &Object<'js>) -> rquickjs::Result<()> + 'static,
    {
        self.state.objects.register_type::<T, F>(name, installer);
    }

    /// Exposes `host` to scripts and returns a handle to its script object.
    pub fn bind<T: Any>(&self, host: Rc<T>) -> BridgeResult<ValueHandle> {
        self.ensure_valid()?;
        let state = &self.state;
        self.context.with(|ctx| {
            let value = state.objects.bind(&ctx, host)?;
            Ok(state.host.hold(&ctx, value))
        })
    }

    pub fn resolve<T: Any>(&self, handle: &ValueHandle) -> BridgeResult<Option<Rc<T>>> {
        self.with_value(handle, |ctx, value| ObjectBridge::resolve::<T>(ctx, &value))
    }

    /// Suspends nothing on the host side: returns the promise a script can await for `operation`.
    pub fn yield_operation(&self, operation: AsyncOperation) -> BridgeResult<ValueHandle> {
        self.ensure_valid()?;
        let state = &self.state;
        self.context.with(|ctx| {
            let promise = async_bridge::park_operation(&ctx, state, operation)
                .catch(&ctx)
                .map_err(|err| BridgeError::Script(state.host.describe_caught(err)))?;
            Ok(state.host.hold(&ctx, promise))
        })
    }

    pub fn pending_waits(&self) -> usize {
        self.state.waits.borrow().pending()
    }

    pub fn wait_state(&self, wait: WaitId) -> Option<WaitState> {
        self.state.waits.borrow().state(wait)
    }

    pub fn on_destroy(&self, listener: DestroyListener) {
        self.listeners.borrow_mut().push(listener);
    }

    pub(crate) fn drain_jobs(&self) {
        drain_jobs(&self.runtime, &self.state.host);
    }

    pub(crate) fn begin_tick(&self) {
        self.state.waits.borrow_mut().begin_tick();
        self.flush_deferred();
    }

    pub(crate) fn flush_deferred(&self) {
        self.state.objects.flush_deferred();
    }

    pub(crate) fn invalidate_object(&self, object: crate::object_cache::ObjectId) -> bool {
        self.state.objects.invalidate_id(object)
    }

    pub(crate) fn complete_wait(&self, wait: WaitId, outcome: Outcome) {
        let settled = self.state.waits.borrow_mut().settle(wait);
        let wait = match settled {
            Ok(wait) => wait,
            Err(err) => {
                self.state.host.logger.write(LogLevel::Warn, &err.to_string());
                return;
            }
        };
        let state = &self.state;
        self.context.with(|ctx| {
            if let Err(err) = async_bridge::resume(&ctx, wait, outcome).catch(&ctx) {
                let message = state.host.describe_caught(err);
                let message = format!("uncaught exception in async continuation: {message}");
                state.host.logger.write(LogLevel::Error, &message);
            }
        });
    }

    pub(crate) fn advance_waits(&self, elapsed: Duration) {
        let ready = self.state.waits.borrow_mut().advance(elapsed);
        for wait in ready {
            self.complete_wait(wait, Ok(serde_json::Value::Null));
        }
    }

    pub(crate) fn invoke(&self, callback: Persistent<Function<'static>>) {
        let state = &self.state;
        self.context.with(|ctx| {
            let outcome = callback.restore(&ctx).and_then(|callback| callback.call::<_, ()>(())).catch(&ctx);
            if let Err(err) = outcome {
                let message = state.host.describe_caught(err);
                state.host.logger.write(LogLevel::Error, &format!("uncaught exception in timer: {message}"));
            }
        });
    }

    /// Drops every bridge record. Script objects stay alive but no longer resolve.
    pub(crate) fn flush_objects(&self) -> usize {
        self.state.objects.clear()
    }

    /// Tears the realm down. Returns the number of waits that were cancelled.
    pub(crate) fn destroy(self) -> usize {
        let state = &self.state;
        if !state.valid.replace(false) {
            return 0;
        }
        for listener in self.listeners.borrow_mut().iter_mut() {
            if let Err(err) = listener(self.id) {
                let message = format!("context {} destroy listener failed: {err:?}", self.id);
                state.host.logger.write(LogLevel::Error, &message);
            }
        }
        let cancelled = state.waits.borrow_mut().cancel_all();
        state.host.timers.borrow_mut().clear_context(self.id);
        state.modules.borrow_mut().clear();
        state.module_cache.borrow_mut().take();
        state.objects.clear();
        state.atoms.borrow_mut().clear();
        cancelled
    }
}
