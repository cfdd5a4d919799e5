use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, IntoJs, Object, Persistent, Value};

use crate::context::{live_state, throw, ContextId, ContextState};
use crate::error::{BridgeError, BridgeResult};
use crate::object_cache::ObjectBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitId(u64);

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Created,
    Pending,
    Resolved,
    Cancelled,
}

/// Host-side reason a script continuation is suspended.
pub enum AsyncOperation {
    /// Resumes on the next update.
    NextFrame,
    /// Resumes after the given number of updates.
    Frames(u32),
    /// Resumes once at least this much update time has elapsed.
    Delay(Duration),
    /// Starts host work immediately; the work settles the wait through its `Completer`.
    Task(Box<dyn FnOnce(Completer)>),
}

impl AsyncOperation {
    pub fn task(start: impl FnOnce(Completer) + 'static) -> Self {
        AsyncOperation::Task(Box::new(start))
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncOperation::NextFrame => f.write_str("NextFrame"),
            AsyncOperation::Frames(frames) => write!(f, "Frames({frames})"),
            AsyncOperation::Delay(delay) => write!(f, "Delay({delay:?})"),
            AsyncOperation::Task(_) => f.write_str("Task(..)"),
        }
    }
}

/// Bridged host object carrying one `AsyncOperation`; scripts hand it to `jsb.Yield`.
#[derive(Debug)]
pub struct Awaitable {
    operation: RefCell<Option<AsyncOperation>>,
}

impl Awaitable {
    pub fn new(operation: AsyncOperation) -> Rc<Self> {
        Rc::new(Self { operation: RefCell::new(Some(operation)) })
    }

    pub fn is_consumed(&self) -> bool {
        self.operation.borrow().is_none()
    }

    fn take(&self) -> Option<AsyncOperation> {
        self.operation.borrow_mut().take()
    }
}

pub(crate) type Outcome = Result<serde_json::Value, String>;

pub(crate) struct Completion {
    pub(crate) context: ContextId,
    pub(crate) wait: WaitId,
    pub(crate) outcome: Outcome,
}

/// Completions waiting for the owning thread. Safe to push from any thread.
#[derive(Default)]
pub struct CompletionQueue {
    pending: Mutex<VecDeque<Completion>>,
    closed: AtomicBool,
}

impl CompletionQueue {
    fn push(&self, completion: Completion) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.pending.lock().push_back(completion);
    }

    pub(crate) fn drain(&self) -> Vec<Completion> {
        self.pending.lock().drain(..).collect()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Settles one `Task` wait. `Send`, so host work can finish it on any thread; the result is
/// applied to the script during the next update. Dropping it unsettled rejects the wait.
pub struct Completer {
    context: ContextId,
    wait: WaitId,
    queue: Arc<CompletionQueue>,
    settled: bool,
}

impl Completer {
    fn new(context: ContextId, wait: WaitId, queue: Arc<CompletionQueue>) -> Self {
        Self { context, wait, queue, settled: false }
    }

    pub fn wait_id(&self) -> WaitId {
        self.wait
    }

    pub fn resolve(mut self, value: serde_json::Value) {
        self.settle(Ok(value));
    }

    pub fn reject(mut self, reason: impl Into<String>) {
        self.settle(Err(reason.into()));
    }

    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.queue.push(Completion { context: self.context, wait: self.wait, outcome });
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Err("host operation dropped before completing".to_string()));
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("context", &self.context).field("wait", &self.wait).finish()
    }
}

enum Trigger {
    Frames(u32),
    Delay(Duration),
    External,
}

pub(crate) struct AsyncWait {
    state: WaitState,
    trigger: Trigger,
    parked_tick: u64,
    pub(crate) resolve: Persistent<Function<'static>>,
    pub(crate) reject: Persistent<Function<'static>>,
}

impl fmt::Debug for AsyncWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWait").field("state", &self.state).field("parked_tick", &self.parked_tick).finish()
    }
}

impl AsyncWait {
    fn transition(&mut self, next: WaitState) -> bool {
        let allowed = matches!(
            (self.state, next),
            (WaitState::Created, WaitState::Pending)
                | (WaitState::Pending, WaitState::Resolved)
                | (WaitState::Pending, WaitState::Cancelled)
        );
        if allowed {
            self.state = next;
        }
        allowed
    }
}

/// Per-context table of suspended script continuations.
#[derive(Default)]
pub(crate) struct AsyncBridge {
    waits: HashMap<WaitId, AsyncWait>,
    next_id: u64,
    tick: u64,
}

impl AsyncBridge {
    fn park(
        &mut self,
        trigger: Trigger,
        resolve: Persistent<Function<'static>>,
        reject: Persistent<Function<'static>>,
    ) -> WaitId {
        self.next_id += 1;
        let id = WaitId(self.next_id);
        let mut wait = AsyncWait { state: WaitState::Created, trigger, parked_tick: self.tick, resolve, reject };
        wait.transition(WaitState::Pending);
        self.waits.insert(id, wait);
        id
    }

    /// Takes a pending wait out for resolution. Anything else is a misuse.
    pub(crate) fn settle(&mut self, id: WaitId) -> BridgeResult<AsyncWait> {
        let Some(mut wait) = self.waits.remove(&id) else {
            return Err(BridgeError::AsyncCompletionMisuse { wait: id, state: None });
        };
        if wait.transition(WaitState::Resolved) {
            return Ok(wait);
        }
        let state = Some(wait.state);
        self.waits.insert(id, wait);
        Err(BridgeError::AsyncCompletionMisuse { wait: id, state })
    }

    /// Marks the start of an update. Waits parked from here on start counting at the following one.
    pub(crate) fn begin_tick(&mut self) {
        self.tick += 1;
    }

    /// Counts down cooperative waits and returns the ones that are ready to resume.
    pub(crate) fn advance(&mut self, elapsed: Duration) -> Vec<WaitId> {
        let mut ready = Vec::new();
        for (id, wait) in self.waits.iter_mut() {
            if wait.state != WaitState::Pending || wait.parked_tick == self.tick {
                continue;
            }
            let done = match &mut wait.trigger {
                Trigger::Frames(remaining) => {
                    *remaining = remaining.saturating_sub(1);
                    *remaining == 0
                }
                Trigger::Delay(remaining) => {
                    *remaining = remaining.saturating_sub(elapsed);
                    remaining.is_zero()
                }
                Trigger::External => false,
            };
            if done {
                ready.push(*id);
            }
        }
        ready.sort();
        ready
    }

    /// Cancels every pending wait without running its continuation. Returns how many were cancelled.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for (_, mut wait) in self.waits.drain() {
            if wait.transition(WaitState::Cancelled) {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub(crate) fn pending(&self) -> usize {
        self.waits.values().filter(|wait| wait.state == WaitState::Pending).count()
    }

    pub(crate) fn state(&self, id: WaitId) -> Option<WaitState> {
        self.waits.get(&id).map(|wait| wait.state)
    }
}

pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    ctx.json_parse(value.to_string())
}

pub(crate) fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> BridgeResult<serde_json::Value> {
    let Some(text) = ctx.json_stringify(value)? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string()?;
    serde_json::from_str(&text).map_err(|err| BridgeError::InvalidArgument(format!("value is not JSON: {err}")))
}

/// Suspends the calling script on `operation`; returns the promise that resumes it.
pub(crate) fn park_operation<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    operation: AsyncOperation,
) -> rquickjs::Result<Value<'js>> {
    let (promise, resolve, reject) = ctx.promise()?;
    let (trigger, start) = match operation {
        AsyncOperation::NextFrame => (Trigger::Frames(1), None),
        AsyncOperation::Frames(frames) => (Trigger::Frames(frames.max(1)), None),
        AsyncOperation::Delay(delay) => (Trigger::Delay(delay), None),
        AsyncOperation::Task(start) => (Trigger::External, Some(start)),
    };
    let wait = state.waits.borrow_mut().park(trigger, Persistent::save(ctx, resolve), Persistent::save(ctx, reject));
    if let Some(start) = start {
        start(Completer::new(state.id, wait, state.host.completions.clone()));
    }
    promise.into_js(ctx)
}

/// Calls the continuation of a settled wait with `outcome`.
pub(crate) fn resume<'js>(ctx: &Ctx<'js>, wait: AsyncWait, outcome: Outcome) -> rquickjs::Result<()> {
    let AsyncWait { resolve, reject, .. } = wait;
    match outcome {
        Ok(value) => {
            let resolve = resolve.restore(ctx)?;
            resolve.call::<_, ()>((json_to_js(ctx, &value)?,))
        }
        Err(reason) => {
            let reject = reject.restore(ctx)?;
            reject.call::<_, ()>((Exception::from_message(ctx.clone(), &reason)?,))
        }
    }
}

fn operation_of<'js>(ctx: &Ctx<'js>, target: Option<Value<'js>>) -> rquickjs::Result<AsyncOperation> {
    let Some(target) = target.filter(|value| !value.is_null() && !value.is_undefined()) else {
        return Ok(AsyncOperation::NextFrame);
    };
    let Some(awaitable) = ObjectBridge::resolve::<Awaitable>(ctx, &target) else {
        return Err(throw(ctx, &BridgeError::InvalidArgument("Yield expects an awaitable, null or undefined".into())));
    };
    awaitable
        .take()
        .ok_or_else(|| throw(ctx, &BridgeError::InvalidArgument("awaitable was already yielded".into())))
}

fn awaitable_factory<'js, F>(ctx: &Ctx<'js>, state: Weak<ContextState>, make: F) -> rquickjs::Result<Function<'js>>
where
    F: Fn(f64) -> AsyncOperation + 'static,
{
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, amount: Opt<f64>| -> rquickjs::Result<Value<'js>> {
        let state = live_state(&ctx, &state)?;
        let operation = make(amount.0.filter(|value| value.is_finite()).unwrap_or(0.0).max(0.0));
        state.objects.bind(&ctx, Awaitable::new(operation)).map_err(|err| throw(&ctx, &err))
    })
}

/// Installs the `jsb` namespace: `Yield`, `WaitForSeconds` and `WaitForFrames`.
pub(crate) fn register<'js>(ctx: &Ctx<'js>, state: &Rc<ContextState>) -> rquickjs::Result<()> {
    state.objects.register_type::<Awaitable, _>("Awaitable", |_ctx, _prototype| Ok(()));
    let weak = Rc::downgrade(state);
    let jsb = Object::new(ctx.clone())?;
    let yield_state = weak.clone();
    jsb.set(
        "Yield",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, target: Opt<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let state = live_state(&ctx, &yield_state)?;
            let operation = operation_of(&ctx, target.0)?;
            park_operation(&ctx, &state, operation)
        })?,
    )?;
    jsb.set(
        "WaitForSeconds",
        awaitable_factory(ctx, weak.clone(), |seconds| {
            AsyncOperation::Delay(Duration::from_secs_f64(seconds.min(1e9)))
        })?,
    )?;
    jsb.set(
        "WaitForFrames",
        awaitable_factory(ctx, weak, |frames| AsyncOperation::Frames(frames.min(u32::MAX as f64) as u32))?,
    )?;
    ctx.globals().set("jsb", jsb)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_bridge(test: impl for<'js> FnOnce(&Ctx<'js>, &mut AsyncBridge, WaitId)) {
        let rt = rquickjs::Runtime::new().expect("runtime");
        let context = rquickjs::Context::full(&rt).expect("context");
        context.with(|ctx| {
            let (_promise, resolve, reject) = ctx.promise().expect("promise");
            let mut bridge = AsyncBridge::default();
            let id = bridge.park(Trigger::Frames(2), Persistent::save(&ctx, resolve), Persistent::save(&ctx, reject));
            test(&ctx, &mut bridge, id);
        });
    }

    #[test]
    fn frame_waits_start_counting_on_the_next_tick() {
        with_bridge(|_ctx, bridge, id| {
            assert_eq!(bridge.state(id), Some(WaitState::Pending));
            assert!(bridge.advance(Duration::ZERO).is_empty(), "parked this tick");
            bridge.begin_tick();
            assert!(bridge.advance(Duration::ZERO).is_empty());
            bridge.begin_tick();
            assert_eq!(bridge.advance(Duration::ZERO), vec![id]);
        });
    }

    #[test]
    fn a_wait_settles_exactly_once() {
        with_bridge(|_ctx, bridge, id| {
            let wait = bridge.settle(id).expect("first settle");
            assert_eq!(wait.state, WaitState::Resolved);
            assert_eq!(bridge.settle(id).unwrap_err(), BridgeError::AsyncCompletionMisuse { wait: id, state: None });
            assert_eq!(bridge.pending(), 0);
        });
    }

    #[test]
    fn cancel_all_only_counts_pending_waits() {
        with_bridge(|_ctx, bridge, _id| {
            assert_eq!(bridge.cancel_all(), 1);
            assert_eq!(bridge.cancel_all(), 0);
        });
    }
}
