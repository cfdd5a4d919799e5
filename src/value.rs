use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::{qjs, Ctx, Persistent, Value};

use crate::context::ContextId;
use crate::error::{BridgeError, BridgeResult};
use crate::object_cache::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeKind {
    Plain,
    /// Drop the bridge record for `object` before releasing the handle.
    Uncache { context: ContextId, object: ObjectId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFreeAction {
    pub handle: HandleId,
    pub kind: FreeKind,
}

/// Release requests waiting for the owning thread. Safe to push from any thread.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    pending: Mutex<VecDeque<PendingFreeAction>>,
    closed: AtomicBool,
}

impl ReleaseQueue {
    pub(crate) fn push(&self, action: PendingFreeAction) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.pending.lock().push_back(action);
    }

    pub(crate) fn drain(&self) -> Vec<PendingFreeAction> {
        self.pending.lock().drain(..).collect()
    }

    /// Refuses further pushes. Used once the runtime is gone and nothing is left to release.
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

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Owning reference to a value held by the runtime's handle table.
///
/// Each `ValueHandle` carries one release obligation. `ScriptRuntime::free_value` settles it
/// immediately on the owning thread; dropping the handle (on any thread) defers the release to
/// the next `ScriptRuntime::update`. Duplicates are made with `ScriptRuntime::dup_value`.
#[must_use = "dropping a ValueHandle defers its release to the next update"]
pub struct ValueHandle {
    id: HandleId,
    queue: Option<Arc<ReleaseQueue>>,
}

impl ValueHandle {
    pub(crate) fn new(id: HandleId, queue: Arc<ReleaseQueue>) -> Self {
        Self { id, queue: Some(queue) }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Gives up the release obligation; the caller settles it against the table directly.
    pub(crate) fn into_id(mut self) -> HandleId {
        self.queue = None;
        self.id
    }

    /// Queues the release. Callable from any thread.
    pub fn release(self) {
        self.defer(FreeKind::Plain);
    }

    /// Queues the release together with the removal of the bridge record `object` in `context`.
    pub fn release_and_uncache(self, context: ContextId, object: ObjectId) {
        self.defer(FreeKind::Uncache { context, object });
    }

    fn defer(mut self, kind: FreeKind) {
        if let Some(queue) = self.queue.take() {
            queue.push(PendingFreeAction { handle: self.id, kind });
        }
    }
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.push(PendingFreeAction { handle: self.id, kind: FreeKind::Plain });
        }
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle").field("id", &self.id).finish()
    }
}

struct Slot {
    value: Persistent<Value<'static>>,
    refs: u32,
}

/// Engine values pinned on behalf of the host, keyed by `HandleId`. Owning thread only.
#[derive(Default)]
pub(crate) struct HandleTable {
    slots: HashMap<HandleId, Slot>,
    next_id: u32,
}

impl HandleTable {
    pub(crate) fn insert<'js>(&mut self, ctx: &Ctx<'js>, value: Value<'js>) -> HandleId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let id = HandleId(self.next_id);
            if self.next_id != 0 && !self.slots.contains_key(&id) {
                self.slots.insert(id, Slot { value: Persistent::save(ctx, value), refs: 1 });
                return id;
            }
        }
    }

    pub(crate) fn restore<'js>(&self, ctx: &Ctx<'js>, id: HandleId) -> BridgeResult<Value<'js>> {
        let slot = self.slots.get(&id).ok_or(BridgeError::StaleHandle(id))?;
        Ok(slot.value.clone().restore(ctx)?)
    }

    pub(crate) fn retain(&mut self, id: HandleId) -> BridgeResult<()> {
        let slot = self.slots.get_mut(&id).ok_or(BridgeError::StaleHandle(id))?;
        slot.refs += 1;
        Ok(())
    }

    /// Drops one reference; returns `true` when the slot existed.
    pub(crate) fn release(&mut self, id: HandleId) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.slots.remove(&id);
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }
}

/// Non-owning reference to a bridged script object.
///
/// The object cache removes the record holding this from the object's finalizer, so a
/// `WeakValue` found in the cache always points at a live object.
pub(crate) struct WeakValue(qjs::JSValue);

impl WeakValue {
    pub(crate) fn new(value: &Value<'_>) -> Self {
        Self(value.as_raw())
    }

    /// # Safety
    /// The referenced object must not have been finalized.
    pub(crate) unsafe fn upgrade<'js>(&self, ctx: &Ctx<'js>) -> Value<'js> {
        let borrowed = ManuallyDrop::new(Value::from_raw(ctx.clone(), self.0));
        Value::clone(&borrowed)
    }
}

impl fmt::Debug for WeakValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakValue(..)")
    }
}
