use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use rquickjs::class::Trace;
use rquickjs::{Class, Ctx, FromJs, IntoJs, JsLifetime, Object, Persistent, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::value::WeakValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object:{}", self.0)
    }
}

/// Builds the prototype shared by every script object bridged for one host type.
pub type PrototypeInstaller = dyn for<'js> Fn(&Ctx<'js>, &Object<'js>) -> rquickjs::Result<()>;

pub(crate) struct BridgeObject {
    object_id: ObjectId,
    host: Rc<dyn Any>,
    script_value: WeakValue,
    type_id: TypeId,
}

fn identity<T: ?Sized>(host: &Rc<T>) -> usize {
    Rc::as_ptr(host) as *const () as usize
}

/// Host object identity ⇄ bridged script object. Owning thread only.
#[derive(Default)]
pub(crate) struct ObjectCache {
    next_id: u32,
    entries: HashMap<ObjectId, BridgeObject>,
    by_identity: HashMap<usize, ObjectId>,
    by_type: HashMap<TypeId, BTreeSet<ObjectId>>,
}

impl ObjectCache {
    fn allocate_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId(self.next_id)
    }

    fn insert(&mut self, entry: BridgeObject) {
        self.by_identity.insert(identity(&entry.host), entry.object_id);
        self.by_type.entry(entry.type_id).or_default().insert(entry.object_id);
        self.entries.insert(entry.object_id, entry);
    }

    fn by_identity(&self, key: usize) -> Option<&BridgeObject> {
        self.by_identity.get(&key).and_then(|id| self.entries.get(id))
    }

    fn unbind(&mut self, object_id: ObjectId) -> Option<BridgeObject> {
        let entry = self.entries.remove(&object_id)?;
        let key = identity(&entry.host);
        if self.by_identity.get(&key) == Some(&object_id) {
            self.by_identity.remove(&key);
        }
        if let Some(ids) = self.by_type.get_mut(&entry.type_id) {
            ids.remove(&object_id);
            if ids.is_empty() {
                self.by_type.remove(&entry.type_id);
            }
        }
        Some(entry)
    }

    fn drain(&mut self) -> Vec<BridgeObject> {
        self.by_identity.clear();
        self.by_type.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    fn hosts_of<T: Any>(&self) -> impl Iterator<Item = Rc<T>> + '_ {
        self.by_type
            .get(&TypeId::of::<T>())
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
            .filter_map(|entry| entry.host.clone().downcast::<T>().ok())
    }
}

struct ExposedType {
    name: Rc<str>,
    installer: Rc<PrototypeInstaller>,
    prototype: Option<Persistent<Object<'static>>>,
}

/// Finalizer payload of every bridged script object. Dropping it unbinds the cache record.
#[derive(Trace, JsLifetime)]
#[rquickjs::class(rename = "HostObject")]
pub struct BridgePayload {
    #[qjs(skip_trace)]
    object_id: ObjectId,
    #[qjs(skip_trace)]
    bridge: Weak<ObjectBridge>,
}

impl Drop for BridgePayload {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.unbind(self.object_id);
        }
    }
}

/// Per-context object bridge: the record cache plus the registry of exposed host types.
#[derive(Default)]
pub struct ObjectBridge {
    cache: RefCell<ObjectCache>,
    deferred: RefCell<Vec<ObjectId>>,
    types: RefCell<HashMap<TypeId, ExposedType>>,
}

impl ObjectBridge {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Exposes `T` to scripts. `installer` fills the prototype the first time an instance is bound.
    pub fn register_type<T, F>(&self, name: &str, installer: F)
    where
        T: Any,
        F: for<'js> Fn(&Ctx<'js>, &Object<'js>) -> rquickjs::Result<()> + 'static,
    {
        let exposed = ExposedType { name: Rc::from(name), installer: Rc::new(installer), prototype: None };
        self.types.borrow_mut().insert(TypeId::of::<T>(), exposed);
    }

    pub fn is_registered<T: Any>(&self) -> bool {
        self.types.borrow().contains_key(&TypeId::of::<T>())
    }

    /// Returns the script object for `host`, creating it on first exposure.
    pub fn bind<'js, T: Any>(self: &Rc<Self>, ctx: &Ctx<'js>, host: Rc<T>) -> BridgeResult<Value<'js>> {
        self.flush_deferred();
        if let Some(entry) = self.cache.borrow().by_identity(identity(&host)) {
            // SAFETY: records are removed by the payload finalizer, so a live record means a live object.
            return Ok(unsafe { entry.script_value.upgrade(ctx) });
        }

        let prototype = self.prototype::<T>(ctx)?;
        let object_id = self.cache.borrow_mut().allocate_id();
        let payload = BridgePayload { object_id, bridge: Rc::downgrade(self) };
        let value = Class::instance_proto(payload, prototype)
            .and_then(|instance| instance.into_js(ctx))
            .map_err(|err| construction_error::<T>(ctx, err))?;
        self.cache.borrow_mut().insert(BridgeObject {
            object_id,
            host,
            script_value: WeakValue::new(&value),
            type_id: TypeId::of::<T>(),
        });
        Ok(value)
    }

    /// Host object behind a bridged script value. O(1) through the payload's object id.
    pub fn resolve<'js, T: Any>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<Rc<T>> {
        Self::resolve_any(ctx, value)?.downcast::<T>().ok()
    }

    pub fn resolve_any<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<Rc<dyn Any>> {
        let instance = Class::<BridgePayload>::from_js(ctx, value.clone()).ok()?;
        let payload = instance.borrow();
        let bridge = payload.bridge.upgrade()?;
        let host = bridge.cache.borrow().entries.get(&payload.object_id).map(|entry| entry.host.clone());
        host
    }

    /// Object id of the script object `value`, if it is a bridged host object.
    pub fn object_id_of_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<ObjectId> {
        let instance = Class::<BridgePayload>::from_js(ctx, value.clone()).ok()?;
        let object_id = instance.borrow().object_id;
        Some(object_id)
    }

    pub fn object_id_of<T: Any>(&self, host: &Rc<T>) -> Option<ObjectId> {
        self.flush_deferred();
        self.cache.borrow().by_identity(identity(host)).map(|entry| entry.object_id)
    }

    /// Forgets the record for `host`. The script object stays alive but no longer resolves.
    pub fn invalidate<T: Any>(&self, host: &Rc<T>) -> bool {
        let object_id = self.cache.borrow().by_identity(identity(host)).map(|entry| entry.object_id);
        object_id.map(|object_id| self.invalidate_id(object_id)).unwrap_or(false)
    }

    pub fn invalidate_id(&self, object_id: ObjectId) -> bool {
        let removed = self.cache.borrow_mut().unbind(object_id);
        removed.is_some()
    }

    /// Every live host object of type `T`, through the per-type index.
    pub fn objects_of<T: Any>(&self) -> Vec<Rc<T>> {
        self.flush_deferred();
        self.cache.borrow().hosts_of::<T>().collect()
    }

    pub fn find<T: Any>(&self, predicate: impl Fn(&T) -> bool) -> Option<Rc<T>> {
        self.flush_deferred();
        let found = self.cache.borrow().hosts_of::<T>().find(|host| predicate(host));
        found
    }

    pub fn len(&self) -> usize {
        self.flush_deferred();
        self.cache.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn unbind(&self, object_id: ObjectId) {
        match self.cache.try_borrow_mut() {
            Ok(mut cache) => {
                let removed = cache.unbind(object_id);
                drop(cache);
                drop(removed);
            }
            Err(_) => self.deferred.borrow_mut().push(object_id),
        }
    }

    pub(crate) fn flush_deferred(&self) {
        let deferred = std::mem::take(&mut *self.deferred.borrow_mut());
        for object_id in deferred {
            self.unbind(object_id);
        }
    }

    /// Drops every record and cached prototype. Returns the number of records dropped.
    pub(crate) fn clear(&self) -> usize {
        self.deferred.borrow_mut().clear();
        let drained = self.cache.borrow_mut().drain();
        let prototypes: Vec<_> =
            self.types.borrow_mut().values_mut().filter_map(|exposed| exposed.prototype.take()).collect();
        drop(prototypes);
        drained.len()
    }

    fn prototype<'js, T: Any>(&self, ctx: &Ctx<'js>) -> BridgeResult<Object<'js>> {
        let type_id = TypeId::of::<T>();
        let (installer, saved) = {
            let types = self.types.borrow();
            let exposed = types.get(&type_id).ok_or_else(|| BridgeError::BridgeConstruction {
                type_name: type_name::<T>().to_string(),
                reason: "type is not registered with this context".to_string(),
            })?;
            (exposed.installer.clone(), exposed.prototype.clone())
        };
        if let Some(saved) = saved {
            return Ok(saved.restore(ctx)?);
        }
        let prototype = Object::new(ctx.clone())?;
        installer(ctx, &prototype).map_err(|err| construction_error::<T>(ctx, err))?;
        if let Some(exposed) = self.types.borrow_mut().get_mut(&type_id) {
            exposed.prototype = Some(Persistent::save(ctx, prototype.clone()));
        }
        Ok(prototype)
    }

    /// Script-facing name `T` was registered under.
    pub fn registered_name<T: Any>(&self) -> Option<Rc<str>> {
        self.types.borrow().get(&TypeId::of::<T>()).map(|exposed| exposed.name.clone())
    }
}

fn construction_error<T: Any>(ctx: &Ctx<'_>, err: rquickjs::Error) -> BridgeError {
    let reason = if matches!(err, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        thrown
            .as_exception()
            .and_then(|exception| exception.message())
            .unwrap_or_else(|| format!("{thrown:?}"))
    } else {
        err.to_string()
    };
    BridgeError::BridgeConstruction { type_name: type_name::<T>().to_string(), reason }
}
