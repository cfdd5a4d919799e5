use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Persistent, Value};

use crate::atoms::AtomId;
use crate::context::{live_state, throw, ContextState};
use crate::error::BridgeError;
use crate::module::{commonjs, path};

/// Builds a `require` bound to `parent_id`. Relative specifiers resolve against the parent's directory.
pub(crate) fn new_require<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    parent_id: Rc<str>,
) -> rquickjs::Result<Function<'js>> {
    let weak = Rc::downgrade(state);
    let function = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let state = live_state(&ctx, &weak)?;
            let requested = args.0.first().and_then(|arg| arg.as_string()).map(|id| id.to_string()).transpose()?;
            let Some(requested) = requested else {
                return Err(throw(&ctx, &BridgeError::InvalidArgument("require expects a module id string".into())));
            };
            require(&ctx, &state, &parent_id, &requested)
        },
    )?;
    function.set("cache", state.module_cache_object(ctx)?)?;
    Ok(function)
}

pub(crate) fn require<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    parent_id: &str,
    requested: &str,
) -> rquickjs::Result<Value<'js>> {
    let resolved = state.resolve(parent_id, requested).map_err(|err| throw(ctx, &err))?;
    load_module(ctx, state, &resolved)
}

/// Returns the exports of `resolved`, running the module the first time it is required.
/// A cached module is returned as is, loaded or not, which is what lets circular requires finish.
pub(crate) fn load_module<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    resolved: &str,
) -> rquickjs::Result<Value<'js>> {
    let (atom, canonical) = state.intern(resolved);
    if let Some(module) = cached_module(ctx, state, atom, &canonical)? {
        return module.get("exports");
    }

    let Some(source) = state.host.file_system.read_all_bytes(resolved) else {
        return Err(throw(ctx, &BridgeError::ModuleLoadFailed(resolved.to_string())));
    };
    if commonjs::is_json(resolved) {
        let text = String::from_utf8_lossy(commonjs::strip_bom(&source)).into_owned();
        let exports = ctx.json_parse(text)?;
        new_module(ctx, state, atom, canonical, exports.clone(), true)?;
        return Ok(exports);
    }
    run_commonjs(ctx, state, atom, canonical, &source)
}

/// Looks `canonical` up in `require.cache`, which wins over the host-side record: a script that deletes
/// or replaces an entry gets a reload or its replacement on the next `require`.
fn cached_module<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    atom: AtomId,
    canonical: &Rc<str>,
) -> rquickjs::Result<Option<Object<'js>>> {
    let cache = state.module_cache_object(ctx)?;
    let Some(module) = cache.get::<_, Value<'js>>(&**canonical)?.into_object() else {
        state.modules.borrow_mut().remove(atom);
        return Ok(None);
    };
    let tracked = state.modules.borrow().module(atom);
    let tracked = tracked.map(|saved| saved.restore(ctx)).transpose()?;
    if tracked.as_ref() != Some(&module) {
        let loaded = module.get::<_, Option<bool>>("loaded")?.unwrap_or(true);
        state.modules.borrow_mut().insert(atom, canonical.clone(), Persistent::save(ctx, module.clone()), loaded);
    }
    Ok(Some(module))
}

/// Wraps and runs one CommonJS module body. A failed body leaves no trace in the cache.
pub(crate) fn run_commonjs<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    atom: AtomId,
    canonical: Rc<str>,
    source: &[u8],
) -> rquickjs::Result<Value<'js>> {
    let exports = Object::new(ctx.clone())?.into_value();
    let module = new_module(ctx, state, atom, canonical.clone(), exports.clone(), false)?;
    let outcome = execute(ctx, state, &module, exports, &canonical, source);
    if let Err(err) = outcome {
        state.modules.borrow_mut().remove(atom);
        if let Ok(cache) = state.module_cache_object(ctx) {
            let _ = cache.remove(&*canonical);
        }
        return Err(err);
    }
    state.modules.borrow_mut().mark_loaded(atom);
    module.set("loaded", true)?;
    module.get("exports")
}

fn execute<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    module: &Object<'js>,
    exports: Value<'js>,
    canonical: &Rc<str>,
    source: &[u8],
) -> rquickjs::Result<()> {
    let body: Function<'js> = ctx.eval(commonjs::wrap(source))?;
    let require = new_require(ctx, state, canonical.clone())?;
    let dirname = path::dirname(canonical).to_string();
    body.call::<_, ()>((exports, require, module.clone(), canonical.to_string(), dirname))
}

fn new_module<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<ContextState>,
    atom: AtomId,
    canonical: Rc<str>,
    exports: Value<'js>,
    loaded: bool,
) -> rquickjs::Result<Object<'js>> {
    let cache = state.module_cache_object(ctx)?;
    let module = Object::new(ctx.clone())?;
    module.set("id", &*canonical)?;
    module.set("filename", &*canonical)?;
    module.set("exports", exports)?;
    module.set("loaded", loaded)?;
    module.set("cache", cache.clone())?;
    cache.set(&*canonical, module.clone())?;
    state.modules.borrow_mut().insert(atom, canonical, Persistent::save(ctx, module.clone()), loaded);
    Ok(module)
}
