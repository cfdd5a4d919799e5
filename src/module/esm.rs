use std::rc::{Rc, Weak};

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Error, Module};

use crate::module::{commonjs, path};
use crate::runtime::RuntimeShared;

/// `import` specifier resolution. Same rules and search paths as `require`.
pub(crate) struct ModuleResolver {
    host: Weak<RuntimeShared>,
}

impl ModuleResolver {
    pub(crate) fn new(host: &Rc<RuntimeShared>) -> Self {
        Self { host: Rc::downgrade(host) }
    }
}

impl Resolver for ModuleResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let host = self.host.upgrade().ok_or_else(|| Error::new_resolving(base, name))?;
        let resolver = host.resolver.borrow();
        path::resolve_module_id(&*host.file_system, &**resolver, base, name)
            .map_err(|err| Error::new_resolving_message(base, name, err.to_string()))
    }
}

/// Reads resolved ES modules through the runtime's `FileSystem`.
pub(crate) struct ModuleLoader {
    host: Weak<RuntimeShared>,
}

impl ModuleLoader {
    pub(crate) fn new(host: &Rc<RuntimeShared>) -> Self {
        Self { host: Rc::downgrade(host) }
    }
}

impl Loader for ModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let host = self.host.upgrade().ok_or_else(|| Error::new_loading(name))?;
        let source = host
            .file_system
            .read_all_bytes(name)
            .ok_or_else(|| Error::new_loading_message(name, "module load failed: file not found"))?;
        declare(ctx, name, &source, false)
    }
}

/// Compiles `source` as the ES module `name` and fills `import.meta.url` and `import.meta.main`.
pub(crate) fn declare<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    source: &[u8],
    main: bool,
) -> rquickjs::Result<Module<'js, Declared>> {
    let module = Module::declare(ctx.clone(), name, commonjs::strip_bom(source))?;
    let meta = module.meta()?;
    meta.set("url", format!("file://{name}"))?;
    meta.set("main", main)?;
    Ok(module)
}
