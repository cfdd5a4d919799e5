pub mod commonjs;
pub(crate) mod esm;
pub(crate) mod loader;
pub mod path;

use std::collections::HashMap;
use std::rc::Rc;

use rquickjs::{Object, Persistent};

use crate::atoms::AtomId;

pub use path::resolve_module_id;

struct ModuleRecord {
    canonical_id: Rc<str>,
    module: Persistent<Object<'static>>,
    loaded: bool,
}

/// Canonical module id ⇄ module object, per context. Entries are inserted before the module body
/// runs so circular requires observe partial exports.
#[derive(Default)]
pub(crate) struct ModuleCache {
    records: HashMap<AtomId, ModuleRecord>,
}

impl ModuleCache {
    pub(crate) fn insert(
        &mut self,
        atom: AtomId,
        canonical_id: Rc<str>,
        module: Persistent<Object<'static>>,
        loaded: bool,
    ) {
        self.records.insert(atom, ModuleRecord { canonical_id, module, loaded });
    }

    pub(crate) fn module(&self, atom: AtomId) -> Option<Persistent<Object<'static>>> {
        self.records.get(&atom).map(|record| record.module.clone())
    }

    pub(crate) fn mark_loaded(&mut self, atom: AtomId) {
        if let Some(record) = self.records.get_mut(&atom) {
            record.loaded = true;
        }
    }

    pub(crate) fn remove(&mut self, atom: AtomId) -> bool {
        self.records.remove(&atom).is_some()
    }

    pub(crate) fn is_loaded(&self, atom: AtomId) -> Option<bool> {
        self.records.get(&atom).map(|record| record.loaded)
    }

    /// Canonical ids of every cached module, sorted.
    pub(crate) fn ids(&self) -> Vec<Rc<str>> {
        let mut ids: Vec<Rc<str>> = self.records.values().map(|record| record.canonical_id.clone()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}
