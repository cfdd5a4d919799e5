use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u32);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom:{}", self.0)
    }
}

/// Per-context string interner. Atoms are never freed one by one; the whole cache is
/// cleared when its context is destroyed.
#[derive(Debug, Default)]
pub struct AtomCache {
    ids: HashMap<Rc<str>, AtomId>,
    names: Vec<Rc<str>>,
}

impl AtomCache {
    pub fn get_atom(&mut self, name: &str) -> AtomId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = AtomId(self.names.len() as u32);
        let shared: Rc<str> = Rc::from(name);
        self.names.push(shared.clone());
        self.ids.insert(shared, id);
        id
    }

    /// Atom for `name` if it was interned already. Never grows the cache.
    pub fn lookup(&self, name: &str) -> Option<AtomId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, atom: AtomId) -> Option<&str> {
        self.names.get(atom.0 as usize).map(|name| name.as_ref())
    }

    pub fn shared_name(&self, atom: AtomId) -> Option<Rc<str>> {
        self.names.get(atom.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut atoms = AtomCache::default();
        let first = atoms.get_atom("src/a.js");
        let second = atoms.get_atom("src/b.js");
        assert_ne!(first, second);
        assert_eq!(atoms.get_atom("src/a.js"), first);
        assert_eq!(atoms.name(second), Some("src/b.js"));
        assert_eq!(atoms.len(), 2);
    }

    #[test]
    fn lookup_does_not_intern() {
        let mut atoms = AtomCache::default();
        assert_eq!(atoms.lookup("module"), None);
        assert!(atoms.is_empty());
        let id = atoms.get_atom("module");
        assert_eq!(atoms.lookup("module"), Some(id));
        assert_eq!(atoms.len(), 1);
    }

    #[test]
    fn clear_releases_everything() {
        let mut atoms = AtomCache::default();
        let id = atoms.get_atom("exports");
        atoms.clear();
        assert!(atoms.is_empty());
        assert_eq!(atoms.name(id), None);
    }
}
