use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::logger::{LogLevel, ScriptLogger};
use crate::module::path::{join, normalize_separators};

/// Byte-level file access used by the module loader. Failures are reported as `None`, never panics.
pub trait FileSystem {
    fn exists(&self, path: &str) -> bool;
    fn read_all_bytes(&self, path: &str) -> Option<Vec<u8>>;
    fn read_all_text(&self, path: &str) -> Option<String>;
}

/// Turns a module id into the path of an existing file.
pub trait FileResolver {
    fn add_search_path(&mut self, path: &str);
    fn resolve_path(&self, fs: &dyn FileSystem, candidate: &str) -> Option<String>;
}

pub struct DefaultFileSystem {
    logger: Arc<dyn ScriptLogger>,
}

impl DefaultFileSystem {
    pub fn new(logger: Arc<dyn ScriptLogger>) -> Self {
        Self { logger }
    }
}

impl FileSystem for DefaultFileSystem {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn read_all_bytes(&self, path: &str) -> Option<Vec<u8>> {
        match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                self.logger.write(LogLevel::Error, &format!("failed to read '{path}': {err}"));
                None
            }
        }
    }

    fn read_all_text(&self, path: &str) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(err) => {
                self.logger.write(LogLevel::Error, &format!("failed to read '{path}': {err}"));
                None
            }
        }
    }
}

/// Files kept in memory, keyed by normalized path. Handy for packaged scripts and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.insert(normalize_separators(path), contents.into());
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }
}

impl FileSystem for MemoryFileSystem {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn read_all_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }

    fn read_all_text(&self, path: &str) -> Option<String> {
        self.files.get(path).and_then(|bytes| String::from_utf8(bytes.clone()).ok())
    }
}

/// Tries the candidate as given, then under each search path in registration order.
#[derive(Debug, Clone, Default)]
pub struct SearchPathResolver {
    search_paths: Vec<String>,
}

impl SearchPathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_paths(&self) -> &[String] {
        &self.search_paths
    }
}

impl FileResolver for SearchPathResolver {
    fn add_search_path(&mut self, path: &str) {
        let normalized = normalize_separators(path);
        let trimmed = match normalized.trim_end_matches('/') {
            "" if normalized.starts_with('/') => "/".to_string(),
            other => other.to_string(),
        };
        if !self.search_paths.contains(&trimmed) {
            self.search_paths.push(trimmed);
        }
    }

    fn resolve_path(&self, fs: &dyn FileSystem, candidate: &str) -> Option<String> {
        if fs.exists(candidate) {
            return Some(candidate.to_string());
        }
        if candidate.starts_with('/') {
            return None;
        }
        self.search_paths.iter().map(|root| join(root, candidate)).find(|path| fs.exists(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_paths_are_tried_in_order() {
        let fs = MemoryFileSystem::new().with_file("lib/util.js", "").with_file("scripts/util.js", "");
        let mut resolver = SearchPathResolver::new();
        resolver.add_search_path("scripts/");
        resolver.add_search_path("lib");
        resolver.add_search_path("scripts");
        assert_eq!(resolver.search_paths(), ["scripts".to_string(), "lib".to_string()]);
        assert_eq!(resolver.resolve_path(&fs, "util.js").as_deref(), Some("scripts/util.js"));
        assert_eq!(resolver.resolve_path(&fs, "missing.js"), None);
    }
}
