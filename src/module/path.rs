use crate::error::{BridgeError, BridgeResult};
use crate::fs::{FileResolver, FileSystem};

pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Ids without a recognised script extension are looked up as `.js` files.
pub fn ensure_extension(id: &str) -> String {
    if id.ends_with(".js") || id.ends_with(".jsx") || id.ends_with(".json") {
        id.to_string()
    } else {
        format!("{id}.js")
    }
}

pub fn is_relative(id: &str) -> bool {
    id.starts_with("./") || id.starts_with("../") || id.contains("/./") || id.contains("/../")
}

pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => "",
    }
}

pub fn join(base: &str, id: &str) -> String {
    if base.is_empty() {
        id.to_string()
    } else if base.ends_with('/') {
        format!("{base}{id}")
    } else {
        format!("{base}/{id}")
    }
}

/// Folds `.` and `..` segments. Returns `None` when a `..` would climb above the root of `path`.
pub fn collapse(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    Some(if path.starts_with('/') { format!("/{joined}") } else { joined })
}

/// Maps `requested`, as written in the module `base_id`, to a canonical module id.
pub fn resolve_module_id(
    fs: &dyn FileSystem,
    resolver: &dyn FileResolver,
    base_id: &str,
    requested: &str,
) -> BridgeResult<String> {
    let requested = normalize_separators(requested);
    let resolving = if is_relative(&requested) {
        let base_id = normalize_separators(base_id);
        collapse(&join(dirname(&base_id), &requested))
            .ok_or_else(|| BridgeError::ModuleResolution(requested.clone()))?
    } else {
        requested.clone()
    };
    resolver.resolve_path(fs, &ensure_extension(&resolving)).ok_or(BridgeError::ModuleNotFound(requested))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemoryFileSystem, SearchPathResolver};

    fn fixture() -> (MemoryFileSystem, SearchPathResolver) {
        let fs = MemoryFileSystem::new()
            .with_file("src/a.js", "")
            .with_file("src/b.js", "")
            .with_file("src/data/config.json", "{}")
            .with_file("lib/util.js", "");
        let mut resolver = SearchPathResolver::new();
        resolver.add_search_path("lib");
        (fs, resolver)
    }

    #[test]
    fn redundant_dot_segments_collapse_to_the_same_id() {
        let (fs, resolver) = fixture();
        let plain = resolve_module_id(&fs, &resolver, "src/a.js", "./b").expect("resolve ./b");
        let noisy = resolve_module_id(&fs, &resolver, "src/a.js", "./././b.js").expect("resolve ./././b.js");
        assert_eq!(plain, "src/b.js");
        assert_eq!(plain, noisy);
    }

    #[test]
    fn parent_segments_stay_inside_the_root() {
        let (fs, resolver) = fixture();
        let id = resolve_module_id(&fs, &resolver, "src/data/config.json", "../a").expect("resolve ../a");
        assert_eq!(id, "src/a.js");
        let err = resolve_module_id(&fs, &resolver, "src/a.js", "../../x").unwrap_err();
        assert_eq!(err, BridgeError::ModuleResolution("../../x".to_string()));
    }

    #[test]
    fn bare_ids_go_through_search_paths() {
        let (fs, resolver) = fixture();
        assert_eq!(resolve_module_id(&fs, &resolver, "src/a.js", "util").expect("resolve util"), "lib/util.js");
        assert_eq!(
            resolve_module_id(&fs, &resolver, "", "src/data/config.json").expect("resolve json"),
            "src/data/config.json"
        );
        let err = resolve_module_id(&fs, &resolver, "src/a.js", "nope").unwrap_err();
        assert_eq!(err, BridgeError::ModuleNotFound("nope".to_string()));
    }

    #[test]
    fn collapse_keeps_absolute_roots() {
        assert_eq!(collapse("/tmp/game/./src/../a.js").as_deref(), Some("/tmp/game/a.js"));
        assert_eq!(collapse("/.."), None);
        assert_eq!(dirname("/main.js"), "/");
        assert_eq!(dirname("main.js"), "");
        assert_eq!(ensure_extension("data.json"), "data.json");
        assert_eq!(ensure_extension("widget"), "widget.js");
    }
}
