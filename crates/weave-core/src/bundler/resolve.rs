//! Import specifier resolution.
//!
//! Resolves import specifiers to absolute file paths.
//!
//! ## Order
//!
//! 1. Configured externals and `node:` builtins are left to the runtime.
//! 2. Relative (`./utils`, `../lib/foo`) and absolute specifiers: the exact
//!    path, then the path plus each configured extension, then a directory
//!    index file.
//! 3. Bare specifiers (`lodash`, `@scope/pkg/sub`) are delegated to a
//!    [`PackageResolver`]; the default walks `node_modules`.

use crate::config::BuildConfig;
use crate::error::ResolutionError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of resolving an import specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A file to bundle.
    Module(PathBuf),
    /// Left as a runtime `require` (externals and builtins).
    External(String),
}

/// External-package lookup for bare specifiers.
pub trait PackageResolver: Send + Sync + std::fmt::Debug {
    /// Resolve `specifier` imported from `importer`, or explain why not.
    fn resolve_package(&self, specifier: &str, importer: &Path) -> Result<Resolution, String>;
}

/// Node builtins that resolve to themselves without the `node:` prefix.
const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "crypto", "events", "fs", "http", "https", "module",
    "net", "os", "path", "process", "stream", "url", "util", "zlib",
];

/// First existing file among `target`, `target + ext`, then `target/<index>`.
fn find_file(target: &Path, extensions: &[String], index_files: &[String]) -> Option<PathBuf> {
    if target.is_file() {
        return Some(target.to_path_buf());
    }

    for ext in extensions {
        let mut with_ext = target.as_os_str().to_os_string();
        with_ext.push(ext);
        let with_ext = PathBuf::from(with_ext);
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }

    if target.is_dir() {
        for index in index_files {
            let index_path = target.join(index);
            if index_path.is_file() {
                return Some(index_path);
            }
        }
    }

    None
}

fn canonical(path: &Path) -> Result<PathBuf, String> {
    dunce::canonicalize(path).map_err(|e| format!("{}: {e}", path.display()))
}

/// Default package resolver: walks up from the importer looking for
/// `node_modules/<pkg>` and reads `package.json` `exports`, `module`, `main`.
#[derive(Debug, Clone)]
pub struct NodeModulesResolver {
    extensions: Vec<String>,
    index_files: Vec<String>,
}

impl NodeModulesResolver {
    #[must_use]
    pub fn new(extensions: Vec<String>, index_files: Vec<String>) -> Self {
        Self {
            extensions,
            index_files,
        }
    }

    /// Split a bare specifier into package name and subpath.
    fn parse_bare_specifier(specifier: &str) -> (String, Option<String>) {
        if specifier.starts_with('@') {
            let parts: Vec<&str> = specifier.splitn(3, '/').collect();
            if parts.len() >= 2 {
                let pkg = format!("{}/{}", parts[0], parts[1]);
                (pkg, parts.get(2).map(|s| (*s).to_string()))
            } else {
                (specifier.to_string(), None)
            }
        } else {
            let mut parts = specifier.splitn(2, '/');
            let pkg = parts.next().unwrap_or_default().to_string();
            (pkg, parts.next().map(ToString::to_string))
        }
    }

    fn resolve_package_entry(&self, pkg_dir: &Path, subpath: Option<&str>) -> Option<PathBuf> {
        let manifest = std::fs::read_to_string(pkg_dir.join("package.json"))
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok());

        let export_key = subpath.map_or_else(|| ".".to_string(), |s| format!("./{s}"));
        if let Some(entry) = manifest
            .as_ref()
            .and_then(|json| json.get("exports"))
            .and_then(|exports| resolve_exports(exports, &export_key))
        {
            if let Some(found) = find_file(&pkg_dir.join(entry), &[], &[]) {
                return Some(found);
            }
        }

        if let Some(sub) = subpath {
            return find_file(&pkg_dir.join(sub), &self.extensions, &self.index_files);
        }

        for field in ["module", "main"] {
            if let Some(entry) = manifest
                .as_ref()
                .and_then(|json| json.get(field))
                .and_then(|v| v.as_str())
            {
                if let Some(found) = find_file(&pkg_dir.join(entry), &self.extensions, &self.index_files)
                {
                    return Some(found);
                }
            }
        }

        find_file(pkg_dir, &[], &self.index_files)
    }
}

impl PackageResolver for NodeModulesResolver {
    fn resolve_package(&self, specifier: &str, importer: &Path) -> Result<Resolution, String> {
        let (pkg_name, subpath) = Self::parse_bare_specifier(specifier);

        let mut current = importer.parent();
        while let Some(dir) = current {
            let pkg_dir = dir.join("node_modules").join(&pkg_name);
            if pkg_dir.is_dir() {
                if let Some(found) = self.resolve_package_entry(&pkg_dir, subpath.as_deref()) {
                    return canonical(&found).map(Resolution::Module);
                }
            }
            current = dir.parent();
        }

        if subpath.is_none() && NODE_BUILTINS.contains(&pkg_name.as_str()) {
            return Ok(Resolution::External(specifier.to_string()));
        }

        Err(format!("cannot find package '{pkg_name}' in node_modules"))
    }
}

/// Resolve a package.json `exports` field for `subpath` (simplified).
fn resolve_exports(exports: &serde_json::Value, subpath: &str) -> Option<String> {
    match exports {
        serde_json::Value::String(s) if subpath == "." => Some(s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(value) = map.get(subpath) {
                return resolve_export_value(value);
            }
            let conditional = map.keys().all(|k| !k.starts_with('.'));
            if subpath == "." && conditional {
                return resolve_export_value(exports);
            }
            None
        }
        _ => None,
    }
}

/// Resolve a single export value, preferring `import` > `module` > `default` > `require`.
fn resolve_export_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => ["import", "module", "default", "require"]
            .iter()
            .find_map(|cond| map.get(*cond).and_then(resolve_export_value)),
        serde_json::Value::Array(items) => items.iter().find_map(resolve_export_value),
        _ => None,
    }
}

/// Import resolver.
#[derive(Debug, Clone)]
pub struct Resolver {
    extensions: Vec<String>,
    index_files: Vec<String>,
    externals: Vec<String>,
    packages: Arc<dyn PackageResolver>,
}

impl Resolver {
    /// Create a resolver with the default `node_modules` package lookup.
    #[must_use]
    pub fn new(extensions: Vec<String>, index_files: Vec<String>, externals: Vec<String>) -> Self {
        let packages = Arc::new(NodeModulesResolver::new(
            extensions.clone(),
            index_files.clone(),
        ));
        Self {
            extensions,
            index_files,
            externals,
            packages,
        }
    }

    #[must_use]
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            config.extensions.clone(),
            config.index_files.clone(),
            config.externals.clone(),
        )
    }

    /// Replace the bare-specifier lookup.
    #[must_use]
    pub fn with_package_resolver(mut self, packages: Arc<dyn PackageResolver>) -> Self {
        self.packages = packages;
        self
    }

    fn is_external(&self, specifier: &str) -> bool {
        self.externals.iter().any(|e| {
            specifier == e
                || specifier
                    .strip_prefix(e.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Resolve `specifier` as imported from `importer`.
    pub fn resolve(&self, specifier: &str, importer: &Path) -> Result<Resolution, ResolutionError> {
        let fail = |reason: String| ResolutionError {
            importer: importer.to_path_buf(),
            specifier: specifier.to_string(),
            reason,
        };

        if specifier.is_empty() {
            return Err(fail("empty specifier".to_string()));
        }

        if specifier.starts_with("node:") || self.is_external(specifier) {
            return Ok(Resolution::External(specifier.to_string()));
        }

        let is_path = specifier.starts_with("./")
            || specifier.starts_with("../")
            || specifier == "."
            || specifier == ".."
            || Path::new(specifier).is_absolute();

        if is_path {
            let base = importer.parent().unwrap_or_else(|| Path::new("."));
            let target = base.join(specifier);
            return match find_file(&target, &self.extensions, &self.index_files) {
                Some(found) => canonical(&found).map(Resolution::Module).map_err(fail),
                None => Err(fail("file not found".to_string())),
            };
        }

        self.packages
            .resolve_package(specifier, importer)
            .map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn resolver() -> Resolver {
        Resolver::new(
            vec![".js".to_string(), ".json".to_string()],
            vec!["index.js".to_string()],
            vec!["react".to_string()],
        )
    }

    fn module(result: Result<Resolution, ResolutionError>) -> PathBuf {
        match result.unwrap() {
            Resolution::Module(p) => p,
            other => panic!("expected module, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bare_specifier() {
        let (pkg, sub) = NodeModulesResolver::parse_bare_specifier("lodash");
        assert_eq!(pkg, "lodash");
        assert!(sub.is_none());

        let (pkg, sub) = NodeModulesResolver::parse_bare_specifier("lodash/get");
        assert_eq!(pkg, "lodash");
        assert_eq!(sub, Some("get".to_string()));

        let (pkg, sub) = NodeModulesResolver::parse_bare_specifier("@babel/core/lib/parse");
        assert_eq!(pkg, "@babel/core");
        assert_eq!(sub, Some("lib/parse".to_string()));
    }

    #[test]
    fn test_resolution_order() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let main = root.join("main.js");
        std::fs::write(&main, "").unwrap();
        std::fs::create_dir_all(root.join("src/utils")).unwrap();
        std::fs::write(root.join("src/utils/add.js"), "").unwrap();
        std::fs::write(root.join("src/utils/index.js"), "").unwrap();
        std::fs::write(root.join("data.json"), "{}").unwrap();

        let r = resolver();
        assert_eq!(
            module(r.resolve("./src/utils/add.js", &main)),
            root.join("src/utils/add.js")
        );
        assert_eq!(
            module(r.resolve("./src/utils/add", &main)),
            root.join("src/utils/add.js")
        );
        assert_eq!(
            module(r.resolve("./src/utils", &main)),
            root.join("src/utils/index.js")
        );
        assert_eq!(module(r.resolve("./data", &main)), root.join("data.json"));
    }

    #[test]
    fn test_missing_file_names_importer_and_specifier() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("main.js");
        std::fs::write(&main, "").unwrap();

        let err = resolver().resolve("./missing", &main).unwrap_err();
        assert_eq!(err.importer, main);
        assert_eq!(err.specifier, "./missing");
    }

    #[test]
    fn test_externals_and_builtins() {
        let r = resolver();
        let importer = Path::new("/nowhere/main.js");
        assert_eq!(
            r.resolve("react", importer).unwrap(),
            Resolution::External("react".to_string())
        );
        assert_eq!(
            r.resolve("react/jsx-runtime", importer).unwrap(),
            Resolution::External("react/jsx-runtime".to_string())
        );
        assert_eq!(
            r.resolve("node:fs", importer).unwrap(),
            Resolution::External("node:fs".to_string())
        );
        assert_eq!(
            r.resolve("path", importer).unwrap(),
            Resolution::External("path".to_string())
        );
        assert!(r.resolve("react-dom", importer).is_err());
    }

    #[test]
    fn test_node_modules_package_json() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let main = root.join("main.js");
        std::fs::write(&main, "").unwrap();

        let pkg = root.join("node_modules/left-pad");
        std::fs::create_dir_all(pkg.join("dist")).unwrap();
        std::fs::write(
            pkg.join("package.json"),
            r#"{"main": "index.js", "exports": {".": {"import": "./dist/esm.js", "require": "./index.js"}}}"#,
        )
        .unwrap();
        std::fs::write(pkg.join("dist/esm.js"), "").unwrap();
        std::fs::write(pkg.join("index.js"), "").unwrap();
        std::fs::write(pkg.join("extra.js"), "").unwrap();

        let r = resolver();
        assert_eq!(module(r.resolve("left-pad", &main)), pkg.join("dist/esm.js"));
        assert_eq!(module(r.resolve("left-pad/extra", &main)), pkg.join("extra.js"));
    }

    #[derive(Debug)]
    struct Fixed;

    impl PackageResolver for Fixed {
        fn resolve_package(&self, specifier: &str, _importer: &Path) -> Result<Resolution, String> {
            Ok(Resolution::External(format!("cdn:{specifier}")))
        }
    }

    #[test]
    fn test_custom_package_resolver() {
        let r = resolver().with_package_resolver(Arc::new(Fixed));
        assert_eq!(
            r.resolve("lodash", Path::new("/x/main.js")).unwrap(),
            Resolution::External("cdn:lodash".to_string())
        );
    }
}
