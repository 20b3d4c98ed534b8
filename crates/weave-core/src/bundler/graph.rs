//! Module dependency graph.
//!
//! Nodes are keyed by resolved absolute path and refer to their dependencies
//! by path, so cycles need no special representation: a node is inserted
//! before its imports are followed, and a second visit finds it in place.

use super::cache::CacheEntry;
use super::resolve::{Resolution, Resolver};
use super::scan::scan_module;
use crate::css::urls::{scan_urls, url_specifier};
use crate::error::BuildError;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use weave_util::hash::fingerprint_parts;

/// Broad file category, detected from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Script,
    Json,
    Style,
    Asset,
    Other,
}

impl FileKind {
    #[must_use]
    pub fn detect(path: &Path) -> Self {
        let ext = extension_of(path);
        match ext.as_str() {
            "js" | "mjs" | "cjs" | "jsx" => Self::Script,
            "json" => Self::Json,
            "css" | "scss" | "sass" | "less" => Self::Style,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif" | "ttf" | "otf"
            | "woff" | "woff2" | "eot" | "mp3" | "mp4" | "avi" | "webm" | "wav" => Self::Asset,
            _ => Self::Other,
        }
    }
}

/// Lowercased extension without the dot (empty when there is none).
pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// What an import specifier resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    Module(PathBuf),
    External(String),
    /// Resolution or loading failed; fatal to this subtree only.
    Failed(BuildError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    pub specifier: String,
    pub target: ImportTarget,
}

/// A module in the dependency graph.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub path: PathBuf,
    pub content: Arc<[u8]>,
    /// Content fingerprint, qualified by the file's extension so that equal
    /// bytes under a different file type never share a transform result.
    pub fingerprint: String,
    pub kind: FileKind,
    /// Raw import specifiers in first-appearance order.
    pub specifiers: Vec<String>,
    pub imports: Vec<ResolvedImport>,
    /// Transformed output, written by the worker pool.
    pub output: Option<Arc<CacheEntry>>,
    /// Whether `output` corresponds to the current content.
    pub valid: bool,
}

/// Files a stylesheet references through `url()`, as import specifiers.
fn style_specifiers(source: &str) -> Vec<String> {
    let mut seen = HashSet::default();
    scan_urls(source)
        .iter()
        .filter_map(|url| url_specifier(url))
        .filter(|spec| seen.insert(spec.clone()))
        .collect()
}

/// Fingerprint of `content` as a file with extension `ext`.
#[must_use]
pub fn content_fingerprint(ext: &str, content: &[u8]) -> String {
    fingerprint_parts([ext.as_bytes(), content])
}

impl ModuleNode {
    /// Read and scan a module from disk.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let bytes = std::fs::read(path).map_err(|e| BuildError::read(path, e))?;
        Ok(Self::from_content(path.to_path_buf(), bytes))
    }

    #[must_use]
    pub fn from_content(path: PathBuf, bytes: Vec<u8>) -> Self {
        let kind = FileKind::detect(&path);
        let mut node = Self {
            fingerprint: String::new(),
            content: Arc::from(Vec::new()),
            specifiers: Vec::new(),
            imports: Vec::new(),
            output: None,
            valid: false,
            kind,
            path,
        };
        node.set_content(bytes);
        node
    }

    fn set_content(&mut self, bytes: Vec<u8>) {
        self.fingerprint = content_fingerprint(&extension_of(&self.path), &bytes);
        self.specifiers = match self.kind {
            FileKind::Script => scan_module(&String::from_utf8_lossy(&bytes)).specifiers(),
            FileKind::Style => style_specifiers(&String::from_utf8_lossy(&bytes)),
            _ => Vec::new(),
        };
        self.content = Arc::from(bytes);
        self.output = None;
        self.valid = false;
    }

    /// Replace the content. Returns `false` (and keeps the output) when the
    /// fingerprint is unchanged.
    pub fn update_content(&mut self, bytes: Vec<u8>) -> bool {
        let fingerprint = content_fingerprint(&extension_of(&self.path), &bytes);
        if fingerprint == self.fingerprint {
            return false;
        }
        self.set_content(bytes);
        true
    }

    /// Mark the transformed output stale.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.output = None;
    }

    /// Store a transform result for the current content.
    pub fn set_output(&mut self, entry: Arc<CacheEntry>) {
        self.output = Some(entry);
        self.valid = true;
    }

    #[must_use]
    pub fn needs_transform(&self) -> bool {
        !self.valid || self.output.is_none()
    }

    /// The resolved target of `specifier`.
    #[must_use]
    pub fn target_for(&self, specifier: &str) -> Option<&ImportTarget> {
        self.imports
            .iter()
            .find(|i| i.specifier == specifier)
            .map(|i| &i.target)
    }

    /// Bundled dependencies in import order.
    pub fn dependencies(&self) -> impl Iterator<Item = &Path> {
        self.imports.iter().filter_map(|i| match &i.target {
            ImportTarget::Module(p) => Some(p.as_path()),
            _ => None,
        })
    }
}

/// What changed during [`ModuleGraph::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Nodes whose content changed.
    pub invalidated: Vec<PathBuf>,
    /// Nodes loaded for the first time.
    pub added: Vec<PathBuf>,
    /// Nodes deleted or no longer reachable.
    pub removed: Vec<PathBuf>,
}

impl RefreshSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// The module dependency graph for one entry.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    entry: PathBuf,
    nodes: HashMap<PathBuf, ModuleNode>,
    /// Set when the entry itself cannot be read.
    entry_error: Option<BuildError>,
}

fn normalize(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl ModuleGraph {
    /// Build the graph reachable from `entry`.
    ///
    /// Failures are recorded on the importing node (see [`Self::errors`]);
    /// they never stop sibling imports from being followed.
    #[must_use]
    pub fn build(entry: &Path, resolver: &Resolver) -> Self {
        let mut graph = Self {
            entry: normalize(entry),
            nodes: HashMap::default(),
            entry_error: None,
        };
        graph.load_entry(resolver);
        debug!(
            entry = %graph.entry.display(),
            modules = graph.nodes.len(),
            "built module graph"
        );
        graph
    }

    fn load_entry(&mut self, resolver: &Resolver) -> bool {
        match ModuleNode::load(&self.entry) {
            Ok(node) => {
                self.entry_error = None;
                self.nodes.insert(self.entry.clone(), node);
                self.expand(vec![self.entry.clone()], resolver);
                true
            }
            Err(e) => {
                self.entry_error = Some(e);
                false
            }
        }
    }

    /// Resolve the imports of every path in `queue`, loading and following
    /// newly discovered files. Returns the newly loaded paths.
    fn expand(&mut self, mut queue: Vec<PathBuf>, resolver: &Resolver) -> Vec<PathBuf> {
        let mut added = Vec::new();
        let mut visited = HashSet::default();
        queue.reverse();

        while let Some(path) = queue.pop() {
            if !visited.insert(path.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&path) else {
                continue;
            };
            let specifiers = node.specifiers.clone();
            let mut imports = Vec::with_capacity(specifiers.len());

            for specifier in specifiers {
                let target = match resolver.resolve(&specifier, &path) {
                    Ok(Resolution::Module(target)) => {
                        if self.nodes.contains_key(&target) {
                            ImportTarget::Module(target)
                        } else {
                            match ModuleNode::load(&target) {
                                Ok(node) => {
                                    trace!(path = %target.display(), "loaded module");
                                    self.nodes.insert(target.clone(), node);
                                    added.push(target.clone());
                                    queue.push(target.clone());
                                    ImportTarget::Module(target)
                                }
                                Err(e) => ImportTarget::Failed(e),
                            }
                        }
                    }
                    Ok(Resolution::External(name)) => ImportTarget::External(name),
                    Err(e) => {
                        debug!(
                            importer = %path.display(),
                            specifier = %e.specifier,
                            reason = %e.reason,
                            "unresolved import"
                        );
                        ImportTarget::Failed(e.into())
                    }
                };
                imports.push(ResolvedImport { specifier, target });
            }

            if let Some(node) = self.nodes.get_mut(&path) {
                node.imports = imports;
            }
        }
        added
    }

    /// Apply file changes: re-read changed nodes, re-resolve them and their
    /// importers, load newly reachable files and prune the rest.
    ///
    /// A path the graph does not know (a created file, say) may satisfy a
    /// failed resolution or shadow an existing one, so it re-resolves every
    /// node. Only content changes invalidate transformed output.
    pub fn refresh(&mut self, changed: &[PathBuf], resolver: &Resolver) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut requeue = BTreeSet::new();
        let mut full = false;

        for raw in changed {
            let path = normalize(raw);
            if !self.nodes.contains_key(&path) {
                full = true;
                continue;
            }
            requeue.extend(self.importers_of(&path));
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if let Some(node) = self.nodes.get_mut(&path) {
                        if node.update_content(bytes) {
                            summary.invalidated.push(path.clone());
                        }
                    }
                    requeue.insert(path);
                }
                Err(e) => {
                    debug!(path = %path.display(), "module removed");
                    self.nodes.remove(&path);
                    if path == self.entry {
                        self.entry_error = Some(BuildError::read(&path, e));
                    }
                    summary.removed.push(path);
                }
            }
        }

        if !self.nodes.contains_key(&self.entry) && self.load_entry(resolver) {
            summary.added.extend(self.nodes.keys().cloned());
        }

        let queue: Vec<PathBuf> = if full {
            let mut all: Vec<PathBuf> = self.nodes.keys().cloned().collect();
            all.sort();
            all
        } else {
            requeue
                .into_iter()
                .filter(|p| self.nodes.contains_key(p))
                .collect()
        };
        summary.added.extend(self.expand(queue, resolver));
        summary.removed.extend(self.prune());

        summary.invalidated.sort();
        summary.added.sort();
        summary.added.dedup();
        summary.removed.sort();
        summary.removed.dedup();
        debug!(
            invalidated = summary.invalidated.len(),
            added = summary.added.len(),
            removed = summary.removed.len(),
            "refreshed module graph"
        );
        summary
    }

    /// Drop nodes that are no longer reachable from the entry.
    pub fn prune(&mut self) -> Vec<PathBuf> {
        let reachable: HashSet<PathBuf> = self.reachable().into_iter().collect();
        let mut removed: Vec<PathBuf> = self
            .nodes
            .keys()
            .filter(|p| !reachable.contains(*p))
            .cloned()
            .collect();
        for path in &removed {
            self.nodes.remove(path);
        }
        removed.sort();
        removed
    }

    /// Entry-first depth-first preorder over bundled imports.
    #[must_use]
    pub fn reachable(&self) -> Vec<PathBuf> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen = HashSet::default();
        let mut stack = vec![self.entry.as_path()];

        while let Some(path) = stack.pop() {
            let Some(node) = self.nodes.get(path) else {
                continue;
            };
            if !seen.insert(path) {
                continue;
            }
            order.push(path.to_path_buf());
            let deps: Vec<&Path> = node.dependencies().collect();
            stack.extend(deps.into_iter().rev());
        }
        order
    }

    /// Nodes that import `path` (reverse edges), sorted.
    #[must_use]
    pub fn importers_of(&self, path: &Path) -> Vec<PathBuf> {
        let mut importers: Vec<PathBuf> = self
            .nodes
            .values()
            .filter(|n| n.dependencies().any(|d| d == path))
            .map(|n| n.path.clone())
            .collect();
        importers.sort();
        importers
    }

    /// Resolution and read failures of reachable nodes, in traversal order.
    #[must_use]
    pub fn errors(&self) -> Vec<BuildError> {
        let mut errors: Vec<BuildError> = self.entry_error.iter().cloned().collect();
        for path in self.reachable() {
            if let Some(node) = self.nodes.get(&path) {
                errors.extend(node.imports.iter().filter_map(|i| match &i.target {
                    ImportTarget::Failed(e) => Some(e.clone()),
                    _ => None,
                }));
            }
        }
        errors
    }

    #[must_use]
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&ModuleNode> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(path)
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ModuleNode> {
        self.nodes.values_mut()
    }

    /// All node paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.nodes.keys().cloned().collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
