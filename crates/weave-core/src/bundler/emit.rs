//! Bundle emission.
//!
//! Modules get stable numeric ids from an entry-first depth-first traversal
//! and are linked into a single script around a small registry runtime:
//!
//! ```text
//! (function () {
//! var __weave_modules = {
//! 0: function (module, exports) { <getters> <hoisted imports>
//! <module body, line for line>
//! },
//! ...
//! };
//! <runtime>
//! var __weave_entry = __weave_require(0);
//! })();
//! ```
//!
//! ES module syntax is lowered in place. Exports become getters installed
//! before the body runs, so a cyclic importer sees hoisted functions and live
//! bindings. Import bindings are rewritten to property reads on the imported
//! module's exports. Statements are replaced by padding with the same number
//! of newlines, so body lines map one to one onto the module's transformed
//! text.
//!
//! Stylesheet `url()` markers are replaced here, once every asset they point
//! at has been transformed and knows its final URL.

use super::graph::{FileKind, ImportTarget, ModuleGraph, ModuleNode};
use super::lexer::{
    is_ident_char, is_ident_start, is_member_access, prev_significant, read_ident, segments,
    skip_trivia, Segment, SegmentKind,
};
use super::naming::{ArtifactNamer, NameParts};
use super::plugin::minify_js;
use super::scan::{
    binding_names, continues_expression, parse_bindings, pattern_names, scan_module, ExportKind,
    ImportKind,
};
use super::sourcemap::{token_columns, SourceMapBuilder};
use super::transform::SideArtifactKind;
use crate::config::{BuildConfig, EntryConfig, SourceMapMode};
use crate::css::urls::{replace_markers, url_specifier};
use crate::error::{BuildError, TransformError};
use crate::paths::display_relative;
use crate::version;
use rayon::prelude::*;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Script,
    Style,
    Asset,
    Html,
}

/// A named output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the output directory, forward slashes.
    pub name: String,
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
    /// Source Map v3 JSON mapping original lines (and columns) to `bytes`.
    pub source_map: Option<String>,
}

impl Artifact {
    fn new(name: String, kind: ArtifactKind, bytes: Vec<u8>) -> Self {
        Self {
            name,
            kind,
            bytes,
            source_map: None,
        }
    }

    /// File name of the source map written next to this artifact.
    #[must_use]
    pub fn source_map_name(&self) -> Option<String> {
        self.source_map.as_ref().map(|_| format!("{}.map", self.name))
    }
}

const RUNTIME: &str = r#"var __weave_cache = {};
function __weave_require(id) {
  var cached = __weave_cache[id];
  if (cached) return cached.exports;
  var module = (__weave_cache[id] = { exports: {} });
  __weave_modules[id].call(module.exports, module, module.exports);
  return module.exports;
}
function __weave_export(exports, getters) {
  Object.defineProperty(exports, "__esModule", { value: true });
  for (var name in getters) {
    Object.defineProperty(exports, name, { enumerable: true, get: getters[name] });
  }
}
function __weave_export_star(exports, from) {
  Object.keys(from).forEach(function (name) {
    if (name === "default" || Object.prototype.hasOwnProperty.call(exports, name)) return;
    Object.defineProperty(exports, name, {
      enumerable: true,
      get: function () { return from[name]; }
    });
  });
}
function __weave_interop(m) {
  return m && m.__esModule ? m : Object.assign({ default: m }, m);
}
"#;

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn is_identifier(name: &str) -> bool {
    name.bytes().next().is_some_and(is_ident_start) && name.bytes().all(is_ident_char)
}

/// `object.name`, or `object["name"]` when `name` is not an identifier.
fn member(object: &str, name: &str) -> String {
    if is_identifier(name) {
        format!("{object}.{name}")
    } else {
        format!("{object}[{}]", js_string(name))
    }
}

/// Replace the `url()` markers in a style node's CSS with the URLs of the
/// assets they resolved to. Emitted names get `base` in front; references
/// that did not resolve to an asset keep their original text.
fn resolve_style_urls(text: &str, node: &ModuleNode, graph: &ModuleGraph, base: &str) -> String {
    replace_markers(text, |url| {
        let resolved = url_specifier(url).and_then(|spec| match node.target_for(&spec)? {
            ImportTarget::Module(path) => graph.get(path)?.output.as_ref()?.url.clone(),
            ImportTarget::External(_) | ImportTarget::Failed(_) => None,
        });
        match resolved {
            Some(data) if data.starts_with("data:") => data,
            Some(name) => format!("{base}{name}"),
            None => url.to_string(),
        }
    })
}

/// Prefix leading from the directory of an artifact named by `pattern` back
/// to the output root.
fn up_to_root(pattern: &str) -> String {
    let depth = Path::new(pattern).parent().map_or(0, |dir| {
        dir.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    });
    "../".repeat(depth)
}

fn newlines(text: &str) -> usize {
    text.bytes().filter(|&b| b == b'\n').count()
}

/// A module lowered into registry form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkedModule {
    /// Export getters and hoisted imports, emitted on the wrapper line.
    header: String,
    /// The module text, rewritten with its line count unchanged.
    body: String,
}

struct Linker<'a> {
    node: &'a ModuleNode,
    ids: &'a HashMap<PathBuf, usize>,
    header: Vec<String>,
    declared: HashSet<String>,
    external_vars: HashMap<String, String>,
    bindings: HashMap<String, String>,
    getters: Vec<(String, String)>,
}

impl<'a> Linker<'a> {
    /// Expression requiring the target of `specifier`, if it is known.
    fn require_expr(&self, specifier: &str) -> Option<(String, Option<usize>)> {
        match self.node.target_for(specifier)? {
            ImportTarget::Module(path) => {
                let id = *self.ids.get(path)?;
                Some((format!("__weave_require({id})"), Some(id)))
            }
            ImportTarget::External(name) => Some((format!("require({})", js_string(name)), None)),
            ImportTarget::Failed(_) => None,
        }
    }

    /// Declare (once) the variable holding an imported module's exports.
    fn import_var(&mut self, specifier: &str, require: &str, id: Option<usize>) -> String {
        let var = match id {
            Some(id) => format!("__weave_import_{id}"),
            None => {
                let next = self.external_vars.len() + 1;
                self.external_vars
                    .entry(specifier.to_string())
                    .or_insert_with(|| format!("__weave_external_{next}"))
                    .clone()
            }
        };
        if self.declared.insert(var.clone()) {
            self.header
                .push(format!("var {var} = __weave_interop({require});"));
        }
        var
    }

    fn import_clause(&mut self, clause: &str, var: &str) {
        let (outside, inside) = match (clause.find('{'), clause.rfind('}')) {
            (Some(open), Some(close)) if open < close => (
                format!("{}{}", &clause[..open], &clause[close + 1..]),
                Some(&clause[open + 1..close]),
            ),
            _ => (clause.to_string(), None),
        };
        for item in outside.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(ns) = item.strip_prefix('*') {
                let ns = ns.trim().trim_start_matches("as").trim();
                self.bindings.insert(ns.to_string(), var.to_string());
            } else {
                self.bindings
                    .insert(item.to_string(), member(var, "default"));
            }
        }
        if let Some(inside) = inside {
            for (imported, local) in parse_bindings(inside) {
                self.bindings.insert(local, member(var, &imported));
            }
        }
    }

    fn local_expr(&self, local: &str) -> String {
        self.bindings
            .get(local)
            .cloned()
            .unwrap_or_else(|| local.to_string())
    }
}

/// Lower one module's transformed text.
fn link_module(text: &str, node: &ModuleNode, ids: &HashMap<PathBuf, usize>) -> LinkedModule {
    let syntax = scan_module(text);
    let mut linker = Linker {
        node,
        ids,
        header: Vec::new(),
        declared: HashSet::default(),
        external_vars: HashMap::default(),
        bindings: HashMap::default(),
        getters: Vec::new(),
    };
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let mut esm = !syntax.exports.is_empty();

    for record in &syntax.imports {
        let Some((require, id)) = linker.require_expr(&record.specifier) else {
            continue;
        };
        match record.kind {
            ImportKind::Static | ImportKind::SideEffect | ImportKind::ReExport => {
                esm = true;
                edits.push((record.span.clone(), String::new()));
                let clause = record.clause.as_deref().unwrap_or("");
                match record.kind {
                    ImportKind::SideEffect => linker.header.push(format!("{require};")),
                    ImportKind::Static => {
                        let var = linker.import_var(&record.specifier, &require, id);
                        linker.import_clause(clause, &var);
                    }
                    _ => {
                        let var = linker.import_var(&record.specifier, &require, id);
                        let list = clause.trim().trim_start_matches('{').trim_end_matches('}');
                        for (imported, exported) in parse_bindings(list) {
                            linker.getters.push((exported, member(&var, &imported)));
                        }
                    }
                }
            }
            ImportKind::ReExportAll => {
                esm = true;
                edits.push((record.span.clone(), String::new()));
                let clause = record.clause.as_deref().unwrap_or("*");
                match clause.trim_start_matches('*').trim().strip_prefix("as") {
                    Some(ns) => {
                        let var = linker.import_var(&record.specifier, &require, id);
                        linker.getters.push((ns.trim().to_string(), var));
                    }
                    None => linker
                        .header
                        .push(format!("__weave_export_star(exports, {require});")),
                }
            }
            ImportKind::Dynamic => {
                if id.is_some() {
                    edits.push((
                        record.span.clone(),
                        format!(
                            "Promise.resolve().then(function () {{ return __weave_interop({require}); }})"
                        ),
                    ));
                }
            }
            ImportKind::Require => {
                if id.is_some() {
                    edits.push((record.span.clone(), require));
                }
            }
        }
    }

    for export in &syntax.exports {
        match &export.kind {
            ExportKind::Declaration { names } => {
                edits.push((export.span.clone(), String::new()));
                for name in names {
                    linker.getters.push((name.clone(), name.clone()));
                }
            }
            ExportKind::DefaultDeclaration { name: Some(name) } => {
                edits.push((export.span.clone(), String::new()));
                linker.getters.push(("default".to_string(), name.clone()));
            }
            ExportKind::DefaultDeclaration { name: None } | ExportKind::Default => {
                edits.push((export.span.clone(), "var __weave_default =".to_string()));
                linker
                    .getters
                    .push(("default".to_string(), "__weave_default".to_string()));
            }
            ExportKind::List { bindings } => {
                edits.push((export.span.clone(), String::new()));
                for (local, exported) in bindings {
                    let expr = linker.local_expr(local);
                    linker.getters.push((exported.clone(), expr));
                }
            }
        }
    }

    edits.sort_by_key(|(span, _)| span.start);
    let mut body = String::with_capacity(text.len());
    let mut copied = 0;
    for (span, replacement) in edits {
        if span.start < copied {
            continue;
        }
        body.push_str(&text[copied..span.start]);
        body.push_str(&replacement);
        body.extend(std::iter::repeat('\n').take(newlines(&text[span.clone()])));
        copied = span.end;
    }
    body.push_str(&text[copied..]);

    let body = rewrite_bindings(&body, &linker.bindings);

    let mut header = Vec::new();
    if esm {
        let getters: Vec<String> = linker
            .getters
            .iter()
            .map(|(name, expr)| format!("{}: function () {{ return {expr}; }}", js_string(name)))
            .collect();
        header.push(format!("__weave_export(exports, {{{}}});", getters.join(", ")));
    }
    header.extend(linker.header);

    LinkedModule {
        header: header.join(" "),
        body,
    }
}

/// For every `(` in code, the index just past its matching `)`.
fn paren_pairs(src: &[u8], segs: &[Segment]) -> HashMap<usize, usize> {
    let mut open = Vec::new();
    let mut pairs = HashMap::default();
    for seg in segs.iter().filter(|s| s.kind == SegmentKind::Code) {
        for i in seg.range.clone() {
            match src[i] {
                b'(' => open.push(i),
                b')' => {
                    if let Some(start) = open.pop() {
                        pairs.insert(start, i + 1);
                    }
                }
                _ => {}
            }
        }
    }
    pairs
}

/// The identifier ending right before `i` (ignoring whitespace), if any.
fn prev_word(src: &[u8], i: usize) -> &[u8] {
    let mut end = i;
    while end > 0 && src[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let mut start = end;
    while start > 0 && is_ident_char(src[start - 1]) {
        start -= 1;
    }
    &src[start..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    /// `{ … }`
    Block,
    /// A parameter list, `catch (…)` or `for (…)`; its names carry into the
    /// body that follows.
    Head,
    /// The expression body of an arrow function.
    Arrow,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    /// Bracket depth just inside the scope.
    depth: usize,
    names: HashSet<String>,
}

/// Local declarations that hide import bindings.
#[derive(Debug, Default)]
struct Shadows {
    scopes: Vec<Scope>,
    /// Names of the head just closed, waiting for its body.
    pending: HashSet<String>,
}

impl Shadows {
    fn is_shadowed(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.names.contains(name))
    }

    /// Add names declared in the innermost scope. Top-level declarations
    /// cannot share a name with an import, so they are not tracked.
    fn declare(&mut self, names: impl IntoIterator<Item = String>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.extend(names);
        }
    }

    fn open(&mut self, kind: ScopeKind, depth: usize, names: HashSet<String>) {
        self.scopes.push(Scope { kind, depth, names });
    }

    /// Open the body of the pending head.
    fn open_body(&mut self, kind: ScopeKind, depth: usize) {
        let names = std::mem::take(&mut self.pending);
        self.open(kind, depth, names);
    }

    /// Close every scope opened deeper than `depth`.
    fn close_to(&mut self, depth: usize) {
        while self.scopes.last().is_some_and(|s| s.depth > depth) {
            if let Some(scope) = self.scopes.pop() {
                if scope.kind == ScopeKind::Head {
                    self.pending = scope.names;
                }
            }
        }
    }

    /// End arrow expression bodies opened at `depth`.
    fn end_arrows(&mut self, depth: usize) {
        while self
            .scopes
            .last()
            .is_some_and(|s| s.kind == ScopeKind::Arrow && s.depth >= depth)
        {
            self.scopes.pop();
        }
    }
}

/// Replace references to import bindings in code segments.
///
/// Leaves alone: property accesses, object keys, method and function
/// definitions (`name(…) {`), declarations, and every use inside a function,
/// block or arrow body where a parameter or local declaration of the same
/// name hides the import. Shorthand properties are expanded (`{ add }`
/// becomes `{ add: … }`).
fn rewrite_bindings(source: &str, bindings: &HashMap<String, String>) -> String {
    if bindings.is_empty() {
        return source.to_string();
    }
    let src = source.as_bytes();
    let segs = segments(source);
    let pairs = paren_pairs(src, &segs);
    let imported = |names: Vec<String>| -> HashSet<String> {
        names
            .into_iter()
            .filter(|n| bindings.contains_key(n))
            .collect()
    };

    let mut out = String::with_capacity(source.len() + source.len() / 4);
    let mut brackets: Vec<u8> = Vec::new();
    let mut shadows = Shadows::default();

    for seg in &segs {
        if seg.kind != SegmentKind::Code {
            out.push_str(&source[seg.range.clone()]);
            continue;
        }
        let mut i = seg.range.start;
        let mut copied = i;
        while i < seg.range.end {
            let b = src[i];
            match b {
                b'(' => {
                    brackets.push(b);
                    if let Some(&close) = pairs.get(&i) {
                        let after = skip_trivia(src, close);
                        let arrow = src[after..].starts_with(b"=>");
                        let body = src.get(after) == Some(&b'{');
                        let keyword = prev_word(src, i);
                        let head = if keyword == b"for" {
                            body.then(HashSet::default)
                        } else if arrow
                            || (body && !matches!(keyword, b"if" | b"while" | b"switch" | b"with"))
                        {
                            Some(imported(pattern_names(&source[i + 1..close - 1])))
                        } else {
                            None
                        };
                        if let Some(names) = head {
                            shadows.open(ScopeKind::Head, brackets.len(), names);
                        }
                    }
                    i += 1;
                    continue;
                }
                b'{' => {
                    brackets.push(b);
                    shadows.open_body(ScopeKind::Block, brackets.len());
                    i += 1;
                    continue;
                }
                b'[' => {
                    brackets.push(b);
                    i += 1;
                    continue;
                }
                b'}' | b')' | b']' => {
                    brackets.pop();
                    shadows.close_to(brackets.len());
                    i += 1;
                    continue;
                }
                b'=' if src.get(i + 1) == Some(&b'>') => {
                    if src.get(skip_trivia(src, i + 2)) != Some(&b'{') {
                        shadows.open_body(ScopeKind::Arrow, brackets.len());
                    }
                    i += 2;
                    continue;
                }
                b',' | b';' => {
                    shadows.end_arrows(brackets.len());
                    i += 1;
                    continue;
                }
                b'\n' if !continues_expression(src, i) => {
                    shadows.end_arrows(brackets.len());
                    i += 1;
                    continue;
                }
                _ => {}
            }
            if !is_ident_start(b) || (i > 0 && is_ident_char(src[i - 1])) {
                i += 1;
                continue;
            }
            let end = read_ident(src, i).min(seg.range.end);
            let name = &source[i..end];
            if is_member_access(src, i) {
                i = end;
                continue;
            }
            let next_at = skip_trivia(src, end);
            let next = src.get(next_at).copied();

            match name {
                "let" | "const" | "var" => {
                    shadows.declare(imported(binding_names(source, end)));
                    i = end;
                    continue;
                }
                "function" | "class" => {
                    let mut n = next_at;
                    if src.get(n) == Some(&b'*') {
                        n = skip_trivia(src, n + 1);
                    }
                    let declared = &source[n..read_ident(src, n)];
                    if bindings.contains_key(declared) {
                        shadows.declare([declared.to_string()]);
                    }
                    i = end;
                    continue;
                }
                _ => {}
            }
            // Single-parameter arrow: `add => …`.
            if next == Some(b'=') && src.get(next_at + 1) == Some(&b'>') {
                shadows.pending = imported(vec![name.to_string()]);
                i = end;
                continue;
            }
            let Some(expr) = bindings.get(name) else {
                i = end;
                continue;
            };
            if shadows.is_shadowed(name) {
                i = end;
                continue;
            }

            let in_braces = brackets.last() == Some(&b'{');
            let prev = prev_significant(src, i);
            let after_list_item = matches!(prev, Some(b'{' | b','));

            let declaration = matches!(
                prev_word(src, i),
                b"var" | b"let" | b"const" | b"function" | b"class"
            );
            let object_key = in_braces && after_list_item && next == Some(b':');
            let definition = next == Some(b'(')
                && pairs
                    .get(&next_at)
                    .is_some_and(|&close| src.get(skip_trivia(src, close)) == Some(&b'{'));

            if declaration || object_key || definition {
                i = end;
                continue;
            }

            out.push_str(&source[copied..i]);
            if in_braces && after_list_item && matches!(next, Some(b'}' | b',')) {
                out.push_str(name);
                out.push_str(": ");
            }
            out.push_str(expr);
            i = end;
            copied = end;
        }
        out.push_str(&source[copied..seg.range.end]);
    }
    out
}

/// Output buffer that tracks the current (zero-based) line.
struct LineWriter {
    text: String,
    line: u32,
}

impl LineWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            line: 0,
        }
    }

    fn push(&mut self, text: &str) {
        self.text.push_str(text);
        self.line += newlines(text) as u32;
    }
}

/// Turns module graphs into artifacts.
pub struct Emitter<'a> {
    config: &'a BuildConfig,
    namer: &'a dyn ArtifactNamer,
}

impl<'a> Emitter<'a> {
    #[must_use]
    pub fn new(config: &'a BuildConfig, namer: &'a dyn ArtifactNamer) -> Self {
        Self { config, namer }
    }

    /// Stable module ids: entry-first depth-first preorder.
    #[must_use]
    pub fn module_ids(graph: &ModuleGraph) -> HashMap<PathBuf, usize> {
        graph
            .reachable()
            .into_iter()
            .enumerate()
            .map(|(id, path)| (path, id))
            .collect()
    }

    /// Emit the artifacts of one entry: its script, the extracted style (when
    /// any module produced one) and asset side artifacts.
    ///
    /// Every reachable node must carry transformed output.
    pub fn emit(&self, graph: &ModuleGraph, entry: &EntryConfig) -> Result<Vec<Artifact>, BuildError> {
        let order = graph.reachable();
        let ids = Self::module_ids(graph);

        let nodes: Vec<&ModuleNode> = order
            .iter()
            .map(|path| {
                graph
                    .get(path)
                    .filter(|n| n.output.is_some())
                    .ok_or_else(|| {
                        BuildError::from(TransformError {
                            path: path.clone(),
                            step_index: 0,
                            step: "emit".to_string(),
                            message: "module has no transformed output".to_string(),
                        })
                    })
            })
            .collect::<Result<_, _>>()?;

        let texts: Vec<String> = nodes
            .iter()
            .map(|n| {
                let text = n
                    .output
                    .as_ref()
                    .map(|o| String::from_utf8_lossy(&o.bytes).into_owned())
                    .unwrap_or_default();
                if n.kind == FileKind::Style {
                    resolve_style_urls(&text, n, graph, "")
                } else {
                    text
                }
            })
            .collect();
        let linked: Vec<LinkedModule> = nodes
            .par_iter()
            .zip(texts.par_iter())
            .map(|(node, text)| link_module(text, node, &ids))
            .collect();

        let (mut code, map) = self.assemble(&nodes, &linked);
        let name = self.namer.name(
            &entry.output,
            &NameParts {
                name: &entry.name,
                ext: ".js",
                content: code.as_bytes(),
            },
        )?;

        let source_map = map.map(|builder| {
            let file = Path::new(&name)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone());
            code.push_str(&format!("//# sourceMappingURL={file}.map\n"));
            builder.generate(&file)
        });

        let mut artifacts = vec![Artifact {
            name,
            kind: ArtifactKind::Script,
            bytes: code.into_bytes(),
            source_map,
        }];

        let style_base = up_to_root(&self.config.style.filename);
        let mut styles = Vec::new();
        let mut assets = BTreeMap::new();
        for node in &nodes {
            let Some(output) = &node.output else { continue };
            for side in &output.side_artifacts {
                match side.kind {
                    SideArtifactKind::Style => {
                        let css = String::from_utf8_lossy(&side.bytes);
                        styles.push(resolve_style_urls(&css, node, graph, &style_base));
                    }
                    SideArtifactKind::Asset => {
                        assets
                            .entry(side.name.clone())
                            .or_insert_with(|| side.bytes.clone());
                    }
                }
            }
        }

        if !styles.is_empty() {
            let css = styles.join("\n").into_bytes();
            let name = self.namer.name(
                &self.config.style.filename,
                &NameParts {
                    name: &entry.name,
                    ext: ".css",
                    content: &css,
                },
            )?;
            artifacts.push(Artifact::new(name, ArtifactKind::Style, css));
        }
        artifacts.extend(
            assets
                .into_iter()
                .map(|(name, bytes)| Artifact::new(name, ArtifactKind::Asset, bytes)),
        );

        debug!(
            entry = %entry.name,
            modules = nodes.len(),
            artifacts = artifacts.len(),
            "emitted bundle"
        );
        Ok(artifacts)
    }

    fn assemble(
        &self,
        nodes: &[&ModuleNode],
        linked: &[LinkedModule],
    ) -> (String, Option<SourceMapBuilder>) {
        let minify = self.config.minify;
        let mut map = match self.config.source_maps {
            SourceMapMode::Off => None,
            SourceMapMode::Lines | SourceMapMode::Full => Some(SourceMapBuilder::new()),
        };

        let total: usize = linked.iter().map(|m| m.body.len() + m.header.len() + 48).sum();
        let mut out = LineWriter::with_capacity(total + RUNTIME.len() + 256);

        if !minify {
            out.push(&version::banner());
            out.push("\n");
        }
        out.push("(function () {\nvar __weave_modules = {\n");

        for (id, (node, module)) in nodes.iter().zip(linked).enumerate() {
            out.push(&format!("{id}: function (module, exports) {{ {}\n", module.header));
            let body_start = out.line;
            // Script steps keep line structure, so body line k comes from
            // line k of the file as written.
            if let (Some(map), FileKind::Script) = (map.as_mut(), node.kind) {
                let original = String::from_utf8_lossy(&node.content);
                let source =
                    map.add_source(&display_relative(&node.path, &self.config.root), &original);
                let full = self.config.source_maps == SourceMapMode::Full;
                for (k, (out_line, src_line)) in
                    module.body.lines().zip(original.lines()).enumerate()
                {
                    let k = k as u32;
                    if out_line.trim().is_empty() {
                        continue;
                    }
                    if full && out_line == src_line {
                        for col in token_columns(out_line) {
                            map.add_mapping(body_start + k, col, source, k, col);
                        }
                    } else {
                        map.add_line_mapping(body_start + k, source, k);
                    }
                }
            }
            out.push(&module.body);
            if !module.body.is_empty() && !module.body.ends_with('\n') {
                out.push("\n");
            }
            out.push("},\n");
        }

        out.push("};\n");
        if minify {
            out.push(&minify_js(RUNTIME));
        } else {
            out.push(RUNTIME);
        }
        out.push(
            "var __weave_entry = __weave_require(0);\n\
             if (typeof module === \"object\" && module && module.exports) module.exports = __weave_entry;\n\
             })();\n",
        );
        (out.text, map)
    }

    /// The HTML page, when configured: the template with a `<link>` per style
    /// and a `<script>` per script artifact injected before `</head>`.
    pub fn emit_html(&self, artifacts: &[Artifact]) -> Result<Option<Artifact>, BuildError> {
        let Some(html) = &self.config.html else {
            return Ok(None);
        };
        let template =
            std::fs::read_to_string(&html.template).map_err(|e| BuildError::read(&html.template, e))?;

        let mut tags = String::new();
        for artifact in artifacts.iter().filter(|a| a.kind == ArtifactKind::Style) {
            tags.push_str(&format!(
                "<link rel=\"stylesheet\" href=\"{}\">\n",
                artifact.name
            ));
        }
        for artifact in artifacts.iter().filter(|a| a.kind == ArtifactKind::Script) {
            tags.push_str(&format!("<script defer src=\"{}\"></script>\n", artifact.name));
        }

        let page = match template.to_ascii_lowercase().find("</head>") {
            Some(at) => format!("{}{tags}{}", &template[..at], &template[at..]),
            None => format!("{tags}{template}"),
        };
        Ok(Some(Artifact::new(
            html.filename.clone(),
            ArtifactKind::Html,
            page.into_bytes(),
        )))
    }
}

/// Write `artifacts` (and their source maps) below `out_dir`.
///
/// With `clean`, the directory is emptied first. Returns the written paths.
pub fn write_artifacts(
    out_dir: &Path,
    artifacts: &[Artifact],
    clean: bool,
) -> Result<Vec<PathBuf>, BuildError> {
    if clean {
        weave_util::fs::empty_dir(out_dir).map_err(|e| BuildError::write(out_dir, e))?;
    }
    let mut written = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let path = out_dir.join(&artifact.name);
        weave_util::fs::atomic_write(&path, &artifact.bytes)
            .map_err(|e| BuildError::write(&path, e))?;
        written.push(path);
        if let (Some(map), Some(map_name)) = (&artifact.source_map, artifact.source_map_name()) {
            let path = out_dir.join(map_name);
            weave_util::fs::atomic_write(&path, map.as_bytes())
                .map_err(|e| BuildError::write(&path, e))?;
            written.push(path);
        }
    }
    debug!(out_dir = %out_dir.display(), files = written.len(), "wrote artifacts");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::cache::CacheEntry;
    use crate::bundler::graph::ResolvedImport;
    use crate::bundler::naming::PatternNamer;
    use crate::bundler::transform::SideArtifact;
    use crate::config::Mode;
    use crate::css::urls::marker;
    use std::sync::Arc;

    fn node(path: &str, imports: &[(&str, ImportTarget)]) -> ModuleNode {
        let mut node = ModuleNode::from_content(PathBuf::from(path), Vec::new());
        node.imports = imports
            .iter()
            .map(|(s, t)| ResolvedImport {
                specifier: (*s).to_string(),
                target: t.clone(),
            })
            .collect();
        node
    }

    fn ids(paths: &[&str]) -> HashMap<PathBuf, usize> {
        paths
            .iter()
            .enumerate()
            .map(|(i, p)| (PathBuf::from(p), i))
            .collect()
    }

    fn module(path: &str) -> ImportTarget {
        ImportTarget::Module(PathBuf::from(path))
    }

    #[test]
    fn test_default_import_and_call() {
        let text = "import add from './add';\nconsole.log(add(3, 3, 4, 5));\n";
        let n = node("/app/main.js", &[("./add", module("/app/add.js"))]);
        let linked = link_module(text, &n, &ids(&["/app/main.js", "/app/add.js"]));

        assert_eq!(
            linked.header,
            "__weave_export(exports, {}); var __weave_import_1 = __weave_interop(__weave_require(1));"
        );
        assert_eq!(linked.body, "\nconsole.log(__weave_import_1.default(3, 3, 4, 5));\n");
    }

    #[test]
    fn test_exports_become_getters() {
        let text = "export const a = 1;\nexport default function add(x) { return x; }\nconst b = 2;\nexport { b as c };\n";
        let n = node("/app/a.js", &[]);
        let linked = link_module(text, &n, &ids(&["/app/a.js"]));

        assert_eq!(
            linked.header,
            "__weave_export(exports, {\"a\": function () { return a; }, \"default\": function () { return add; }, \"c\": function () { return b; }});"
        );
        assert_eq!(
            linked.body,
            " const a = 1;\n function add(x) { return x; }\nconst b = 2;\n\n"
        );
        assert_eq!(newlines(&linked.body), newlines(text));
    }

    #[test]
    fn test_default_expression() {
        let n = node("/app/a.js", &[]);
        let linked = link_module("export default { answer: 42 };\n", &n, &ids(&["/app/a.js"]));
        assert_eq!(linked.body, "var __weave_default = { answer: 42 };\n");
        assert!(linked.header.contains("return __weave_default;"));
    }

    #[test]
    fn test_named_namespace_and_reexports() {
        let text = "import { x, y as z } from './xy';\nimport * as ns from './ns';\nexport { x };\nexport { w } from './xy';\nexport * from './all';\nuse(x, z, ns.k);\n";
        let n = node(
            "/app/m.js",
            &[
                ("./xy", module("/app/xy.js")),
                ("./ns", module("/app/ns.js")),
                ("./all", module("/app/all.js")),
            ],
        );
        let linked = link_module(
            text,
            &n,
            &ids(&["/app/m.js", "/app/xy.js", "/app/ns.js", "/app/all.js"]),
        );

        assert!(linked.header.contains("\"x\": function () { return __weave_import_1.x; }"));
        assert!(linked.header.contains("\"w\": function () { return __weave_import_1.w; }"));
        assert!(linked
            .header
            .contains("__weave_export_star(exports, __weave_require(3));"));
        assert_eq!(
            linked
                .header
                .matches("var __weave_import_1 =")
                .count(),
            1
        );
        assert!(linked
            .body
            .ends_with("use(__weave_import_1.x, __weave_import_1.y, __weave_import_2.k);\n"));
    }

    #[test]
    fn test_require_dynamic_and_externals() {
        let text = "const fs = require('fs');\nconst a = require('./a');\nconst lazy = import('./a');\n";
        let n = node(
            "/app/m.js",
            &[
                ("fs", ImportTarget::External("fs".to_string())),
                ("./a", module("/app/a.js")),
            ],
        );
        let linked = link_module(text, &n, &ids(&["/app/m.js", "/app/a.js"]));
        assert_eq!(linked.header, "");
        assert_eq!(
            linked.body,
            "const fs = require('fs');\nconst a = __weave_require(1);\nconst lazy = Promise.resolve().then(function () { return __weave_interop(__weave_require(1)); });\n"
        );
    }

    #[test]
    fn test_rewrite_bindings_respects_syntax() {
        let mut bindings = HashMap::default();
        bindings.insert("add".to_string(), "m.default".to_string());

        let cases = [
            ("const o = { add };", "const o = { add: m.default };"),
            ("const o = { add: 1, b: add };", "const o = { add: 1, b: m.default };"),
            ("f(a, add, b);", "f(a, m.default, b);"),
            ("obj.add(1); 'add';", "obj.add(1); 'add';"),
            ("class A { add() { return add; } }", "class A { add() { return m.default; } }"),
            ("x = c ? add : 0;", "x = c ? m.default : 0;"),
            ("`${add(1)}`", "`${m.default(1)}`"),
        ];
        for (input, expected) in cases {
            assert_eq!(rewrite_bindings(input, &bindings), expected, "{input}");
        }
    }

    #[test]
    fn test_rewrite_bindings_leaves_shadowing_locals() {
        let mut bindings = HashMap::default();
        bindings.insert("add".to_string(), "m.default".to_string());

        let cases = [
            (
                "function twice(add) { return add * 2; }\nadd(1);",
                "function twice(add) { return add * 2; }\nm.default(1);",
            ),
            (
                "const f = (add) => add * 2; g(add);",
                "const f = (add) => add * 2; g(m.default);",
            ),
            (
                "xs.map(add => add + 1, add);",
                "xs.map(add => add + 1, m.default);",
            ),
            (
                "function f({ add }, [b] = [add]) { return add; }",
                "function f({ add }, [b] = [add]) { return add; }",
            ),
            (
                "function g(x = add) { return x; }",
                "function g(x = m.default) { return x; }",
            ),
            (
                "{ const { add } = o; use(add); }\nuse(add);",
                "{ const { add } = o; use(add); }\nuse(m.default);",
            ),
            (
                "try { x(); } catch (add) { log(add); }",
                "try { x(); } catch (add) { log(add); }",
            ),
            (
                "for (const add of list) { log(add); }\nlog(add);",
                "for (const add of list) { log(add); }\nlog(m.default);",
            ),
            (
                "if (add) { function add() {} add(); }\nadd();",
                "if (m.default) { function add() {} add(); }\nm.default();",
            ),
            (
                "const h = (add) =>\n  add + 1\nh(add);",
                "const h = (add) =>\n  add + 1\nh(m.default);",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(rewrite_bindings(input, &bindings), expected, "{input}");
        }
    }

    #[test]
    fn test_rewrite_bindings_ignores_parens_in_strings() {
        let mut bindings = HashMap::default();
        bindings.insert("add".to_string(), "m.default".to_string());
        assert_eq!(
            rewrite_bindings("log(add(\") {\"));", &bindings),
            "log(m.default(\") {\"));"
        );
        assert_eq!(
            rewrite_bindings("const r = /\\(/g; add(r);", &bindings),
            "const r = /\\(/g; m.default(r);"
        );
    }

    #[test]
    fn test_link_module_after_regex_literal() {
        let text = "const strip = (s) => s.replace(/\\(/g, '');\nexport const x = strip('(7');\n";
        let n = node("/app/lib.js", &[]);
        let linked = link_module(text, &n, &ids(&["/app/lib.js"]));
        assert_eq!(
            linked.header,
            "__weave_export(exports, {\"x\": function () { return x; }});"
        );
        assert!(!linked.body.contains("export"));
        assert_eq!(newlines(&linked.body), newlines(text));
    }

    fn transformed(path: &str, body: &str, imports: &[(&str, ImportTarget)]) -> ModuleNode {
        let mut n = ModuleNode::from_content(PathBuf::from(path), body.as_bytes().to_vec());
        n.imports = imports
            .iter()
            .map(|(s, t)| ResolvedImport {
                specifier: (*s).to_string(),
                target: t.clone(),
            })
            .collect();
        n.set_output(Arc::new(CacheEntry::new(body.as_bytes().to_vec(), Vec::new())));
        n
    }

    #[test]
    fn test_assemble_is_line_preserving() {
        let config = BuildConfig::new("/app", Mode::Development);
        let emitter = Emitter::new(&config, &PatternNamer);
        let a = transformed(
            "/app/main.js",
            "import b from './b';\nconsole.log(b);\n",
            &[("./b", module("/app/b.js"))],
        );
        let b = transformed("/app/b.js", "export default 2;\n", &[]);
        let texts = vec![
            "import b from './b';\nconsole.log(b);\n".to_string(),
            "export default 2;\n".to_string(),
        ];
        let idmap = ids(&["/app/main.js", "/app/b.js"]);
        let linked: Vec<LinkedModule> = [&a, &b]
            .iter()
            .zip(&texts)
            .map(|(n, t)| link_module(t, n, &idmap))
            .collect();

        let (code, map) = emitter.assemble(&[&a, &b], &linked);
        let lines: Vec<&str> = code.lines().collect();
        assert_eq!(lines[0], version::banner());
        assert!(lines[3].starts_with("0: function (module, exports) {"));
        assert_eq!(lines[5], "console.log(__weave_import_1.default);");
        assert!(code.ends_with("})();\n"));

        let mappings = map.unwrap().encode_mappings();
        // Banner, IIFE, registry, wrapper: the body starts on output line 4,
        // whose only statement was the hoisted import.
        assert_eq!(mappings, ";;;;;AACA;;;ACDA");
    }

    #[test]
    fn test_production_map_points_at_original_lines() {
        let original = "// Logs a marker.\n/*\n * Block\n * comment\n */\n\nconsole.log('marker');\n";
        let minified = minify_js(original);
        let mut n = ModuleNode::from_content(PathBuf::from("/app/main.js"), original.as_bytes().to_vec());
        n.set_output(Arc::new(CacheEntry::new(minified.clone().into_bytes(), Vec::new())));

        let config = BuildConfig::new("/app", Mode::Production);
        let emitter = Emitter::new(&config, &PatternNamer);
        let linked = vec![link_module(&minified, &n, &ids(&["/app/main.js"]))];
        let (code, map) = emitter.assemble(&[&n], &linked);
        let map = map.unwrap();

        let out_line = code
            .lines()
            .position(|l| l.contains("console.log('marker')"))
            .unwrap() as u32;
        assert_eq!(map.original_position(out_line, 0), Some((0, 6, 0)));

        let json: serde_json::Value = serde_json::from_str(&map.generate("main.js")).unwrap();
        assert_eq!(json["sources"][0], "main.js");
        assert_eq!(json["sourcesContent"][0], original);
    }

    #[test]
    fn test_emit_collects_side_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::write(root.join("main.js"), "import './a.css';\nimport './logo.png';\n").unwrap();
        std::fs::write(root.join("a.css"), "a{}").unwrap();
        std::fs::write(root.join("logo.png"), "png").unwrap();

        let resolver = crate::bundler::resolve::Resolver::new(
            vec![".js".to_string()],
            vec!["index.js".to_string()],
            Vec::new(),
        );
        let mut graph = ModuleGraph::build(&root.join("main.js"), &resolver);
        for path in graph.paths() {
            let n = graph.get_mut(&path).unwrap();
            let side = match path.extension().and_then(|e| e.to_str()) {
                Some("css") => vec![SideArtifact {
                    name: "x.css".to_string(),
                    kind: SideArtifactKind::Style,
                    bytes: b"a{}".to_vec(),
                }],
                Some("png") => vec![SideArtifact {
                    name: "images/logo.png".to_string(),
                    kind: SideArtifactKind::Asset,
                    bytes: b"png".to_vec(),
                }],
                _ => Vec::new(),
            };
            let bytes = n.content.to_vec();
            n.set_output(Arc::new(CacheEntry::new(bytes, side)));
        }

        let config = BuildConfig::new(&root, Mode::Production);
        let artifacts = Emitter::new(&config, &PatternNamer)
            .emit(&graph, &config.entries[0])
            .unwrap();
        let kinds: Vec<(ArtifactKind, &str)> =
            artifacts.iter().map(|a| (a.kind, a.name.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (ArtifactKind::Script, "js/main.js"),
                (ArtifactKind::Style, "css/main.css"),
                (ArtifactKind::Asset, "images/logo.png"),
            ]
        );
        assert!(artifacts[0].source_map.is_some());
        assert!(String::from_utf8_lossy(&artifacts[0].bytes)
            .ends_with("//# sourceMappingURL=main.js.map\n"));
    }

    #[test]
    fn test_emit_resolves_style_urls() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("css")).unwrap();
        std::fs::create_dir_all(root.join("img")).unwrap();
        std::fs::write(root.join("main.js"), "import './css/site.css';\n").unwrap();
        std::fs::write(
            root.join("css/site.css"),
            ".a{background:url(../img/logo.png)}.b{background:url(../img/dot.gif)}.c{background:url(./gone.png)}",
        )
        .unwrap();
        std::fs::write(root.join("img/logo.png"), "png").unwrap();
        std::fs::write(root.join("img/dot.gif"), "gif").unwrap();

        let resolver = crate::bundler::resolve::Resolver::new(
            vec![".js".to_string()],
            vec!["index.js".to_string()],
            Vec::new(),
        );
        let mut graph = ModuleGraph::build(&root.join("main.js"), &resolver);
        let css = format!(
            ".a{{background:url(\"{}\")}}.b{{background:url(\"{}\")}}.c{{background:url(\"{}\")}}",
            marker("../img/logo.png"),
            marker("../img/dot.gif"),
            marker("./gone.png"),
        );
        for path in graph.paths() {
            let n = graph.get_mut(&path).unwrap();
            let entry = match path.extension().and_then(|e| e.to_str()) {
                Some("css") => CacheEntry::new(
                    format!("module.exports = {};\n", js_string(&css)).into_bytes(),
                    vec![SideArtifact {
                        name: "site.css".to_string(),
                        kind: SideArtifactKind::Style,
                        bytes: css.clone().into_bytes(),
                    }],
                ),
                Some("png") => CacheEntry::new(b"module.exports = 1;\n".to_vec(), Vec::new())
                    .with_url(Some("images/abcd1234.png".to_string())),
                Some("gif") => CacheEntry::new(b"module.exports = 2;\n".to_vec(), Vec::new())
                    .with_url(Some("data:image/gif;base64,Z2lm".to_string())),
                _ => CacheEntry::new(n.content.to_vec(), Vec::new()),
            };
            n.set_output(Arc::new(entry));
        }

        let config = BuildConfig::new(&root, Mode::Production);
        let artifacts = Emitter::new(&config, &PatternNamer)
            .emit(&graph, &config.entries[0])
            .unwrap();

        let style = artifacts.iter().find(|a| a.kind == ArtifactKind::Style).unwrap();
        assert_eq!(style.name, "css/main.css");
        assert_eq!(
            String::from_utf8_lossy(&style.bytes),
            ".a{background:url(\"../images/abcd1234.png\")}\
             .b{background:url(\"data:image/gif;base64,Z2lm\")}\
             .c{background:url(\"./gone.png\")}"
        );

        let script = String::from_utf8_lossy(&artifacts[0].bytes);
        assert!(script.contains(r#"url(\"images/abcd1234.png\")"#), "{script}");
        assert!(!script.contains("__weave_url_"));
    }

    #[test]
    fn test_html_injection() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("index.html");
        std::fs::write(&template, "<html><head><title>t</title></head><body></body></html>").unwrap();

        let mut config = BuildConfig::new(dir.path(), Mode::Development);
        config.html = Some(crate::config::HtmlConfig {
            template,
            filename: "index.html".to_string(),
        });
        let artifacts = vec![
            Artifact::new("js/main.js".into(), ArtifactKind::Script, Vec::new()),
            Artifact::new("css/main.css".into(), ArtifactKind::Style, Vec::new()),
        ];
        let page = Emitter::new(&config, &PatternNamer)
            .emit_html(&artifacts)
            .unwrap()
            .unwrap();
        let text = String::from_utf8(page.bytes).unwrap();
        assert_eq!(
            text,
            "<html><head><title>t</title><link rel=\"stylesheet\" href=\"css/main.css\">\n<script defer src=\"js/main.js\"></script>\n</head><body></body></html>"
        );
    }

    #[test]
    fn test_write_artifacts_with_maps() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dist");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("stale.js"), "old").unwrap();

        let mut script = Artifact::new("js/main.js".into(), ArtifactKind::Script, b"1".to_vec());
        script.source_map = Some("{}".to_string());
        let written = write_artifacts(&out, &[script], true).unwrap();

        assert_eq!(written, vec![out.join("js/main.js"), out.join("js/main.js.map")]);
        assert!(!out.join("stale.js").exists());
    }
}
