//! Static import/export scanner.
//!
//! Finds `import … from`, side-effect `import '…'`, `export … from`,
//! `export *`, dynamic `import(…)` and `require(…)` without executing or fully
//! parsing the module. The byte spans it records let the emitter rewrite each
//! statement in place.

use super::lexer::{
    is_ident_char, is_ident_start, is_member_access, read_ident, segments, skip_string,
    skip_trivia, SegmentKind,
};
use std::ops::Range;

/// How a dependency is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x, { y } from '…'`
    Static,
    /// `import '…'`
    SideEffect,
    /// `export { a, b as c } from '…'`
    ReExport,
    /// `export * from '…'` or `export * as ns from '…'`
    ReExportAll,
    /// `import('…')`
    Dynamic,
    /// `require('…')`
    Require,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub specifier: String,
    pub kind: ImportKind,
    /// Byte range of the statement or call expression.
    pub span: Range<usize>,
    /// Text between the keyword and `from`, for clause-bearing statements.
    pub clause: Option<String>,
    /// 1-indexed line of the keyword.
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    /// `export const a = …`, `export function f`, `export class C`.
    /// The span covers only the `export` keyword.
    Declaration { names: Vec<String> },
    /// `export default <expression>`. The span covers `export default`.
    Default,
    /// `export default function f` / `export default class C`.
    /// The span covers `export default`.
    DefaultDeclaration { name: Option<String> },
    /// `export { a, b as c }`. The span covers the whole statement.
    List { bindings: Vec<(String, String)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub kind: ExportKind,
    pub span: Range<usize>,
    pub line: u32,
}

/// Everything the scanner found in one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSyntax {
    pub imports: Vec<ImportRecord>,
    pub exports: Vec<ExportRecord>,
}

impl ModuleSyntax {
    /// Distinct specifiers in first-appearance order.
    #[must_use]
    pub fn specifiers(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.imports
            .iter()
            .filter(|r| seen.insert(r.specifier.as_str()))
            .map(|r| r.specifier.clone())
            .collect()
    }
}

/// Scan `source` for imports and exports.
#[must_use]
pub fn scan_module(source: &str) -> ModuleSyntax {
    Scanner::new(source).run()
}

struct Scanner<'a> {
    source: &'a str,
    src: &'a [u8],
    depth: usize,
    syntax: ModuleSyntax,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            src: source.as_bytes(),
            depth: 0,
            syntax: ModuleSyntax::default(),
        }
    }

    fn line_at(&self, pos: usize) -> u32 {
        self.src[..pos].iter().filter(|&&b| b == b'\n').count() as u32 + 1
    }

    /// Walk the code segments only, so brackets inside strings, template
    /// text, regular expressions and comments never affect nesting.
    fn run(mut self) -> ModuleSyntax {
        let mut resume = 0;
        for seg in segments(self.source) {
            if seg.kind != SegmentKind::Code || seg.range.end <= resume {
                continue;
            }
            let mut i = seg.range.start.max(resume);
            while i < seg.range.end {
                let b = self.src[i];
                match b {
                    b'{' | b'(' | b'[' => {
                        self.depth += 1;
                        i += 1;
                    }
                    b'}' | b')' | b']' => {
                        self.depth = self.depth.saturating_sub(1);
                        i += 1;
                    }
                    _ if is_ident_start(b) && (i == 0 || !is_ident_char(self.src[i - 1])) => {
                        let end = read_ident(self.src, i);
                        i = if is_member_access(self.src, i) {
                            end
                        } else {
                            match &self.src[i..end] {
                                b"import" => self.import(i, end),
                                b"export" if self.depth == 0 => self.export(i, end),
                                b"require" => self.require(i, end),
                                _ => end,
                            }
                        };
                    }
                    _ => i += 1,
                }
            }
            // Statement handlers may consume past the segment (into strings).
            resume = i;
        }
        self.syntax
    }

    /// Read a quoted string at `i`, returning its contents and end.
    fn string_at(&self, i: usize) -> Option<(String, usize)> {
        match self.src.get(i) {
            Some(b'"' | b'\'') => {
                let end = skip_string(self.src, i);
                if end < i + 2 || self.src[end - 1] != self.src[i] {
                    return None;
                }
                Some((self.source[i + 1..end - 1].to_string(), end))
            }
            _ => None,
        }
    }

    /// Extend a statement end over an optional trailing semicolon.
    fn statement_end(&self, end: usize) -> usize {
        let mut j = end;
        while j < self.src.len() && matches!(self.src[j], b' ' | b'\t') {
            j += 1;
        }
        if self.src.get(j) == Some(&b';') {
            j + 1
        } else {
            end
        }
    }

    fn push_import(
        &mut self,
        kind: ImportKind,
        specifier: String,
        span: Range<usize>,
        clause: Option<String>,
    ) {
        let line = self.line_at(span.start);
        self.syntax.imports.push(ImportRecord {
            specifier,
            kind,
            span,
            clause,
            line,
        });
    }

    fn import(&mut self, start: usize, kw_end: usize) -> usize {
        let i = skip_trivia(self.src, kw_end);
        match self.src.get(i) {
            Some(b'(') => {
                let arg = skip_trivia(self.src, i + 1);
                if let Some((spec, after)) = self.string_at(arg) {
                    let close = skip_trivia(self.src, after);
                    if self.src.get(close) == Some(&b')') {
                        self.push_import(ImportKind::Dynamic, spec, start..close + 1, None);
                        return close + 1;
                    }
                }
                kw_end
            }
            Some(b'.') => kw_end,
            Some(b'"' | b'\'') if self.depth == 0 => match self.string_at(i) {
                Some((spec, end)) => {
                    let end = self.statement_end(end);
                    self.push_import(ImportKind::SideEffect, spec, start..end, None);
                    end
                }
                None => kw_end,
            },
            Some(_) if self.depth == 0 => match self.clause_and_from(i) {
                Some((clause_end, spec, end)) => {
                    let clause = self.source[i..clause_end].trim().to_string();
                    let end = self.statement_end(end);
                    self.push_import(ImportKind::Static, spec, start..end, Some(clause));
                    end
                }
                None => kw_end,
            },
            _ => kw_end,
        }
    }

    /// Scan an import/export clause up to `from '…'`.
    ///
    /// Returns the end of the clause, the specifier and the end of the string.
    fn clause_and_from(&self, mut i: usize) -> Option<(usize, String, usize)> {
        while i < self.src.len() {
            let b = self.src[i];
            if b.is_ascii_whitespace() || b == b',' || b == b'*' {
                i += 1;
            } else if b == b'{' {
                let close = self.src[i..].iter().position(|&c| c == b'}')?;
                i += close + 1;
            } else if is_ident_start(b) {
                let end = read_ident(self.src, i);
                if &self.src[i..end] == b"from" {
                    let s = skip_trivia(self.src, end);
                    let (spec, str_end) = self.string_at(s)?;
                    return Some((i, spec, str_end));
                }
                i = end;
            } else {
                return None;
            }
        }
        None
    }

    fn export(&mut self, start: usize, kw_end: usize) -> usize {
        let i = skip_trivia(self.src, kw_end);
        let Some(&b) = self.src.get(i) else {
            return kw_end;
        };

        if b == b'*' {
            return match self.clause_and_from(i) {
                Some((clause_end, spec, end)) => {
                    let clause = self.source[i..clause_end].trim().to_string();
                    let end = self.statement_end(end);
                    self.push_import(ImportKind::ReExportAll, spec, start..end, Some(clause));
                    end
                }
                None => kw_end,
            };
        }

        if b == b'{' {
            let Some(close) = self.src[i..].iter().position(|&c| c == b'}') else {
                return kw_end;
            };
            let close = i + close;
            let after = skip_trivia(self.src, close + 1);
            if self.src[after..].starts_with(b"from")
                && !self.src.get(after + 4).is_some_and(|&c| is_ident_char(c))
            {
                let s = skip_trivia(self.src, after + 4);
                if let Some((spec, end)) = self.string_at(s) {
                    let clause = self.source[i..=close].trim().to_string();
                    let end = self.statement_end(end);
                    self.push_import(ImportKind::ReExport, spec, start..end, Some(clause));
                    return end;
                }
                return kw_end;
            }
            let bindings = parse_bindings(&self.source[i + 1..close]);
            let end = self.statement_end(close + 1);
            let line = self.line_at(start);
            self.syntax.exports.push(ExportRecord {
                kind: ExportKind::List { bindings },
                span: start..end,
                line,
            });
            return end;
        }

        if !is_ident_start(b) {
            return kw_end;
        }
        let word_end = read_ident(self.src, i);
        let line = self.line_at(start);
        let kind = match &self.src[i..word_end] {
            b"default" => {
                let d = skip_trivia(self.src, word_end);
                let (decl_name, is_decl) = self.declaration_name(d);
                let record = if is_decl {
                    ExportKind::DefaultDeclaration { name: decl_name }
                } else {
                    ExportKind::Default
                };
                self.syntax.exports.push(ExportRecord {
                    kind: record,
                    span: start..word_end,
                    line,
                });
                return word_end;
            }
            b"const" | b"let" | b"var" => {
                let names = binding_names(self.source, word_end);
                ExportKind::Declaration { names }
            }
            b"function" | b"class" | b"async" => match self.declaration_name(i) {
                (Some(name), true) => ExportKind::Declaration { names: vec![name] },
                _ => return kw_end,
            },
            _ => return kw_end,
        };
        self.syntax.exports.push(ExportRecord {
            kind,
            span: start..kw_end,
            line,
        });
        kw_end
    }

    /// If a function/class declaration starts at `i`, return its name.
    fn declaration_name(&self, i: usize) -> (Option<String>, bool) {
        let mut j = i;
        let mut word_end = read_ident(self.src, j);
        if &self.src[j..word_end] == b"async" {
            j = skip_trivia(self.src, word_end);
            word_end = read_ident(self.src, j);
        }
        let word = &self.src[j..word_end];
        if word != b"function" && word != b"class" {
            return (None, false);
        }
        let mut n = skip_trivia(self.src, word_end);
        if self.src.get(n) == Some(&b'*') {
            n = skip_trivia(self.src, n + 1);
        }
        let name_end = read_ident(self.src, n);
        if name_end > n && is_ident_start(self.src[n]) && &self.src[n..name_end] != b"extends" {
            (Some(self.source[n..name_end].to_string()), true)
        } else {
            (None, true)
        }
    }

    fn require(&mut self, start: usize, kw_end: usize) -> usize {
        let i = skip_trivia(self.src, kw_end);
        if self.src.get(i) != Some(&b'(') {
            return kw_end;
        }
        let arg = skip_trivia(self.src, i + 1);
        if let Some((spec, after)) = self.string_at(arg) {
            let close = skip_trivia(self.src, after);
            if self.src.get(close) == Some(&b')') {
                self.push_import(ImportKind::Require, spec, start..close + 1, None);
                return close + 1;
            }
        }
        kw_end
    }
}

/// Parse `a, b as c, default as d` into `(local, exported)` pairs.
#[must_use]
pub fn parse_bindings(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|item| {
            let mut parts = item.split_whitespace();
            let local = parts.next()?;
            match (parts.next(), parts.next()) {
                (Some("as"), Some(alias)) => Some((local.to_string(), alias.to_string())),
                _ => Some((local.to_string(), local.to_string())),
            }
        })
        .collect()
}

/// Split `text` at `sep` bytes that are outside brackets and strings.
fn split_top_level(text: &str, sep: u8) -> Vec<&str> {
    let src = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'"' | b'\'' | b'`' => {
                i = skip_string(src, i);
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&text[start..]);
    parts
}

/// Names bound by a comma-separated list of binding patterns, as found in a
/// parameter list or a declaration.
///
/// Handles defaults (`a = 1`), rest elements (`...rest`), renames inside
/// object patterns (`key: local`) and nested object/array patterns.
pub(crate) fn pattern_names(list: &str) -> Vec<String> {
    let mut names = Vec::new();
    collect_pattern_names(list, &mut names);
    names
}

fn collect_pattern_names(list: &str, names: &mut Vec<String>) {
    for item in split_top_level(list, b',') {
        let target = split_top_level(item, b'=')[0].trim();
        let target = target.strip_prefix("...").unwrap_or(target).trim();
        let target = match split_top_level(target, b':').as_slice() {
            [_, value, ..] => value.trim(),
            _ => target,
        };
        let nested = target
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .or_else(|| target.strip_prefix('[').and_then(|t| t.strip_suffix(']')));
        match nested {
            Some(inner) => collect_pattern_names(inner, names),
            None => {
                if target.bytes().next().is_some_and(is_ident_start)
                    && target.bytes().all(is_ident_char)
                {
                    names.push(target.to_string());
                }
            }
        }
    }
}

/// Index just past the bracket matching the one at `open`.
fn matching_close(src: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < src.len() {
        match src[i] {
            b'"' | b'\'' | b'`' => {
                i = skip_string(src, i);
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Names bound by a `const`/`let`/`var` declaration starting at `start`.
///
/// Handles plain identifiers, several comma-separated declarators at the top
/// nesting level, and object/array destructuring patterns.
pub(crate) fn binding_names(source: &str, start: usize) -> Vec<String> {
    let src = source.as_bytes();
    let mut names = Vec::new();
    let mut i = skip_trivia(src, start);
    loop {
        match src.get(i) {
            Some(b'{' | b'[') => {
                let Some(close) = matching_close(src, i) else {
                    break;
                };
                names.extend(pattern_names(&source[i..close]));
                i = close;
            }
            Some(&c) if is_ident_start(c) => {
                let end = read_ident(src, i);
                names.push(source[i..end].to_string());
                i = end;
            }
            _ => break,
        }
        // Skip the initializer up to a top-level comma or the statement end.
        let mut depth = 0usize;
        let mut found_comma = false;
        while i < src.len() {
            match src[i] {
                b'"' | b'\'' => {
                    i = skip_string(src, i);
                    continue;
                }
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' if depth == 0 => break,
                b')' | b']' | b'}' => depth -= 1,
                b',' if depth == 0 => {
                    found_comma = true;
                    i += 1;
                    break;
                }
                b';' if depth == 0 => break,
                b'\n' if depth == 0 && !continues_expression(src, i) => break,
                _ => {}
            }
            i += 1;
        }
        if !found_comma {
            break;
        }
        i = skip_trivia(src, i);
    }
    names
}

/// Whether the line ending at `newline` continues onto the next one.
pub(crate) fn continues_expression(src: &[u8], newline: usize) -> bool {
    let prev = src[..newline]
        .iter()
        .rev()
        .find(|b| !matches!(b, b' ' | b'\t' | b'\r'));
    matches!(
        prev,
        Some(
            b'=' | b',' | b'(' | b'[' | b'{' | b'+' | b'-' | b'*' | b'/' | b'?' | b':' | b'&' | b'|'
                | b'>'
        )
    )
}
