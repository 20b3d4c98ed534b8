//! Minimal JavaScript lexing shared by the import scanner, the `define` and
//! `minify` steps, and the emitter's identifier rewriting.
//!
//! Source is split into segments so callers can work on code while leaving
//! strings, template text, regular expressions and comments untouched. All
//! delimiters are ASCII, so every segment boundary is a `char` boundary.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Code,
    /// A quoted string literal, quotes included.
    Str,
    /// Raw template text, including the backtick or `}` that opens it and the
    /// backtick or `${` that closes it.
    Template,
    Regex,
    LineComment,
    BlockComment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub kind: SegmentKind,
    pub range: Range<usize>,
}

pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

pub(crate) fn is_ident_char(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

/// Index just past the string literal whose opening quote is at `start`.
///
/// Unterminated strings end at the next newline.
pub(crate) fn skip_string(src: &[u8], start: usize) -> usize {
    let quote = src[start];
    let mut i = start + 1;
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    src.len()
}

/// Index of the newline ending the line comment at `start` (or EOF).
pub(crate) fn skip_line_comment(src: &[u8], start: usize) -> usize {
    src[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(src.len(), |p| start + p)
}

/// Index just past the `*/` closing the block comment at `start`.
pub(crate) fn skip_block_comment(src: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < src.len() {
        if src[i] == b'*' && src[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    src.len()
}

/// Index of the first non-whitespace byte at or after `i`.
pub(crate) fn skip_ws(src: &[u8], mut i: usize) -> usize {
    while i < src.len() && src[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Like [`skip_ws`], also skipping comments.
pub(crate) fn skip_trivia(src: &[u8], mut i: usize) -> usize {
    loop {
        i = skip_ws(src, i);
        if i + 1 < src.len() && src[i] == b'/' && src[i + 1] == b'/' {
            i = skip_line_comment(src, i);
        } else if i + 1 < src.len() && src[i] == b'/' && src[i + 1] == b'*' {
            i = skip_block_comment(src, i);
        } else {
            return i;
        }
    }
}

/// End of the identifier starting at `i`.
pub(crate) fn read_ident(src: &[u8], mut i: usize) -> usize {
    while i < src.len() && is_ident_char(src[i]) {
        i += 1;
    }
    i
}

/// Previous non-whitespace byte before `i`.
pub(crate) fn prev_significant(src: &[u8], i: usize) -> Option<u8> {
    src[..i].iter().rev().find(|b| !b.is_ascii_whitespace()).copied()
}

/// Whether the identifier at `start` is accessed as a property (`a.b`, not `...b`).
pub(crate) fn is_member_access(src: &[u8], start: usize) -> bool {
    let mut i = start;
    while i > 0 && src[i - 1].is_ascii_whitespace() {
        i -= 1;
    }
    if i == 0 || src[i - 1] != b'.' {
        return false;
    }
    !(i >= 3 && src[i - 2] == b'.' && src[i - 3] == b'.')
}

/// Whether a `/` at `i` starts a regular expression rather than a division.
fn regex_allowed(src: &[u8], i: usize) -> bool {
    match prev_significant(src, i) {
        None => true,
        Some(b) => {
            if matches!(
                b,
                b'(' | b',' | b'=' | b':' | b'[' | b'!' | b'&' | b'|' | b'?' | b'{' | b'}' | b';'
                    | b'+' | b'-' | b'*' | b'%' | b'<' | b'>' | b'~' | b'^'
            ) {
                return true;
            }
            // Keywords such as `return /x/`.
            let mut end = i;
            while end > 0 && src[end - 1].is_ascii_whitespace() {
                end -= 1;
            }
            let mut start = end;
            while start > 0 && is_ident_char(src[start - 1]) {
                start -= 1;
            }
            matches!(
                &src[start..end],
                b"return" | b"typeof" | b"instanceof" | b"in" | b"of" | b"new" | b"delete"
                    | b"void" | b"throw" | b"case" | b"do" | b"else" | b"yield" | b"await"
            )
        }
    }
}

fn skip_regex(src: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut in_class = false;
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b'[' => {
                in_class = true;
                i += 1;
            }
            b']' => {
                in_class = false;
                i += 1;
            }
            b'/' if !in_class => {
                return read_ident(src, i + 1);
            }
            _ => i += 1,
        }
    }
    src.len()
}

/// Scan template text starting at `i` (just past the opening delimiter).
/// Returns the end index and whether the chunk ended with `${`.
fn skip_template_chunk(src: &[u8], mut i: usize) -> (usize, bool) {
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b'`' => return (i + 1, false),
            b'$' if src.get(i + 1) == Some(&b'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (src.len(), false)
}

/// Split `source` into code and non-code segments.
pub(crate) fn segments(source: &str) -> Vec<Segment> {
    let src = source.as_bytes();
    let mut out = Vec::new();
    let mut code_start = 0;
    let mut i = 0;
    let mut depth = 0usize;
    // Brace depth at which each open `${` expression started.
    let mut templates: Vec<usize> = Vec::new();

    let push = |out: &mut Vec<Segment>, kind, range: Range<usize>| {
        if !range.is_empty() {
            out.push(Segment { kind, range });
        }
    };

    while i < src.len() {
        let b = src[i];
        let (kind, end) = match b {
            b'"' | b'\'' => (SegmentKind::Str, skip_string(src, i)),
            b'`' => {
                let (end, opened) = skip_template_chunk(src, i + 1);
                if opened {
                    templates.push(depth);
                }
                (SegmentKind::Template, end)
            }
            b'/' if src.get(i + 1) == Some(&b'/') => {
                (SegmentKind::LineComment, skip_line_comment(src, i))
            }
            b'/' if src.get(i + 1) == Some(&b'*') => {
                (SegmentKind::BlockComment, skip_block_comment(src, i))
            }
            b'/' if regex_allowed(src, i) => (SegmentKind::Regex, skip_regex(src, i)),
            b'{' => {
                depth += 1;
                i += 1;
                continue;
            }
            b'}' if templates.last() == Some(&depth) => {
                templates.pop();
                let (end, opened) = skip_template_chunk(src, i + 1);
                if opened {
                    templates.push(depth);
                }
                (SegmentKind::Template, end)
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                i += 1;
                continue;
            }
            _ => {
                i += 1;
                continue;
            }
        };
        push(&mut out, SegmentKind::Code, code_start..i);
        let end = end.min(src.len()).max(i + 1);
        push(&mut out, kind, i..end);
        i = end;
        code_start = i;
    }
    push(&mut out, SegmentKind::Code, code_start..src.len());
    out
}

/// Replace whole identifiers (or dotted paths such as `process.env.NODE_ENV`)
/// in code segments. Property accesses (`x.name`) are left alone.
///
/// Keys are tried longest first so that overlapping keys behave predictably.
pub(crate) fn replace_identifiers(source: &str, replacements: &[(String, String)]) -> String {
    if replacements.is_empty() {
        return source.to_string();
    }
    let mut keys: Vec<&(String, String)> = replacements.iter().collect();
    keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

    let src = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    for seg in segments(source) {
        if seg.kind != SegmentKind::Code {
            out.push_str(&source[seg.range]);
            continue;
        }
        let mut i = seg.range.start;
        let mut copied = i;
        while i < seg.range.end {
            if !is_ident_start(src[i]) || (i > 0 && is_ident_char(src[i - 1])) {
                i += 1;
                continue;
            }
            let matched = keys.iter().find(|(from, _)| {
                let end = i + from.len();
                end <= seg.range.end
                    && &src[i..end] == from.as_bytes()
                    && (end == src.len() || !is_ident_char(src[end]))
            });
            match matched {
                Some((from, to)) if !is_member_access(src, i) => {
                    out.push_str(&source[copied..i]);
                    out.push_str(to);
                    i += from.len();
                    copied = i;
                }
                _ => i = read_ident(src, i),
            }
        }
        out.push_str(&source[copied..seg.range.end]);
    }
    out
}
