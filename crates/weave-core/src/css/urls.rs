//! `url()` references in stylesheets.
//!
//! The graph follows the local ones as edges of the style node. The `css`
//! step swaps each one for a [`marker`], which the emitter replaces with the
//! URL of the asset the reference resolved to.

use std::fmt::Write as _;

const MARKER_PREFIX: &str = "__weave_url_";
const MARKER_SUFFIX: &str = "__";

/// Raw `url()` arguments in `source`, in order of appearance.
///
/// Comments, quoted strings outside `url()` and `@import` rules are skipped.
#[must_use]
pub fn scan_urls(source: &str) -> Vec<String> {
    let src = source.as_bytes();
    let mut urls = Vec::new();
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'/' if src.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..].find("*/").map_or(src.len(), |end| i + 2 + end + 2);
            }
            quote @ (b'"' | b'\'') => i = skip_quoted(src, i, quote),
            b'@' if source[i + 1..].starts_with("import") => {
                i = source[i..].find(';').map_or(src.len(), |end| i + end + 1);
            }
            b'u' | b'U'
                if src.len() >= i + 4
                    && src[i..i + 4].eq_ignore_ascii_case(b"url(")
                    && (i == 0 || !is_name_char(src[i - 1])) =>
            {
                let (url, next) = read_url(source, i + 4);
                if let Some(url) = url {
                    urls.push(url);
                }
                i = next;
            }
            _ => i += 1,
        }
    }
    urls
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn skip_quoted(src: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' => return i,
            _ => i += 1,
        }
    }
    src.len()
}

/// Argument of a `url(` whose body starts at `start`, and the index after `)`.
fn read_url(source: &str, start: usize) -> (Option<String>, usize) {
    let src = source.as_bytes();
    let mut i = start;
    while i < src.len() && src[i].is_ascii_whitespace() {
        i += 1;
    }
    let (raw, after) = match src.get(i) {
        Some(&quote @ (b'"' | b'\'')) => {
            let end = skip_quoted(src, i, quote);
            let close = if end > i + 1 && src[end - 1] == quote {
                end - 1
            } else {
                end
            };
            (&source[i + 1..close], end)
        }
        _ => {
            let end = source[i..].find(')').map_or(src.len(), |e| i + e);
            (source[i..end].trim_end(), end)
        }
    };
    let next = source[after..].find(')').map_or(src.len(), |e| after + e + 1);
    let url = raw.trim();
    ((!url.is_empty()).then(|| url.to_string()), next)
}

/// The import specifier a `url()` argument refers to, or `None` when it
/// points outside the project: `data:` URIs, absolute URLs, root-relative
/// paths and fragments.
///
/// Bare paths are relative to the stylesheet (`logo.png` is `./logo.png`),
/// `~pkg/file` names a package, and queries and fragments are dropped.
#[must_use]
pub fn url_specifier(url: &str) -> Option<String> {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    if url.is_empty()
        || url.starts_with('#')
        || url.starts_with('/')
        || lower.starts_with("data:")
        || lower.contains("://")
    {
        return None;
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.is_empty() {
        return None;
    }
    if let Some(package) = path.strip_prefix('~') {
        return Some(package.to_string());
    }
    if path.starts_with("./") || path.starts_with("../") {
        Some(path.to_string())
    } else {
        Some(format!("./{path}"))
    }
}

/// Placeholder standing for `url` in processed CSS.
///
/// Hex keeps it valid unquoted CSS and unchanged by JSON string escaping.
#[must_use]
pub fn marker(url: &str) -> String {
    let mut out = String::with_capacity(MARKER_PREFIX.len() + url.len() * 2 + 2);
    out.push_str(MARKER_PREFIX);
    for b in url.bytes() {
        let _ = write!(out, "{b:02x}");
    }
    out.push_str(MARKER_SUFFIX);
    out
}

/// Replace every marker in `text` with `resolve(url)`.
pub fn replace_markers(text: &str, mut resolve: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(MARKER_PREFIX) {
        out.push_str(&rest[..start]);
        let body = &rest[start + MARKER_PREFIX.len()..];
        let hex_len = body.bytes().take_while(u8::is_ascii_hexdigit).count();
        let decoded = body[hex_len..]
            .starts_with(MARKER_SUFFIX)
            .then(|| decode_hex(&body[..hex_len]))
            .flatten();
        match decoded {
            Some(url) => {
                out.push_str(&resolve(&url));
                rest = &body[hex_len + MARKER_SUFFIX.len()..];
            }
            None => {
                out.push_str(MARKER_PREFIX);
                rest = body;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_hex(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
