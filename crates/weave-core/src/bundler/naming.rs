//! Output name patterns.
//!
//! Patterns such as `js/[name].[contenthash:8].js` are expanded with:
//! `[name]` (entry or file stem), `[ext]` (extension including the dot),
//! `[hash]` / `[contenthash]` (20 hex characters of the content hash) and
//! `[hash:N]` / `[contenthash:N]` (the first N characters).

use crate::error::ConfigurationError;
use weave_util::hash::{fingerprint_bytes, short};

/// Hash length used when a placeholder gives none.
pub const DEFAULT_HASH_LEN: usize = 20;

/// Inputs to a name pattern.
#[derive(Debug, Clone, Copy)]
pub struct NameParts<'a> {
    pub name: &'a str,
    /// Extension including the leading dot (may be empty).
    pub ext: &'a str,
    pub content: &'a [u8],
}

/// Turns a pattern and its inputs into an artifact name.
pub trait ArtifactNamer: Send + Sync {
    fn name(&self, pattern: &str, parts: &NameParts<'_>) -> Result<String, ConfigurationError>;
}

/// The default namer: placeholder expansion with [`render_name`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternNamer;

impl ArtifactNamer for PatternNamer {
    fn name(&self, pattern: &str, parts: &NameParts<'_>) -> Result<String, ConfigurationError> {
        render_name(pattern, parts)
    }
}

enum Token<'a> {
    Literal(&'a str),
    Name,
    Ext,
    Hash(usize),
}

fn tokenize(pattern: &str) -> Result<Vec<Token<'_>>, ConfigurationError> {
    let invalid = |reason: String| {
        ConfigurationError::invalid(format!("invalid name pattern '{pattern}': {reason}"))
    };

    if pattern.is_empty() {
        return Err(invalid("pattern is empty".to_string()));
    }
    if pattern.starts_with('/') || pattern.split('/').any(|seg| seg == "..") {
        return Err(invalid("pattern must stay inside the output directory".to_string()));
    }

    let mut tokens = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('[') {
        if open > 0 {
            tokens.push(Token::Literal(&rest[..open]));
        }
        let Some(close) = rest[open..].find(']') else {
            return Err(invalid("unclosed '['".to_string()));
        };
        let placeholder = &rest[open + 1..open + close];
        let token = match placeholder.split_once(':') {
            None => match placeholder {
                "name" => Token::Name,
                "ext" => Token::Ext,
                "hash" | "contenthash" => Token::Hash(DEFAULT_HASH_LEN),
                other => return Err(invalid(format!("unknown placeholder [{other}]"))),
            },
            Some(("hash" | "contenthash", len)) => match len.parse::<usize>() {
                Ok(n) if (1..=64).contains(&n) => Token::Hash(n),
                _ => return Err(invalid(format!("bad hash length in [{placeholder}]"))),
            },
            Some(_) => return Err(invalid(format!("unknown placeholder [{placeholder}]"))),
        };
        tokens.push(token);
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest));
    }
    Ok(tokens)
}

/// Check a pattern without rendering it.
pub fn validate_pattern(pattern: &str) -> Result<(), ConfigurationError> {
    tokenize(pattern).map(|_| ())
}

/// Expand `pattern` for `parts`.
pub fn render_name(pattern: &str, parts: &NameParts<'_>) -> Result<String, ConfigurationError> {
    let tokens = tokenize(pattern)?;
    let mut digest: Option<String> = None;
    let mut out = String::with_capacity(pattern.len() + 16);
    for token in tokens {
        match token {
            Token::Literal(s) => out.push_str(s),
            Token::Name => out.push_str(parts.name),
            Token::Ext => out.push_str(parts.ext),
            Token::Hash(len) => {
                let digest = digest.get_or_insert_with(|| fingerprint_bytes(parts.content));
                out.push_str(short(digest, len));
            }
        }
    }
    Ok(out)
}
