//! Transform registry.
//!
//! Maps file-type predicates to transform chains. Each module gets exactly one
//! chain: when several predicates match, the one pinning down the most literal
//! characters wins, and a tie between the best two is a configuration error.

use super::graph::extension_of;
use super::transform::{Chain, TransformKind};
use crate::config::{BuildConfig, Mode};
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which files a chain applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    /// File extension, without the dot (case-insensitive).
    Extension(String),
    /// End of the file name, e.g. `.module.css`.
    Suffix(String),
    /// Glob over the path relative to the project root, e.g. `src/**/*.js`.
    Glob(String),
    /// Regular expression over the full path (forward slashes).
    Regex(String),
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extension(e) => write!(f, "extension({e})"),
            Self::Suffix(s) => write!(f, "suffix({s})"),
            Self::Glob(g) => write!(f, "glob({g})"),
            Self::Regex(r) => write!(f, "regex({r})"),
        }
    }
}

impl Predicate {
    /// Number of literal characters the pattern pins down.
    #[must_use]
    pub fn specificity(&self) -> usize {
        match self {
            Self::Extension(e) => e.trim_start_matches('.').chars().count() + 1,
            Self::Suffix(s) => s.chars().count(),
            Self::Glob(g) => glob_literals(g),
            Self::Regex(r) => regex_literals(r),
        }
    }

    fn compile(&self) -> Result<Matcher, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidPredicate {
            predicate: self.to_string(),
            reason,
        };
        match self {
            Self::Extension(e) => {
                let ext = e.trim_start_matches('.').to_ascii_lowercase();
                if ext.is_empty() {
                    return Err(invalid("extension is empty".to_string()));
                }
                Ok(Matcher::Extension(ext))
            }
            Self::Suffix(s) => {
                if s.is_empty() {
                    return Err(invalid("suffix is empty".to_string()));
                }
                Ok(Matcher::Suffix(s.to_ascii_lowercase()))
            }
            Self::Glob(g) => glob::Pattern::new(g)
                .map(Matcher::Glob)
                .map_err(|e| invalid(e.to_string())),
            Self::Regex(r) => regex_lite::Regex::new(r)
                .map(Matcher::Regex)
                .map_err(|e| invalid(e.to_string())),
        }
    }
}

fn glob_literals(pattern: &str) -> usize {
    let mut count = 0;
    let mut in_class = false;
    for c in pattern.chars() {
        match c {
            '[' if !in_class => {
                in_class = true;
                count += 1;
            }
            ']' if in_class => in_class = false,
            '*' | '?' if !in_class => {}
            _ if in_class => {}
            _ => count += 1,
        }
    }
    count
}

fn regex_literals(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
                count += 1;
            }
            '[' => {
                // A class matches one character.
                let mut escaped = false;
                for n in chars.by_ref() {
                    if escaped {
                        escaped = false;
                    } else if n == '\\' {
                        escaped = true;
                    } else if n == ']' {
                        break;
                    }
                }
                count += 1;
            }
            '(' if chars.peek() == Some(&'?') => {
                // Group flags such as `(?i)` or `(?:`.
                for n in chars.by_ref() {
                    if n == ')' || n == ':' {
                        break;
                    }
                }
            }
            '{' => {
                for n in chars.by_ref() {
                    if n == '}' {
                        break;
                    }
                }
            }
            '^' | '$' | '.' | '*' | '+' | '?' | '(' | ')' | '|' => {}
            _ => count += 1,
        }
    }
    count
}

#[derive(Debug)]
enum Matcher {
    Extension(String),
    Suffix(String),
    Glob(glob::Pattern),
    Regex(regex_lite::Regex),
}

impl Matcher {
    /// The file-name ending this matcher requires, when that is all it checks.
    fn literal_suffix(&self) -> Option<String> {
        match self {
            Self::Extension(ext) => Some(format!(".{ext}")),
            Self::Suffix(suffix) => Some(suffix.clone()),
            Self::Glob(_) | Self::Regex(_) => None,
        }
    }

    fn matches(&self, path: &Path, root: &Path) -> bool {
        match self {
            Self::Extension(ext) => extension_of(path) == *ext,
            Self::Suffix(suffix) => path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().to_ascii_lowercase().ends_with(suffix)),
            Self::Glob(pattern) => {
                let relative = path.strip_prefix(root).unwrap_or(path);
                let options = glob::MatchOptions {
                    require_literal_separator: true,
                    ..glob::MatchOptions::new()
                };
                pattern.matches_with(&slashed(relative), options)
            }
            Self::Regex(re) => re.is_match(&slashed(path)),
        }
    }
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[derive(Debug)]
struct Rule {
    predicate: Predicate,
    matcher: Matcher,
    exclude: Option<(Predicate, Matcher)>,
    chain: Chain,
    chain_id: String,
}

/// The chain selected for a file.
#[derive(Debug, Clone, Copy)]
pub struct ChainMatch<'a> {
    pub predicate: &'a Predicate,
    pub chain: &'a Chain,
    /// Identity fingerprint of the chain under the registry's mode.
    pub chain_id: &'a str,
}

/// Predicate → chain rules for one build mode.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    mode: Mode,
    rules: Vec<Rule>,
}

impl Registry {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, mode: Mode) -> Self {
        Self {
            root: root.into(),
            mode,
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Register `chain` for files matching `predicate`.
    ///
    /// An exact duplicate of an already registered predicate is rejected, as
    /// is an extension or suffix that ends file names exactly like an equally
    /// specific one already registered.
    pub fn register(&mut self, predicate: Predicate, chain: Chain) -> Result<(), ConfigurationError> {
        self.insert(predicate, None, chain)
    }

    /// Like [`Self::register`], skipping files that also match `exclude`.
    pub fn register_excluding(
        &mut self,
        predicate: Predicate,
        exclude: Predicate,
        chain: Chain,
    ) -> Result<(), ConfigurationError> {
        self.insert(predicate, Some(exclude), chain)
    }

    /// Register a chain built from tagged step configurations.
    pub fn register_kinds(
        &mut self,
        predicate: Predicate,
        kinds: Vec<TransformKind>,
    ) -> Result<(), ConfigurationError> {
        self.register(predicate, Chain::from_kinds(kinds)?)
    }

    fn insert(
        &mut self,
        predicate: Predicate,
        exclude: Option<Predicate>,
        chain: Chain,
    ) -> Result<(), ConfigurationError> {
        if self.rules.iter().any(|r| r.predicate == predicate) {
            return Err(ConfigurationError::DuplicatePredicate {
                predicate: predicate.to_string(),
            });
        }
        let matcher = predicate.compile()?;
        if let Some(suffix) = matcher.literal_suffix() {
            let score = predicate.specificity();
            let overlapping = self.rules.iter().find(|r| {
                r.predicate.specificity() == score
                    && r.matcher.literal_suffix().as_deref() == Some(suffix.as_str())
            });
            if let Some(rule) = overlapping {
                return Err(ConfigurationError::OverlappingPredicates {
                    first: rule.predicate.to_string(),
                    second: predicate.to_string(),
                });
            }
        }
        let exclude = match exclude {
            Some(p) => {
                let m = p.compile()?;
                Some((p, m))
            }
            None => None,
        };
        let chain_id = chain.id(self.mode);
        debug!(
            predicate = %predicate,
            chain = %chain.describe(),
            chain_id = %weave_util::hash::short(&chain_id, 12),
            "registered transform chain"
        );
        self.rules.push(Rule {
            predicate,
            matcher,
            exclude,
            chain,
            chain_id,
        });
        Ok(())
    }

    /// Select the chain for `path`.
    pub fn resolve_chain(&self, path: &Path) -> Result<ChainMatch<'_>, ConfigurationError> {
        let mut best: Option<(&Rule, usize)> = None;
        let mut tied: Option<&Rule> = None;

        for rule in &self.rules {
            if !rule.matcher.matches(path, &self.root) {
                continue;
            }
            if let Some((_, m)) = &rule.exclude {
                if m.matches(path, &self.root) {
                    continue;
                }
            }
            let score = rule.predicate.specificity();
            match best {
                Some((_, s)) if s > score => {}
                Some((_, s)) if s == score => tied = Some(rule),
                _ => {
                    best = Some((rule, score));
                    tied = None;
                }
            }
        }

        match (best, tied) {
            (Some((first, _)), Some(second)) => Err(ConfigurationError::AmbiguousChain {
                path: path.to_path_buf(),
                first: first.predicate.to_string(),
                second: second.predicate.to_string(),
            }),
            (Some((rule, _)), None) => Ok(ChainMatch {
                predicate: &rule.predicate,
                chain: &rule.chain,
                chain_id: &rule.chain_id,
            }),
            (None, _) => Err(ConfigurationError::NoMatchingChain {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Identity fingerprints of every registered chain.
    #[must_use]
    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.iter().map(|r| r.chain_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The built-in chains for `config`.
    ///
    /// | files                          | chain                         |
    /// |--------------------------------|-------------------------------|
    /// | `.js` `.mjs` `.cjs`            | define, minify (production)   |
    /// | the same under `node_modules`  | define, minify (production)   |
    /// | `.json`                        | json                          |
    /// | `.css`                         | css, style                    |
    /// | `.scss` `.sass`                | sass, css, style              |
    /// | images                         | asset, inlined below a limit  |
    /// | fonts and media                | asset, always emitted         |
    pub fn with_defaults(config: &BuildConfig) -> Result<Self, ConfigurationError> {
        let mut registry = Self::new(config.root.clone(), config.mode);

        let mut script = vec![TransformKind::Define {
            replacements: config.define.clone(),
        }];
        if config.minify {
            script.push(TransformKind::Minify);
        }
        registry.register_excluding(
            Predicate::Regex(r"(?i)\.(m|c)?js$".to_string()),
            Predicate::Glob("**/node_modules/**".to_string()),
            Chain::from_kinds(script.clone())?,
        )?;
        registry.register_kinds(
            Predicate::Regex(r"(?i)/node_modules/.+\.(m|c)?js$".to_string()),
            script,
        )?;

        registry.register_kinds(Predicate::Extension("json".to_string()), vec![TransformKind::Json])?;

        let css = TransformKind::Css {
            minify: config.minify,
        };
        let style = TransformKind::Style {
            extract: config.style.extract,
        };
        registry.register_kinds(
            Predicate::Extension("css".to_string()),
            vec![css.clone(), style.clone()],
        )?;
        registry.register_kinds(
            Predicate::Regex(r"(?i)\.s[ac]ss$".to_string()),
            vec![
                TransformKind::Sass {
                    load_paths: Vec::new(),
                },
                css,
                style,
            ],
        )?;

        registry.register_kinds(
            Predicate::Regex(r"(?i)\.(png|jpe?g|gif|webp|svg|ico|avif)$".to_string()),
            vec![TransformKind::Asset {
                inline_limit: Some(config.assets.inline_limit),
                filename: config.assets.image_filename.clone(),
            }],
        )?;
        registry.register_kinds(
            Predicate::Regex(r"(?i)\.(ttf|otf|eot|woff2?|mp3|wav|mp4|webm|avi)$".to_string()),
            vec![TransformKind::Asset {
                inline_limit: None,
                filename: config.assets.media_filename.clone(),
            }],
        )?;

        Ok(registry)
    }
}
