//! Transform interface and chains.
//!
//! A transform step turns bytes into bytes and may emit side artifacts.
//! Steps are pure: the output depends only on the input bytes, the file
//! metadata and the step's own configuration, which its
//! [`Transform::identity`] string must cover. Chains are cached by the hash of
//! those identities, so two chains with equal identities are interchangeable.
//!
//! Steps that produce scripts from scripts keep the line structure of their
//! input: bundle source maps point body line `n` at line `n` of the file.

use super::graph::FileKind;
use super::plugin;
use crate::config::Mode;
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weave_util::hash::fingerprint_parts;

/// What a transform knows about the file it processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub kind: FileKind,
    /// Lowercased extension without the dot.
    pub extension: String,
}

impl FileMetadata {
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: FileKind::detect(path),
            extension: super::graph::extension_of(path),
        }
    }
}

/// Build-wide settings visible to every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformContext {
    pub mode: Mode,
}

/// Kind of a side artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideArtifactKind {
    /// A file emitted next to the bundle (images, fonts).
    Asset,
    /// Stylesheet text collected into the extracted style artifact.
    Style,
}

/// Extra output produced by a step alongside its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideArtifact {
    pub name: String,
    pub kind: SideArtifactKind,
    #[serde(with = "super::cache::base64_bytes")]
    pub bytes: Vec<u8>,
}

/// Output of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOutput {
    pub bytes: Vec<u8>,
    pub side_artifacts: Vec<SideArtifact>,
    /// URL other files use to reference this one, set by the `asset` step.
    pub url: Option<String>,
}

impl TransformOutput {
    #[must_use]
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            side_artifacts: Vec::new(),
            url: None,
        }
    }
}

/// Error from a single step. The worker pool adds the node path and step index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub message: String,
}

impl StepError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StepError {}

/// A pure content transform.
pub trait Transform: Send + Sync {
    /// Short name used in errors and logs.
    fn name(&self) -> &str;

    /// Stable description of this step and its configuration.
    fn identity(&self) -> String {
        self.name().to_string()
    }

    /// Transform `input`.
    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError>;
}

/// Tagged configuration for the built-in steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TransformKind {
    /// Replace identifiers (e.g. `process.env.NODE_ENV`) with expressions.
    Define { replacements: BTreeMap<String, String> },
    /// Strip comments and indentation from scripts.
    Minify,
    /// Turn JSON into a module exporting the parsed value.
    Json,
    /// Process CSS with lightningcss.
    Css { minify: bool },
    /// Compile Sass/SCSS with grass.
    #[serde(rename_all = "camelCase")]
    Sass { load_paths: Vec<PathBuf> },
    /// Turn CSS into a module that injects it, or extract it.
    Style { extract: bool },
    /// Emit a file as an asset: inline at or below `inline_limit` bytes,
    /// otherwise write it under `filename`.
    #[serde(rename_all = "camelCase")]
    Asset {
        inline_limit: Option<usize>,
        filename: String,
    },
}

impl TransformKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Define { .. } => "define",
            Self::Minify => "minify",
            Self::Json => "json",
            Self::Css { .. } => "css",
            Self::Sass { .. } => "sass",
            Self::Style { .. } => "style",
            Self::Asset { .. } => "asset",
        }
    }

    /// Check the configuration without building the step.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidTransform {
            step: self.name().to_string(),
            reason,
        };
        match self {
            Self::Define { replacements } => {
                for key in replacements.keys() {
                    let valid = !key.is_empty()
                        && key.split('.').all(|part| {
                            part.bytes().next().is_some_and(super::lexer::is_ident_start)
                                && part.bytes().all(super::lexer::is_ident_char)
                        });
                    if !valid {
                        return Err(invalid(format!("'{key}' is not an identifier path")));
                    }
                }
                Ok(())
            }
            Self::Asset { filename, .. } => super::naming::validate_pattern(filename),
            Self::Sass { load_paths } => match load_paths.iter().find(|p| !p.is_dir()) {
                Some(missing) => Err(invalid(format!(
                    "load path {} is not a directory",
                    missing.display()
                ))),
                None => Ok(()),
            },
            Self::Minify | Self::Json | Self::Css { .. } | Self::Style { .. } => Ok(()),
        }
    }

    /// Validate and build the step.
    pub fn build(self) -> Result<Arc<dyn Transform>, ConfigurationError> {
        self.validate()?;
        Ok(match self {
            Self::Define { replacements } => Arc::new(plugin::DefineTransform::new(replacements)),
            Self::Minify => Arc::new(plugin::MinifyTransform),
            Self::Json => Arc::new(plugin::JsonTransform),
            Self::Css { minify } => Arc::new(plugin::CssTransform::new(minify)),
            Self::Sass { load_paths } => Arc::new(plugin::SassTransform::new(load_paths)),
            Self::Style { extract } => Arc::new(plugin::StyleTransform::new(extract)),
            Self::Asset {
                inline_limit,
                filename,
            } => Arc::new(plugin::AssetTransform::new(inline_limit, filename)),
        })
    }
}

/// An ordered sequence of steps.
#[derive(Clone)]
pub struct Chain {
    steps: Vec<Arc<dyn Transform>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.identity()))
            .finish()
    }
}

impl Chain {
    #[must_use]
    pub fn new(steps: Vec<Arc<dyn Transform>>) -> Self {
        Self { steps }
    }

    /// Build a chain from tagged configurations, validating each eagerly.
    pub fn from_kinds(kinds: Vec<TransformKind>) -> Result<Self, ConfigurationError> {
        let steps = kinds
            .into_iter()
            .map(TransformKind::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(steps))
    }

    #[must_use]
    pub fn steps(&self) -> &[Arc<dyn Transform>] {
        &self.steps
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Identity fingerprint of this chain under `mode`: the cache key half
    /// that changes whenever a step or its configuration does.
    #[must_use]
    pub fn id(&self, mode: Mode) -> String {
        let identities: Vec<String> = self.steps.iter().map(|s| s.identity()).collect();
        fingerprint_parts(
            std::iter::once(mode.as_str().to_string())
                .chain(identities)
                .collect::<Vec<_>>(),
        )
    }

    /// Human-readable step list, e.g. `sass → css → style`.
    #[must_use]
    pub fn describe(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_tracks_configuration() {
        let a = Chain::from_kinds(vec![TransformKind::Css { minify: false }]).unwrap();
        let b = Chain::from_kinds(vec![TransformKind::Css { minify: false }]).unwrap();
        let c = Chain::from_kinds(vec![TransformKind::Css { minify: true }]).unwrap();

        assert_eq!(a.id(Mode::Development), b.id(Mode::Development));
        assert_ne!(a.id(Mode::Development), c.id(Mode::Development));
        assert_ne!(a.id(Mode::Development), a.id(Mode::Production));
    }

    #[test]
    fn test_validate_rejects_bad_define_key() {
        let mut replacements = BTreeMap::new();
        replacements.insert("process env".to_string(), "1".to_string());
        let err = TransformKind::Define { replacements }.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidTransform { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_asset_pattern() {
        let kind = TransformKind::Asset {
            inline_limit: None,
            filename: "media/[hsah][ext]".to_string(),
        };
        assert!(kind.validate().is_err());
    }

    #[test]
    fn test_kind_deserializes_from_tagged_json() {
        let kind: TransformKind =
            serde_json::from_str(r#"{"kind": "asset", "inlineLimit": 10240, "filename": "images/[hash:8][ext]"}"#)
                .unwrap();
        assert_eq!(
            kind,
            TransformKind::Asset {
                inline_limit: Some(10240),
                filename: "images/[hash:8][ext]".to_string()
            }
        );
    }

    #[test]
    fn test_describe() {
        let chain = Chain::from_kinds(vec![
            TransformKind::Sass {
                load_paths: Vec::new(),
            },
            TransformKind::Css { minify: false },
            TransformKind::Style { extract: false },
        ])
        .unwrap();
        assert_eq!(chain.describe(), "sass → css → style");
    }
}
