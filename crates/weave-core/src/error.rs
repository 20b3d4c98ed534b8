use crate::codes;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// An import specifier that could not be turned into a file path.
///
/// Fatal to the importing subtree only; sibling imports keep resolving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot resolve '{specifier}' from {}: {reason}", importer.display())]
pub struct ResolutionError {
    pub importer: PathBuf,
    pub specifier: String,
    pub reason: String,
}

/// A transform step failed for one module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transform step {step_index} ({step}) failed for {}: {message}", path.display())]
pub struct TransformError {
    pub path: PathBuf,
    pub step_index: usize,
    pub step: String,
    pub message: String,
}

/// Invalid registry or build configuration. Raised before any transform runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no transform chain matches {}", path.display())]
    NoMatchingChain { path: PathBuf },

    #[error("ambiguous transform chains for {}: {first} and {second} are equally specific", path.display())]
    AmbiguousChain {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("predicate {predicate} is already registered")]
    DuplicatePredicate { predicate: String },

    #[error("predicates {first} and {second} match the same files with equal specificity")]
    OverlappingPredicates { first: String, second: String },

    #[error("invalid predicate {predicate}: {reason}")]
    InvalidPredicate { predicate: String, reason: String },

    #[error("invalid {step} transform configuration: {reason}")]
    InvalidTransform { step: String, reason: String },

    #[error("entry {} does not exist", path.display())]
    EntryNotFound { path: PathBuf },

    #[error("failed to read config at {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Stable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoMatchingChain { .. } => codes::CONFIG_NO_CHAIN,
            Self::AmbiguousChain { .. } => codes::CONFIG_AMBIGUOUS_CHAIN,
            Self::DuplicatePredicate { .. } => codes::CONFIG_DUPLICATE_PREDICATE,
            Self::OverlappingPredicates { .. } => codes::CONFIG_OVERLAPPING_PREDICATES,
            Self::InvalidPredicate { .. } => codes::CONFIG_INVALID_PREDICATE,
            Self::InvalidTransform { .. } => codes::CONFIG_INVALID_TRANSFORM,
            Self::EntryNotFound { .. } => codes::CONFIG_ENTRY_NOT_FOUND,
            Self::Read { .. } => codes::CONFIG_READ_FAILED,
            Self::Invalid(_) => codes::CONFIG_INVALID,
        }
    }
}

/// The persisted cache tier could not be read or written.
///
/// Never fatal: the cache degrades to recomputing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cache I/O error at {}: {message}", path.display())]
pub struct CacheIoError {
    pub path: PathBuf,
    pub message: String,
}

impl CacheIoError {
    pub(crate) fn new(path: &Path, err: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        codes::CACHE_IO_ERROR
    }
}

/// Any error a build can report.
///
/// Node-level errors are collected so one build reports every independent
/// failure; the variants carry owned data so they can be shared between
/// threads waiting on the same computation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    CacheIo(#[from] CacheIoError),

    #[error("failed to read {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("failed to write {}: {message}", path.display())]
    Write { path: PathBuf, message: String },
}

impl BuildError {
    pub(crate) fn read(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub(crate) fn write(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// Stable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolution(_) => codes::RESOLVE_FAILED,
            Self::Transform(_) => codes::TRANSFORM_FAILED,
            Self::Configuration(e) => e.code(),
            Self::CacheIo(_) => codes::CACHE_IO_ERROR,
            Self::Read { .. } => codes::READ_FAILED,
            Self::Write { .. } => codes::WRITE_FAILED,
        }
    }

    /// The file this error is about, when there is one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Resolution(e) => Some(&e.importer),
            Self::Transform(e) => Some(&e.path),
            Self::Configuration(
                ConfigurationError::NoMatchingChain { path }
                | ConfigurationError::AmbiguousChain { path, .. }
                | ConfigurationError::EntryNotFound { path }
                | ConfigurationError::Read { path, .. },
            )
            | Self::CacheIo(CacheIoError { path, .. })
            | Self::Read { path, .. }
            | Self::Write { path, .. } => Some(path),
            Self::Configuration(_) => None,
        }
    }

    /// Whether this error aborts a build before any transform runs.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
