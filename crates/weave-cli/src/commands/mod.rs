pub mod build;
pub mod cache;
pub mod watch;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use weave_core::{
    paths::display_relative, BuildConfig, BuildError, BuildOutcome, CacheStats, ConfigurationError,
    Mode,
};

/// Project selection shared by `build` and `watch`.
#[derive(Debug, Clone)]
pub struct ProjectOptions {
    pub root: PathBuf,
    pub mode: Option<Mode>,
    pub config: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub debounce_ms: Option<u64>,
}

impl ProjectOptions {
    /// Resolve the configuration file and apply the command-line overrides.
    pub fn load_config(&self) -> Result<BuildConfig, ConfigurationError> {
        let mut config = BuildConfig::load(&self.root, self.config.as_deref(), self.mode)?;
        if let Some(dir) = &self.out_dir {
            config = config.with_out_dir(dir);
        }
        if self.no_cache {
            config = config.without_persistent_cache();
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// One error in a JSON result.
#[derive(Debug, Serialize)]
pub struct ErrorJson {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorJson {
    pub fn from_build_error(err: &BuildError, root: &Path) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            path: err.path().map(|p| display_relative(p, root)),
        }
    }

    pub fn from_configuration(err: &ConfigurationError) -> Self {
        Self::from_build_error(&BuildError::Configuration(err.clone()), Path::new(""))
    }
}

/// Result of one build, as printed by `--json`.
#[derive(Debug, Serialize)]
pub struct BuildResultJson {
    pub ok: bool,
    pub generation: u64,
    pub artifacts: Vec<String>,
    pub modules: usize,
    pub dispatched: usize,
    pub computed: usize,
    pub cache: CacheStats,
    pub errors: Vec<ErrorJson>,
    pub duration_ms: u64,
}

impl BuildResultJson {
    /// `written` lists the files on disk; empty for failed builds.
    pub fn new(outcome: &BuildOutcome, written: &[PathBuf], root: &Path) -> Self {
        Self {
            ok: outcome.is_success(),
            generation: outcome.generation,
            artifacts: written.iter().map(|p| display_relative(p, root)).collect(),
            modules: outcome.report.modules,
            dispatched: outcome.report.dispatched,
            computed: outcome.report.computed,
            cache: outcome.report.cache,
            errors: outcome
                .errors
                .iter()
                .map(|e| ErrorJson::from_build_error(e, root))
                .collect(),
            duration_ms: outcome.report.duration.as_millis() as u64,
        }
    }

    /// A result for a build that never started.
    pub fn failed(error: ErrorJson) -> Self {
        Self {
            ok: false,
            generation: 0,
            artifacts: Vec::new(),
            modules: 0,
            dispatched: 0,
            computed: 0,
            cache: CacheStats::default(),
            errors: vec![error],
            duration_ms: 0,
        }
    }
}

/// Print `value` as one line of JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> miette::Result<()> {
    let line = serde_json::to_string(value).map_err(|e| miette::miette!("{e}"))?;
    println!("{line}");
    Ok(())
}

/// Human-readable report of a build.
pub fn print_human(outcome: &BuildOutcome, written: &[PathBuf], root: &Path) {
    if outcome.is_success() {
        for path in written {
            println!("  {}", display_relative(path, root));
        }
        println!(
            "Built {} modules ({} transformed) in {}ms",
            outcome.report.modules,
            outcome.report.computed,
            outcome.report.duration.as_millis()
        );
    } else {
        for err in &outcome.errors {
            eprintln!("error[{}]: {err}", err.code());
        }
        eprintln!("Build failed with {} error(s)", outcome.errors.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.js"), "export default 1;\n").unwrap();
        let options = ProjectOptions {
            root: dir.path().to_path_buf(),
            mode: Some(Mode::Development),
            config: None,
            out_dir: Some(dir.path().join("public")),
            no_cache: true,
            debounce_ms: Some(5),
        };

        let config = options.load_config().unwrap();
        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.out_dir, dir.path().join("public"));
        assert!(!config.cache.persistent);
        assert_eq!(config.debounce, Duration::from_millis(5));
    }

    #[test]
    fn test_error_json_paths_are_relative() {
        let err = BuildError::Configuration(ConfigurationError::EntryNotFound {
            path: PathBuf::from("/app/src/main.js"),
        });
        let json = ErrorJson::from_build_error(&err, Path::new("/app"));
        assert_eq!(json.code, "CONFIG_ENTRY_NOT_FOUND");
        assert_eq!(json.path.as_deref(), Some("src/main.js"));
    }
}
