//! Build configuration.
//!
//! A project may carry a `weave.config.json` next to its sources. Every field
//! is optional; [`BuildConfig::from_file`] fills the gaps from mode defaults and
//! validates the result eagerly so that bad values surface before any
//! transform runs.

use crate::error::ConfigurationError;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Name of the project configuration file.
pub const CONFIG_FILE_NAME: &str = "weave.config.json";

/// Environment variable selecting the build mode.
pub const MODE_ENV: &str = "WEAVE_MODE";

/// Default coalescing window for file-system events.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Images at or below this size are inlined as data URIs.
pub const DEFAULT_INLINE_LIMIT: usize = 10 * 1024;

/// Upper bound on worker threads.
pub const MAX_PARALLELISM: usize = 64;

/// Build mode: selects cache aggressiveness, minification and source maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    /// Mode selected by the environment: `WEAVE_MODE`, then `NODE_ENV=production`.
    ///
    /// An unparseable `WEAVE_MODE` is an error rather than a silent fallback.
    pub fn from_env() -> Result<Option<Self>, ConfigurationError> {
        if let Ok(value) = std::env::var(MODE_ENV) {
            return value.parse().map(Some);
        }
        match std::env::var("NODE_ENV") {
            Ok(value) if value == "production" => Ok(Some(Self::Production)),
            _ => Ok(None),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigurationError::invalid(format!(
                "unknown mode '{other}' (expected development or production)"
            ))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source map flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMapMode {
    Off,
    /// Line mappings only (cheap, development).
    #[default]
    Lines,
    /// Line and column mappings (production).
    Full,
}

/// On-disk shape of `weave.config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    pub entries: Option<BTreeMap<String, String>>,
    pub out_dir: Option<PathBuf>,
    pub mode: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub index_files: Option<Vec<String>>,
    pub externals: Option<Vec<String>>,
    pub parallelism: Option<usize>,
    pub debounce_ms: Option<u64>,
    pub cache: Option<CacheSection>,
    pub style: Option<StyleSection>,
    pub assets: Option<AssetSection>,
    pub source_maps: Option<bool>,
    pub minify: Option<bool>,
    pub define: Option<BTreeMap<String, String>>,
    pub html: Option<HtmlSection>,
    pub clean: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSection {
    pub dir: Option<PathBuf>,
    pub persistent: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StyleSection {
    pub extract: Option<bool>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AssetSection {
    pub inline_limit: Option<usize>,
    pub image_filename: Option<String>,
    pub media_filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HtmlSection {
    pub template: PathBuf,
    pub filename: Option<String>,
}

impl ConfigFile {
    /// Parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigurationError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load `weave.config.json` from `root` if present.
    pub fn discover(root: &Path) -> Result<Option<Self>, ConfigurationError> {
        let path = root.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load(&path).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// One entry module and the pattern its bundle is named with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryConfig {
    /// Entry name, used for `[name]` (the file stem).
    pub name: String,
    /// Absolute path to the entry module.
    pub path: PathBuf,
    /// Output name pattern, e.g. `js/[name].js`.
    pub output: String,
}

impl EntryConfig {
    #[must_use]
    pub fn new(path: PathBuf, output: impl Into<String>) -> Self {
        let name = path
            .file_stem()
            .map_or_else(|| "main".to_string(), |s| s.to_string_lossy().into_owned());
        Self {
            name,
            path,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Persisted cache directory; `None` uses the per-project default.
    pub dir: Option<PathBuf>,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleConfig {
    /// Extract styles into a separate artifact instead of injecting them.
    pub extract: bool,
    /// Name pattern of the extracted style artifact.
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetConfig {
    pub inline_limit: usize,
    pub image_filename: String,
    pub media_filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlConfig {
    pub template: PathBuf,
    pub filename: String,
}

/// Fully resolved build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub root: PathBuf,
    pub mode: Mode,
    pub entries: Vec<EntryConfig>,
    pub out_dir: PathBuf,
    pub extensions: Vec<String>,
    pub index_files: Vec<String>,
    pub externals: Vec<String>,
    pub parallelism: usize,
    pub debounce: Duration,
    pub cache: CacheConfig,
    pub style: StyleConfig,
    pub assets: AssetConfig,
    pub source_maps: SourceMapMode,
    pub minify: bool,
    pub define: BTreeMap<String, String>,
    pub html: Option<HtmlConfig>,
    pub clean: bool,
}

/// Available hardware concurrency, clamped to `1..=64`.
#[must_use]
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .clamp(1, MAX_PARALLELISM)
}

impl BuildConfig {
    /// Defaults for `mode`, with `./main.js` as the entry.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, mode: Mode) -> Self {
        let root = root.into();
        let production = mode == Mode::Production;
        Self {
            entries: vec![EntryConfig::new(root.join("main.js"), "js/[name].js")],
            out_dir: root.join("dist"),
            mode,
            extensions: [".js", ".mjs", ".cjs", ".json"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            index_files: vec!["index.js".to_string(), "index.json".to_string()],
            externals: Vec::new(),
            parallelism: default_parallelism(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            cache: CacheConfig {
                dir: None,
                persistent: !production,
            },
            style: StyleConfig {
                extract: production,
                filename: "css/[name].css".to_string(),
            },
            assets: AssetConfig {
                inline_limit: DEFAULT_INLINE_LIMIT,
                image_filename: "images/[hash:8][ext]".to_string(),
                media_filename: "media/[hash:8][ext]".to_string(),
            },
            source_maps: if production {
                SourceMapMode::Full
            } else {
                SourceMapMode::Lines
            },
            minify: production,
            define: default_define(mode),
            html: None,
            clean: true,
            root,
        }
    }

    /// Resolve a parsed configuration file against `root`.
    ///
    /// `mode_override` (the CLI flag) beats the environment, which beats the
    /// file's own `mode`.
    pub fn from_file(
        root: &Path,
        file: ConfigFile,
        mode_override: Option<Mode>,
    ) -> Result<Self, ConfigurationError> {
        let file_mode = file.mode.as_deref().map(str::parse).transpose()?;
        let mode = match mode_override {
            Some(mode) => mode,
            None => Mode::from_env()?.or(file_mode).unwrap_or_default(),
        };

        let mut config = Self::new(root, mode);

        if let Some(entries) = file.entries {
            config.entries = entries
                .into_iter()
                .map(|(path, output)| EntryConfig::new(root.join(path), output))
                .collect();
        }
        if let Some(out_dir) = file.out_dir {
            config.out_dir = root.join(out_dir);
        }
        if let Some(extensions) = file.extensions {
            config.extensions = extensions
                .into_iter()
                .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
                .collect();
        }
        if let Some(index_files) = file.index_files {
            config.index_files = index_files;
        }
        if let Some(externals) = file.externals {
            config.externals = externals;
        }
        if let Some(parallelism) = file.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(ms) = file.debounce_ms {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(cache) = file.cache {
            config.cache.dir = cache.dir.map(|d| root.join(d));
            if let Some(persistent) = cache.persistent {
                config.cache.persistent = persistent;
            }
        }
        if let Some(style) = file.style {
            if let Some(extract) = style.extract {
                config.style.extract = extract;
            }
            if let Some(filename) = style.filename {
                config.style.filename = filename;
            }
        }
        if let Some(assets) = file.assets {
            if let Some(limit) = assets.inline_limit {
                config.assets.inline_limit = limit;
            }
            if let Some(name) = assets.image_filename {
                config.assets.image_filename = name;
            }
            if let Some(name) = assets.media_filename {
                config.assets.media_filename = name;
            }
        }
        match file.source_maps {
            Some(false) => config.source_maps = SourceMapMode::Off,
            Some(true) | None => {}
        }
        if let Some(minify) = file.minify {
            config.minify = minify;
        }
        if let Some(define) = file.define {
            config.define.extend(define);
        }
        if let Some(html) = file.html {
            config.html = Some(HtmlConfig {
                template: root.join(html.template),
                filename: html.filename.unwrap_or_else(|| "index.html".to_string()),
            });
        }
        if let Some(clean) = file.clean {
            config.clean = clean;
        }

        Ok(config)
    }

    /// Load configuration for `root`: an explicit file, else a discovered
    /// `weave.config.json`, else defaults.
    pub fn load(
        root: &Path,
        config_path: Option<&Path>,
        mode_override: Option<Mode>,
    ) -> Result<Self, ConfigurationError> {
        let file = match config_path {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::discover(root)?.unwrap_or_default(),
        };
        Self::from_file(root, file, mode_override)
    }

    /// Replace the entries with a single entry.
    #[must_use]
    pub fn with_entry(mut self, path: impl Into<PathBuf>, output: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        };
        self.entries = vec![EntryConfig::new(path, output)];
        self
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = Some(dir.into());
        self.cache.persistent = true;
        self
    }

    #[must_use]
    pub fn without_persistent_cache(mut self) -> Self {
        self.cache.persistent = false;
        self
    }

    #[must_use]
    pub fn with_out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.out_dir = if dir.is_absolute() {
            dir
        } else {
            self.root.join(dir)
        };
        self
    }

    /// Directory of the persisted cache tier, when it is enabled.
    #[must_use]
    pub fn persistent_cache_dir(&self) -> Option<PathBuf> {
        if !self.cache.persistent {
            return None;
        }
        Some(
            self.cache
                .dir
                .clone()
                .unwrap_or_else(|| paths::project_cache_dir(&self.root)),
        )
    }

    /// Check every value that would otherwise fail mid-build.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.entries.is_empty() {
            return Err(ConfigurationError::invalid("at least one entry is required"));
        }
        let mut names = std::collections::BTreeSet::new();
        for entry in &self.entries {
            if !entry.path.is_file() {
                return Err(ConfigurationError::EntryNotFound {
                    path: entry.path.clone(),
                });
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigurationError::invalid(format!(
                    "two entries share the name '{}'",
                    entry.name
                )));
            }
            crate::bundler::naming::validate_pattern(&entry.output)?;
        }
        crate::bundler::naming::validate_pattern(&self.style.filename)?;
        crate::bundler::naming::validate_pattern(&self.assets.image_filename)?;
        crate::bundler::naming::validate_pattern(&self.assets.media_filename)?;

        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(ConfigurationError::invalid(format!(
                "parallelism must be between 1 and {MAX_PARALLELISM}, got {}",
                self.parallelism
            )));
        }
        for ext in &self.extensions {
            if ext.len() < 2 || !ext.starts_with('.') {
                return Err(ConfigurationError::invalid(format!(
                    "invalid extension '{ext}'"
                )));
            }
        }
        if let Some(html) = &self.html {
            if !html.template.is_file() {
                return Err(ConfigurationError::invalid(format!(
                    "html template {} does not exist",
                    html.template.display()
                )));
            }
        }
        Ok(())
    }
}

/// `process.env.NODE_ENV` is replaced in scripts, as bundlers customarily do.
fn default_define(mode: Mode) -> BTreeMap<String, String> {
    let mut define = BTreeMap::new();
    define.insert(
        "process.env.NODE_ENV".to_string(),
        format!("\"{}\"", mode.as_str()),
    );
    define
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_mode_env() {
        std::env::remove_var(MODE_ENV);
        std::env::remove_var("NODE_ENV");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("production".parse::<Mode>().unwrap(), Mode::Production);
        assert_eq!("Dev".parse::<Mode>().unwrap(), Mode::Development);
        assert!("staging".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_defaults() {
        let dev = BuildConfig::new("/app", Mode::Development);
        assert!(dev.cache.persistent);
        assert!(!dev.minify);
        assert!(!dev.style.extract);
        assert_eq!(dev.source_maps, SourceMapMode::Lines);

        let prod = BuildConfig::new("/app", Mode::Production);
        assert!(!prod.cache.persistent);
        assert!(prod.minify);
        assert!(prod.style.extract);
        assert_eq!(prod.source_maps, SourceMapMode::Full);
        assert_eq!(prod.define["process.env.NODE_ENV"], "\"production\"");
    }

    #[test]
    #[serial]
    fn test_mode_precedence() {
        clear_mode_env();
        let file = ConfigFile {
            mode: Some("production".to_string()),
            ..Default::default()
        };

        let config = BuildConfig::from_file(Path::new("/app"), file.clone(), None).unwrap();
        assert_eq!(config.mode, Mode::Production);

        std::env::set_var(MODE_ENV, "development");
        let config = BuildConfig::from_file(Path::new("/app"), file.clone(), None).unwrap();
        assert_eq!(config.mode, Mode::Development);

        let config =
            BuildConfig::from_file(Path::new("/app"), file, Some(Mode::Production)).unwrap();
        assert_eq!(config.mode, Mode::Production);
        clear_mode_env();

        std::env::set_var("NODE_ENV", "production");
        let config =
            BuildConfig::from_file(Path::new("/app"), ConfigFile::default(), None).unwrap();
        assert_eq!(config.mode, Mode::Production);
        clear_mode_env();
    }

    #[test]
    #[serial]
    fn test_config_file_fields() {
        clear_mode_env();
        let json = r#"{
            "entries": { "./src/index.js": "bundle.[contenthash:8].js" },
            "outDir": "build",
            "extensions": ["js", ".ts"],
            "parallelism": 3,
            "debounceMs": 10,
            "cache": { "persistent": false },
            "style": { "extract": true },
            "assets": { "inlineLimit": 0 },
            "sourceMaps": false,
            "externals": ["react"]
        }"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        let config = BuildConfig::from_file(Path::new("/app"), file, None).unwrap();

        assert_eq!(config.entries.len(), 1);
        assert_eq!(config.entries[0].name, "index");
        assert_eq!(config.entries[0].path, Path::new("/app/./src/index.js"));
        assert_eq!(config.out_dir, Path::new("/app/build"));
        assert_eq!(config.extensions, vec![".js", ".ts"]);
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.debounce, Duration::from_millis(10));
        assert!(!config.cache.persistent);
        assert!(config.persistent_cache_dir().is_none());
        assert!(config.style.extract);
        assert_eq!(config.assets.inline_limit, 0);
        assert_eq!(config.source_maps, SourceMapMode::Off);
        assert_eq!(config.externals, vec!["react"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<ConfigFile, _> = serde_json::from_str(r#"{"entry": "x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(dir.path(), Mode::Development);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::EntryNotFound { .. })
        ));

        std::fs::write(dir.path().join("main.js"), "").unwrap();
        let config = BuildConfig::new(dir.path(), Mode::Development);
        config.validate().unwrap();

        let zero = config.clone().with_parallelism(0);
        assert!(zero.validate().is_err());

        let mut bad_pattern = config;
        bad_pattern.style.filename = "css/[nmae].css".to_string();
        assert!(bad_pattern.validate().is_err());
    }
}
