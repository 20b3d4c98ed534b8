//! CSS processing using lightningcss.
//!
//! Backs the `css` transform step: parses a stylesheet, lowers nesting and
//! adds vendor prefixes for the default browser targets, and optionally
//! minifies. Local `url()` references come out as [`urls::marker`]s.

pub mod sass;
pub mod urls;

use lightningcss::dependencies::{Dependency, DependencyOptions};
use lightningcss::printer::PrinterOptions;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use thiserror::Error;

/// Options for the `css` step.
#[derive(Debug, Clone, Default)]
pub struct CssOptions {
    pub minify: bool,
    /// Source file name, used in error messages only.
    pub filename: Option<String>,
}

/// A stylesheet lightningcss rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CssError {
    #[error("CSS parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("CSS lowering failed in {file}: {message}")]
    Lower { file: String, message: String },

    #[error("CSS print error in {file}: {message}")]
    Print { file: String, message: String },
}

/// Lowering targets shared by every build: Chrome 80, Firefox 75, Safari 13,
/// Edge 80.
const TARGETS: Browsers = Browsers {
    android: None,
    chrome: Some(80 << 16),
    edge: Some(80 << 16),
    firefox: Some(75 << 16),
    ie: None,
    ios_saf: None,
    opera: None,
    safari: Some(13 << 16),
    samsung: None,
};

/// Parse `source`, lower it for [`TARGETS`] and print it back.
///
/// Lowering always runs (nesting, prefixes); `minify` only changes the
/// printer's output. Every `url()` naming a project file is replaced by its
/// marker; other URLs and `@import`s are printed as written.
pub fn process_css(source: &str, options: &CssOptions) -> Result<String, CssError> {
    let file = options
        .filename
        .clone()
        .unwrap_or_else(|| "<stylesheet>".to_string());
    let targets = Targets::from(TARGETS);

    let mut sheet = StyleSheet::parse(source, ParserOptions::default()).map_err(|e| {
        CssError::Parse {
            file: file.clone(),
            message: e.to_string(),
        }
    })?;
    sheet
        .minify(MinifyOptions {
            targets,
            ..MinifyOptions::default()
        })
        .map_err(|e| CssError::Lower {
            file: file.clone(),
            message: e.to_string(),
        })?;

    let printed = sheet
        .to_css(PrinterOptions {
            minify: options.minify,
            targets,
            analyze_dependencies: Some(DependencyOptions {
                remove_imports: false,
            }),
            ..PrinterOptions::default()
        })
        .map_err(|e| CssError::Print {
            file,
            message: e.to_string(),
        })?;

    let mut code = printed.code;
    for dependency in printed.dependencies.unwrap_or_default() {
        let (placeholder, replacement) = match dependency {
            Dependency::Url(dep) if urls::url_specifier(&dep.url).is_some() => {
                let marker = urls::marker(&dep.url);
                (dep.placeholder, marker)
            }
            Dependency::Url(dep) => (dep.placeholder, escape_quoted(&dep.url)),
            Dependency::Import(dep) => (dep.placeholder, escape_quoted(&dep.url)),
        };
        code = code.replace(&placeholder, &replacement);
    }
    Ok(code)
}

/// Escape `url` for the double-quoted string the printer wraps placeholders in.
fn escape_quoted(url: &str) -> String {
    url.replace('\\', "\\\\").replace('"', "\\\"")
}
