//! Sass/SCSS preprocessing using grass.
//!
//! Backs the `sass` transform step. Output is expanded CSS; the `css` step
//! that follows does lowering and minification.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// How one stylesheet is compiled.
#[derive(Debug, Clone, Default)]
pub struct SassOptions {
    /// Directories searched by `@use` / `@import`, in order.
    pub load_paths: Vec<PathBuf>,
    /// Indented (`.sass`) syntax instead of SCSS.
    pub indented: bool,
}

impl SassOptions {
    /// Options for compiling `path`: the configured load paths, then the
    /// file's own directory. The syntax follows the extension.
    #[must_use]
    pub fn for_file(path: &Path, load_paths: &[PathBuf]) -> Self {
        let mut load_paths = load_paths.to_vec();
        load_paths.extend(path.parent().map(Path::to_path_buf));
        let indented = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sass"));
        Self {
            load_paths,
            indented,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Sass compile error: {0}")]
pub struct SassError(String);

/// Compile Sass/SCSS to CSS.
pub fn compile_sass(source: &str, options: &SassOptions) -> Result<String, SassError> {
    let syntax = if options.indented {
        grass::InputSyntax::Sass
    } else {
        grass::InputSyntax::Scss
    };
    let grass_options = options.load_paths.iter().fold(
        grass::Options::default()
            .style(grass::OutputStyle::Expanded)
            .input_syntax(syntax),
        |opts, path| opts.load_path(path),
    );

    grass::from_string(source.to_owned(), &grass_options).map_err(|e| SassError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scss_nesting_and_variables() {
        let scss = "$primary: #333;\n.parent { .child { color: $primary; } }";
        let css = compile_sass(scss, &SassOptions::default()).unwrap();
        assert!(css.contains(".parent .child"));
        assert!(css.contains("#333"));
    }

    #[test]
    fn test_for_file_picks_syntax_and_directory() {
        let options = SassOptions::for_file(
            Path::new("/app/styles/main.sass"),
            &[PathBuf::from("/app/vendor")],
        );
        assert!(options.indented);
        assert_eq!(
            options.load_paths,
            vec![PathBuf::from("/app/vendor"), PathBuf::from("/app/styles")]
        );
        assert!(!SassOptions::for_file(Path::new("/app/a.scss"), &[]).indented);
    }

    #[test]
    fn test_indented_syntax() {
        let sass = "$c: blue\n.box\n  color: $c\n";
        let options = SassOptions {
            indented: true,
            ..Default::default()
        };
        let css = compile_sass(sass, &options).unwrap();
        assert!(css.contains(".box"));
        assert!(css.contains("blue"));
    }

    #[test]
    fn test_partial_from_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("_colors.scss"), "$accent: #0af;\n").unwrap();
        let main = dir.path().join("main.scss");
        let css = compile_sass(
            "@use 'colors';\na { color: colors.$accent; }",
            &SassOptions::for_file(&main, &[]),
        )
        .unwrap();
        assert!(css.contains("#0af"));
    }

    #[test]
    fn test_compile_error() {
        let err = compile_sass(".a { color: $undefined; }", &SassOptions::default()).unwrap_err();
        assert!(err.to_string().starts_with("Sass compile error"));
    }
}
