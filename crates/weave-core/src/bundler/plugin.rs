//! Built-in transform steps.
//!
//! | step     | input            | output                                        |
//! |----------|------------------|-----------------------------------------------|
//! | `define` | script           | script with identifiers replaced              |
//! | `minify` | script           | script without comments, line breaks kept     |
//! | `json`   | JSON             | `module.exports = <value>;`                   |
//! | `sass`   | Sass/SCSS        | CSS (grass)                                   |
//! | `css`    | CSS              | CSS (lightningcss)                            |
//! | `style`  | CSS              | injecting module, or an extracted style       |
//! | `asset`  | any bytes        | URL module, plus the file as a side artifact  |

use super::lexer::{replace_identifiers, segments, SegmentKind};
use super::naming::{render_name, NameParts};
use super::transform::{
    FileMetadata, SideArtifact, SideArtifactKind, StepError, Transform, TransformContext,
    TransformOutput,
};
use crate::css::sass::{compile_sass, SassOptions};
use crate::css::{process_css, CssOptions};
use base64::Engine as _;
use std::collections::BTreeMap;
use std::path::PathBuf;
use weave_util::hash::{fingerprint_bytes, short};

fn utf8<'a>(input: &'a [u8], meta: &FileMetadata) -> Result<&'a str, StepError> {
    std::str::from_utf8(input)
        .map_err(|e| StepError::new(format!("{} is not valid UTF-8: {e}", meta.path.display())))
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

// ============================================================================
// define
// ============================================================================

/// Replaces global identifiers with expressions, e.g. `process.env.NODE_ENV`
/// with `"production"`.
pub struct DefineTransform {
    replacements: Vec<(String, String)>,
}

impl DefineTransform {
    #[must_use]
    pub fn new(replacements: BTreeMap<String, String>) -> Self {
        Self {
            replacements: replacements.into_iter().collect(),
        }
    }
}

impl Transform for DefineTransform {
    fn name(&self) -> &str {
        "define"
    }

    fn identity(&self) -> String {
        let pairs: Vec<String> = self
            .replacements
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("define:{}", pairs.join(";"))
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        let source = utf8(input, meta)?;
        Ok(TransformOutput::bytes(replace_identifiers(
            source,
            &self.replacements,
        )))
    }
}

// ============================================================================
// minify
// ============================================================================

/// Strips comments, indentation and runs of spaces from scripts.
///
/// Every line break of the source is kept, so line `n` of the output holds
/// what was left of line `n` of the input. Source maps rely on this, and
/// automatic semicolon insertion behaves exactly as in the source.
pub struct MinifyTransform;

/// Minify script source (see [`MinifyTransform`]).
#[must_use]
pub fn minify_js(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for seg in segments(source) {
        let text = &source[seg.range.clone()];
        match seg.kind {
            SegmentKind::LineComment => {}
            SegmentKind::BlockComment => match text.matches('\n').count() {
                0 => push_space(&mut out),
                n => push_newlines(&mut out, n),
            },
            SegmentKind::Code => {
                let mut chars = text.chars().peekable();
                while let Some(c) = chars.next() {
                    if c.is_whitespace() {
                        let mut lines = usize::from(c == '\n');
                        while let Some(&n) = chars.peek() {
                            if !n.is_whitespace() {
                                break;
                            }
                            lines += usize::from(n == '\n');
                            chars.next();
                        }
                        if lines > 0 {
                            push_newlines(&mut out, lines);
                        } else {
                            push_space(&mut out);
                        }
                    } else {
                        out.push(c);
                    }
                }
            }
            SegmentKind::Str | SegmentKind::Template | SegmentKind::Regex => out.push_str(text),
        }
    }
    while out.ends_with([' ', '\n']) {
        out.pop();
    }
    out.push('\n');
    out
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with([' ', '\n']) {
        out.push(' ');
    }
}

fn push_newlines(out: &mut String, count: usize) {
    while out.ends_with(' ') {
        out.pop();
    }
    out.extend(std::iter::repeat('\n').take(count));
}

impl Transform for MinifyTransform {
    fn name(&self) -> &str {
        "minify"
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        Ok(TransformOutput::bytes(minify_js(utf8(input, meta)?)))
    }
}

// ============================================================================
// json
// ============================================================================

/// Turns a JSON document into a module exporting its value.
pub struct JsonTransform;

impl Transform for JsonTransform {
    fn name(&self) -> &str {
        "json"
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        let value: serde_json::Value = serde_json::from_slice(input)
            .map_err(|e| StepError::new(format!("invalid JSON in {}: {e}", meta.path.display())))?;
        Ok(TransformOutput::bytes(format!("module.exports = {value};\n")))
    }
}

// ============================================================================
// css / sass
// ============================================================================

/// Processes CSS with lightningcss.
pub struct CssTransform {
    minify: bool,
}

impl CssTransform {
    #[must_use]
    pub fn new(minify: bool) -> Self {
        Self { minify }
    }
}

impl Transform for CssTransform {
    fn name(&self) -> &str {
        "css"
    }

    fn identity(&self) -> String {
        format!("css:minify={}", self.minify)
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        let options = CssOptions {
            minify: self.minify,
            filename: Some(meta.path.display().to_string()),
        };
        process_css(utf8(input, meta)?, &options)
            .map(TransformOutput::bytes)
            .map_err(|e| StepError::new(e.to_string()))
    }
}

/// Compiles Sass/SCSS to CSS with grass.
///
/// The file's own directory is always a load path, so relative partials work.
pub struct SassTransform {
    load_paths: Vec<PathBuf>,
}

impl SassTransform {
    #[must_use]
    pub fn new(load_paths: Vec<PathBuf>) -> Self {
        Self { load_paths }
    }
}

impl Transform for SassTransform {
    fn name(&self) -> &str {
        "sass"
    }

    fn identity(&self) -> String {
        let paths: Vec<String> = self
            .load_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!("sass:{}", paths.join(";"))
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        let options = SassOptions::for_file(&meta.path, &self.load_paths);
        compile_sass(utf8(input, meta)?, &options)
            .map(TransformOutput::bytes)
            .map_err(|e| StepError::new(e.to_string()))
    }
}

// ============================================================================
// style
// ============================================================================

/// Turns CSS into a module.
///
/// Injecting: the module appends a `<style>` element when a document exists.
/// Extracting: the module is empty and the CSS becomes a style side artifact.
pub struct StyleTransform {
    extract: bool,
}

impl StyleTransform {
    #[must_use]
    pub fn new(extract: bool) -> Self {
        Self { extract }
    }
}

impl Transform for StyleTransform {
    fn name(&self) -> &str {
        "style"
    }

    fn identity(&self) -> String {
        format!("style:extract={}", self.extract)
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        let css = utf8(input, meta)?;
        if self.extract {
            let name = format!("{}.css", short(&fingerprint_bytes(input), 8));
            return Ok(TransformOutput {
                bytes: b"module.exports = {};\n".to_vec(),
                side_artifacts: vec![SideArtifact {
                    name,
                    kind: SideArtifactKind::Style,
                    bytes: input.to_vec(),
                }],
                url: None,
            });
        }
        let code = format!(
            "var css = {};\n\
             if (typeof document !== \"undefined\") {{\n\
             \x20 var style = document.createElement(\"style\");\n\
             \x20 style.textContent = css;\n\
             \x20 document.head.appendChild(style);\n\
             }}\n\
             module.exports = css;\n",
            js_string(css)
        );
        Ok(TransformOutput::bytes(code))
    }
}

// ============================================================================
// asset
// ============================================================================

/// Emits a file as an asset.
///
/// Files at or below the inline limit become `data:` URIs; larger ones (or all
/// of them, without a limit) are emitted under the name pattern and the module
/// exports their relative URL.
pub struct AssetTransform {
    inline_limit: Option<usize>,
    filename: String,
}

impl AssetTransform {
    #[must_use]
    pub fn new(inline_limit: Option<usize>, filename: String) -> Self {
        Self {
            inline_limit,
            filename,
        }
    }
}

fn mime_type(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "avif" => "image/avif",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

impl Transform for AssetTransform {
    fn name(&self) -> &str {
        "asset"
    }

    fn identity(&self) -> String {
        match self.inline_limit {
            Some(limit) => format!("asset:inline<={limit}:{}", self.filename),
            None => format!("asset:{}", self.filename),
        }
    }

    fn transform(
        &self,
        input: &[u8],
        meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        if self.inline_limit.is_some_and(|limit| input.len() <= limit) {
            let encoded = base64::engine::general_purpose::STANDARD.encode(input);
            let uri = format!("data:{};base64,{encoded}", mime_type(&meta.extension));
            return Ok(TransformOutput {
                bytes: format!("module.exports = {};\n", js_string(&uri)).into_bytes(),
                side_artifacts: Vec::new(),
                url: Some(uri),
            });
        }

        let stem = meta
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = if meta.extension.is_empty() {
            String::new()
        } else {
            format!(".{}", meta.extension)
        };
        let name = render_name(
            &self.filename,
            &NameParts {
                name: &stem,
                ext: &ext,
                content: input,
            },
        )
        .map_err(|e| StepError::new(e.to_string()))?;

        Ok(TransformOutput {
            bytes: format!("module.exports = {};\n", js_string(&name)).into_bytes(),
            side_artifacts: vec![SideArtifact {
                name: name.clone(),
                kind: SideArtifactKind::Asset,
                bytes: input.to_vec(),
            }],
            url: Some(name),
        })
    }
}
