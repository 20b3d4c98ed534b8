//! Source Map v3 generation.

use serde::Serialize;

/// VLQ-encode a signed integer and append it to `out`.
pub(crate) fn vlq_encode(value: i64, out: &mut String) {
    const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20; // continuation bit
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Mapping {
    output_line: u32,
    output_col: u32,
    source: u32,
    source_line: u32,
    source_col: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceMapJson<'a> {
    version: u8,
    file: &'a str,
    source_root: &'a str,
    sources: &'a [String],
    sources_content: &'a [String],
    names: [&'a str; 0],
    mappings: String,
}

/// Collects mappings while a bundle is assembled.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    sources_content: Vec<String>,
    mappings: Vec<Mapping>,
}

impl SourceMapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source file and return its index.
    pub fn add_source(&mut self, name: &str, content: &str) -> u32 {
        let idx = self.sources.len() as u32;
        self.sources.push(name.to_string());
        self.sources_content.push(content.to_string());
        idx
    }

    /// Map an output position to a source position (all zero-based).
    pub fn add_mapping(
        &mut self,
        output_line: u32,
        output_col: u32,
        source: u32,
        source_line: u32,
        source_col: u32,
    ) {
        self.mappings.push(Mapping {
            output_line,
            output_col,
            source,
            source_line,
            source_col,
        });
    }

    /// Map the start of an output line to the start of a source line.
    pub fn add_line_mapping(&mut self, output_line: u32, source: u32, source_line: u32) {
        self.add_mapping(output_line, 0, source, source_line, 0);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Source index, line and column of the last mapping at or before
    /// `output_col` on `output_line`.
    #[must_use]
    pub fn original_position(&self, output_line: u32, output_col: u32) -> Option<(u32, u32, u32)> {
        self.mappings
            .iter()
            .filter(|m| m.output_line == output_line && m.output_col <= output_col)
            .max_by_key(|m| m.output_col)
            .map(|m| (m.source, m.source_line, m.source_col))
    }

    /// The `mappings` field.
    #[must_use]
    pub fn encode_mappings(&self) -> String {
        let mut sorted = self.mappings.clone();
        sorted.sort();
        sorted.dedup_by_key(|m| (m.output_line, m.output_col));

        let mut out = String::new();
        let mut line = 0u32;
        let mut prev_col = 0i64;
        let mut prev_source = 0i64;
        let mut prev_source_line = 0i64;
        let mut prev_source_col = 0i64;
        let mut first_on_line = true;

        for m in &sorted {
            while line < m.output_line {
                out.push(';');
                line += 1;
                prev_col = 0;
                first_on_line = true;
            }
            if !first_on_line {
                out.push(',');
            }
            first_on_line = false;

            vlq_encode(i64::from(m.output_col) - prev_col, &mut out);
            vlq_encode(i64::from(m.source) - prev_source, &mut out);
            vlq_encode(i64::from(m.source_line) - prev_source_line, &mut out);
            vlq_encode(i64::from(m.source_col) - prev_source_col, &mut out);

            prev_col = i64::from(m.output_col);
            prev_source = i64::from(m.source);
            prev_source_line = i64::from(m.source_line);
            prev_source_col = i64::from(m.source_col);
        }
        out
    }

    /// Render the map as JSON for the artifact named `file`.
    #[must_use]
    pub fn generate(&self, file: &str) -> String {
        let json = SourceMapJson {
            version: 3,
            file,
            source_root: "",
            sources: &self.sources,
            sources_content: &self.sources_content,
            names: [],
            mappings: self.encode_mappings(),
        };
        serde_json::to_string(&json).unwrap_or_default()
    }
}

/// Columns where a run of non-whitespace starts on `line`.
pub(crate) fn token_columns(line: &str) -> impl Iterator<Item = u32> + '_ {
    let bytes = line.as_bytes();
    (0..bytes.len())
        .filter(move |&i| {
            !bytes[i].is_ascii_whitespace() && (i == 0 || bytes[i - 1].is_ascii_whitespace())
        })
        .map(|i| i as u32)
}
