//! Inline source map extraction and decoding

use crate::utils::{posix_dirname, posix_resolve};
use crate::{ModuleError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

const INLINE_MAP_PREFIX: &str = "//# sourceMappingURL=data:application/json;base64,";

const VLQ_CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Find the base64 payload of an inline source map comment
pub fn extract_inline_map(code: &str) -> Option<&str> {
    let start = code.rfind(INLINE_MAP_PREFIX)? + INLINE_MAP_PREFIX.len();
    let rest = &code[start..];
    let end = rest.find(['\n', '\r']).unwrap_or(rest.len());
    let encoded = rest[..end].trim();
    (!encoded.is_empty()).then_some(encoded)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    mappings: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default)]
    source_root: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    generated_column: i64,
    original: Option<OriginalSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OriginalSegment {
    source: i64,
    line: i64,
    column: i64,
    name: Option<i64>,
}

/// A position in original source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    /// Resolved source path
    pub source: Option<String>,
    /// 1-based line
    pub line: u32,
    /// 0-based column
    pub column: u32,
    /// Original identifier name
    pub name: Option<String>,
}

/// A decoded source map
#[derive(Debug, Clone)]
pub struct DecodedMap {
    version: u32,
    url: String,
    names: Vec<String>,
    resolved_sources: Vec<Option<String>>,
    lines: Vec<Vec<Segment>>,
}

impl DecodedMap {
    /// Decode a base64 encoded JSON source map belonging to `base_file`
    pub fn from_base64(id: &str, encoded: &str, base_file: &str) -> Result<Self> {
        let bytes = STANDARD.decode(encoded).map_err(|e| ModuleError::SourceMap {
            id: id.to_string(),
            message: format!("invalid base64: {}", e),
        })?;
        let json = String::from_utf8(bytes).map_err(|e| ModuleError::SourceMap {
            id: id.to_string(),
            message: format!("invalid utf-8: {}", e),
        })?;
        Self::from_json(id, &json, base_file)
    }

    /// Decode a JSON source map belonging to `base_file`
    pub fn from_json(id: &str, json: &str, base_file: &str) -> Result<Self> {
        let raw: RawSourceMap = serde_json::from_str(json).map_err(|e| ModuleError::SourceMap {
            id: id.to_string(),
            message: e.to_string(),
        })?;

        let dir = posix_dirname(base_file);
        let root = raw.source_root.unwrap_or_default();
        let resolved_sources = raw
            .sources
            .iter()
            .map(|source| {
                source.as_ref().map(|source| {
                    let source = format!("{}{}", root, source);
                    posix_resolve(&[dir.as_str(), source.as_str()])
                })
            })
            .collect();

        let lines = decode_mappings(&raw.mappings).map_err(|message| ModuleError::SourceMap {
            id: id.to_string(),
            message,
        })?;

        Ok(Self {
            version: raw.version,
            url: base_file.to_string(),
            names: raw.names,
            resolved_sources,
            lines,
        })
    }

    /// Source map format version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The file this map belongs to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sources resolved against the directory of the mapped file
    pub fn sources(&self) -> &[Option<String>] {
        &self.resolved_sources
    }

    /// Map a generated position (1-based line, 0-based column) back to the
    /// original source
    pub fn original_position_for(&self, line: u32, column: u32) -> Option<OriginalPosition> {
        let segments = self.lines.get((line as usize).checked_sub(1)?)?;
        let column = i64::from(column);

        // Last segment starting at or before the column; ties resolve to
        // the first segment with that column
        let upper = segments.partition_point(|s| s.generated_column <= column);
        let found = segments.get(upper.checked_sub(1)?)?;
        let first = segments.partition_point(|s| s.generated_column < found.generated_column);
        let original = segments[first].original?;

        Some(OriginalPosition {
            source: usize::try_from(original.source)
                .ok()
                .and_then(|idx| self.resolved_sources.get(idx).cloned().flatten()),
            line: u32::try_from(original.line + 1).ok()?,
            column: u32::try_from(original.column).ok()?,
            name: original
                .name
                .and_then(|idx| usize::try_from(idx).ok())
                .and_then(|idx| self.names.get(idx).cloned()),
        })
    }
}

fn vlq_digit(byte: u8) -> Option<i64> {
    VLQ_CHARS.iter().position(|&c| c == byte).map(|idx| idx as i64)
}

fn decode_vlq(segment: &str) -> std::result::Result<Vec<i64>, String> {
    let mut values = Vec::with_capacity(5);
    let mut value: i64 = 0;
    let mut shift = 0;

    for byte in segment.bytes() {
        let digit = vlq_digit(byte)
            .ok_or_else(|| format!("invalid VLQ character {:?}", byte as char))?;
        value |= (digit & 31) << shift;
        if digit & 32 != 0 {
            shift += 5;
            if shift > 60 {
                return Err(format!("VLQ value overflow in segment {:?}", segment));
            }
            continue;
        }
        let negative = value & 1 == 1;
        value >>= 1;
        values.push(if negative { -value } else { value });
        value = 0;
        shift = 0;
    }

    if shift != 0 {
        return Err(format!("truncated VLQ segment {:?}", segment));
    }
    Ok(values)
}

fn decode_mappings(mappings: &str) -> std::result::Result<Vec<Vec<Segment>>, String> {
    // Every field except the generated column accumulates across lines
    let mut source = 0;
    let mut original_line = 0;
    let mut original_column = 0;
    let mut name = 0;
    let mut lines = Vec::new();

    for line in mappings.split(';') {
        let mut generated_column = 0;
        let mut segments = Vec::new();

        for raw in line.split(',').filter(|raw| !raw.is_empty()) {
            let fields = decode_vlq(raw)?;
            generated_column += fields[0];
            let original = match fields.len() {
                1 => None,
                4 | 5 => {
                    source += fields[1];
                    original_line += fields[2];
                    original_column += fields[3];
                    let segment_name = (fields.len() == 5).then(|| {
                        name += fields[4];
                        name
                    });
                    Some(OriginalSegment {
                        source,
                        line: original_line,
                        column: original_column,
                        name: segment_name,
                    })
                }
                n => return Err(format!("segment {:?} has {} fields", raw, n)),
            };
            segments.push(Segment {
                generated_column,
                original,
            });
        }

        segments.sort_by_key(|s| s.generated_column);
        lines.push(segments);
    }

    Ok(lines)
}
