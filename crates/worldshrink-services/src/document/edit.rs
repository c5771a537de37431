use std::collections::BTreeMap;
use worldshrink_core::Span;

/// Replace `raw` at `offset` inside the decoded value of the literal at `literal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub literal: Span,
    pub offset: usize,
    pub raw: String,
    pub replacement: String,
}

/// Apply edits to a document. Every byte outside the edited paths is copied unchanged.
///
/// A path written without escapes is replaced in place inside the literal. Otherwise the
/// literal holding it is decoded, edited and re-encoded as a whole.
pub fn apply_edits(bytes: &[u8], edits: &[Edit]) -> Result<Vec<u8>, String> {
    let mut by_literal: BTreeMap<Span, Vec<&Edit>> = BTreeMap::new();
    for edit in edits {
        by_literal.entry(edit.literal).or_default().push(edit);
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut cursor = 0;

    for (span, mut group) in by_literal {
        if span.start < cursor || span.end > bytes.len() || span.start >= span.end {
            return Err(format!("invalid literal span {}..{}", span.start, span.end));
        }

        let literal = std::str::from_utf8(&bytes[span.start..span.end])
            .map_err(|_| format!("literal at {} is not valid UTF-8", span.start))?;
        group.sort_by(|a, b| b.offset.cmp(&a.offset));

        let encoded = match splice_in_place(literal, &group) {
            Some(spliced) => spliced,
            None => reencode(literal, span, &group)?,
        };

        out.extend_from_slice(&bytes[cursor..span.start]);
        out.extend_from_slice(encoded.as_bytes());
        cursor = span.end;
    }

    out.extend_from_slice(&bytes[cursor..]);
    Ok(out)
}

/// Replace each edit's raw bytes directly. `None` when any path is escaped in the source,
/// the replacement would need escaping, or the edits overlap.
fn splice_in_place(literal: &str, edits: &[&Edit]) -> Option<String> {
    let positions = raw_positions(literal)?;
    let mut text = literal.to_string();
    let mut limit = usize::MAX;

    for edit in edits {
        let end = edit.offset + edit.raw.len();
        if end > limit || edit.replacement.chars().any(needs_escape) {
            return None;
        }
        let start_raw = (*positions.get(edit.offset)?)?;
        let end_raw = (*positions.get(end)?)?;
        if text.get(start_raw..end_raw) != Some(edit.raw.as_str()) {
            return None;
        }
        text.replace_range(start_raw..end_raw, &edit.replacement);
        limit = edit.offset;
    }
    Some(text)
}

fn reencode(literal: &str, span: Span, group: &[&Edit]) -> Result<String, String> {
    let mut value: String = serde_json::from_str(literal)
        .map_err(|e| format!("literal at {} does not decode: {}", span.start, e))?;

    let mut limit = usize::MAX;
    for edit in group {
        let end = edit.offset + edit.raw.len();
        if end > limit {
            return Err(format!("overlapping edits in literal at {}", span.start));
        }
        if value.get(edit.offset..end) != Some(edit.raw.as_str()) {
            return Err(format!(
                "literal at {} no longer contains {:?}",
                span.start, edit.raw
            ));
        }
        value.replace_range(edit.offset..end, &edit.replacement);
        limit = edit.offset;
    }

    serde_json::to_string(&value)
        .map_err(|e| format!("failed to encode literal at {}: {}", span.start, e))
}

fn needs_escape(c: char) -> bool {
    c == '"' || c == '\\' || c.is_control()
}

/// Byte position inside a JSON string literal for every decoded byte offset, plus one for
/// the end. Offsets that fall inside the expansion of an escape map to `None`.
fn raw_positions(literal: &str) -> Option<Vec<Option<usize>>> {
    let bytes = literal.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return None;
    }
    let close = bytes.len() - 1;
    let mut positions = Vec::with_capacity(close);
    let mut i = 1;

    while i < close {
        if bytes[i] != b'\\' {
            positions.push(Some(i));
            i += 1;
            continue;
        }
        let escape = i;
        let decoded_len = if *bytes.get(i + 1)? == b'u' {
            let unit = hex4(bytes.get(i + 2..i + 6)?)?;
            i += 6;
            if (0xD800..0xDC00).contains(&unit) {
                if bytes.get(i..i + 2)? != b"\\u" {
                    return None;
                }
                hex4(bytes.get(i + 2..i + 6)?)?;
                i += 6;
                4
            } else {
                char::from_u32(unit)?.len_utf8()
            }
        } else {
            i += 2;
            1
        };
        positions.push(Some(escape));
        positions.extend(std::iter::repeat(None).take(decoded_len - 1));
    }

    positions.push(Some(close));
    Some(positions)
}

fn hex4(digits: &[u8]) -> Option<u32> {
    u32::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()
}
