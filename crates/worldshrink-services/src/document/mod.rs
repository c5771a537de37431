//! World documents
//!
//! `*.json` files hold one record each. `*.db` files are NeDB databases: one JSON record
//! per line. Both are parsed into [`tree::Node`]s whose string spans point into the
//! original file bytes, so edits can be spliced back without touching anything else.

pub mod edit;
pub mod tree;

pub use edit::{apply_edits, Edit};
pub use tree::{Node, Pointer, Visitor};

use worldshrink_core::{ContentFingerprint, DocumentId};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Json,
    NeDb,
}

impl DocumentKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let (_, ext) = path.rsplit_once('.')?;
        match ext.to_lowercase().as_str() {
            "json" => Some(DocumentKind::Json),
            "db" => Some(DocumentKind::NeDb),
            _ => None,
        }
    }
}

/// One parsed record
#[derive(Debug, Clone)]
pub struct Record {
    /// 1-based line for NeDB records
    pub line: Option<usize>,
    pub root: Node,
}

/// A document that parsed cleanly during the scan
#[derive(Debug, Clone)]
pub struct ScannedDocument {
    pub id: DocumentId,
    /// Storage key of the document file
    pub key: String,
    pub kind: DocumentKind,
    /// Fingerprint of the bytes the sites were located in
    pub fingerprint: ContentFingerprint,
    pub sites: usize,
}

/// Parse a document's bytes into records.
pub fn parse_records(bytes: &[u8], kind: DocumentKind) -> Result<Vec<Record>, String> {
    match kind {
        DocumentKind::Json => {
            let base = if bytes.starts_with(UTF8_BOM) {
                UTF8_BOM.len()
            } else {
                0
            };
            let root = tree::parse(&bytes[base..], base).map_err(|e| e.to_string())?;
            Ok(vec![Record { line: None, root }])
        }
        DocumentKind::NeDb => {
            let mut records = Vec::new();
            let mut offset = 0;
            for (index, raw_line) in bytes.split(|b| *b == b'\n').enumerate() {
                let line_start = offset;
                offset += raw_line.len() + 1;

                let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
                let (line, base) = if index == 0 && line.starts_with(UTF8_BOM) {
                    (&line[UTF8_BOM.len()..], line_start + UTF8_BOM.len())
                } else {
                    (line, line_start)
                };
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }

                let root = tree::parse(line, base)
                    .map_err(|e| format!("line {}: {}", index + 1, e))?;
                records.push(Record {
                    line: Some(index + 1),
                    root,
                });
            }
            Ok(records)
        }
    }
}
