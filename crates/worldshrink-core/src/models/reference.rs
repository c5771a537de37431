use super::MediaPath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// World-relative path of a document file (`/` separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte range in file coordinates, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Where a reference sits inside its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteLocator {
    /// 1-based record line for line-delimited databases
    pub line: Option<usize>,
    /// JSON pointer to the string field, e.g. `/tokens/0/img`
    pub pointer: String,
    /// The string literal holding the reference, quotes included
    pub literal: Span,
    /// Byte offset of the raw path within the decoded string value
    pub offset: usize,
}

impl fmt::Display for SiteLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}:{}", line, self.pointer),
            None => f.write_str(&self.pointer),
        }
    }
}

/// One occurrence of a media path inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSite {
    pub document: DocumentId,
    pub locator: SiteLocator,
    /// Path text exactly as written
    pub raw: String,
    pub target: MediaPath,
}
