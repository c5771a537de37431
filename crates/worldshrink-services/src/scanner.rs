//! Reference Scanner
//!
//! Walks the document corpus and collects every media reference. A string field is a
//! reference when the whole value names a local file with an allowed extension, or when
//! it holds HTML whose `<img src>` values do. Documents that fail to parse are reported
//! and excluded from rewriting; the paths they appear to mention are pinned so that
//! cleanup never removes them.

use crate::document::{self, DocumentKind, Pointer, ScannedDocument, Visitor};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use worldshrink_core::{
    DocumentId, EngineError, MediaPath, ReferenceSite, SiteLocator, Span,
};
use worldshrink_processing::MediaMatcher;
use worldshrink_storage::{fingerprint_bytes, WorldStorage};

const IMG_SRC_PATTERN: &str = r#"(?i)<img\b[^>]*?\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)')"#;

/// A document file selected for scanning
#[derive(Debug, Clone)]
pub struct DocumentFile {
    pub id: DocumentId,
    pub key: String,
    pub kind: DocumentKind,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub documents: Vec<ScannedDocument>,
    pub sites: Vec<ReferenceSite>,
    /// Paths mentioned by documents that could not be parsed
    pub pinned: BTreeSet<MediaPath>,
    /// Documents whose references are unknown because they could not be read
    pub unreadable: usize,
    /// Links to remote hosts or inline data carrying a media extension
    pub external_links: usize,
    pub documents_scanned: usize,
    pub failures: Vec<EngineError>,
}

/// Sites found in one document's bytes
#[derive(Debug, Default)]
pub struct Extracted {
    pub sites: Vec<ReferenceSite>,
    pub external_links: usize,
}

#[derive(Clone)]
pub struct ReferenceScanner {
    storage: Arc<dyn WorldStorage>,
    matcher: Arc<MediaMatcher>,
    img_src: Arc<Regex>,
    pinned_path: Arc<Regex>,
    max_workers: usize,
}

impl ReferenceScanner {
    pub fn new(
        storage: Arc<dyn WorldStorage>,
        matcher: MediaMatcher,
        extensions: &[String],
        max_workers: usize,
    ) -> Result<Self, EngineError> {
        let img_src = Regex::new(IMG_SRC_PATTERN)
            .map_err(|e| EngineError::InvalidConfig(format!("img pattern: {}", e)))?;
        let pinned_path = pinned_path_regex(extensions)?;

        Ok(Self {
            storage,
            matcher: Arc::new(matcher),
            img_src: Arc::new(img_src),
            pinned_path: Arc::new(pinned_path),
            max_workers: max_workers.max(1),
        })
    }

    #[tracing::instrument(skip(self, files), fields(stage = "scan", documents = files.len()))]
    pub async fn scan(&self, files: Vec<DocumentFile>) -> ScanOutcome {
        let start = std::time::Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeMap<DocumentId, String> = BTreeMap::new();
        let mut outcome = ScanOutcome {
            documents_scanned: files.len(),
            ..ScanOutcome::default()
        };

        for file in files {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            pending.insert(file.id.clone(), file.key.clone());
            let scanner = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                scanner.scan_document(file).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(DocumentScan::Parsed {
                    document,
                    extracted,
                }) => {
                    pending.remove(&document.id);
                    outcome.external_links += extracted.external_links;
                    outcome.sites.extend(extracted.sites);
                    outcome.documents.push(document);
                }
                Ok(DocumentScan::Failed { id, error, pinned }) => {
                    pending.remove(&id);
                    outcome.pinned.extend(pinned);
                    outcome.failures.push(error);
                }
                Ok(DocumentScan::Unreadable { id, error }) => {
                    pending.remove(&id);
                    outcome.unreadable += 1;
                    outcome.failures.push(error);
                }
                Err(e) => tracing::error!(error = %e, "Document scan task failed"),
            }
        }

        // Anything still pending belongs to a task that panicked.
        for (id, key) in pending {
            let path = self
                .storage
                .key_to_path(&key)
                .unwrap_or_else(|_| key.clone().into());
            outcome.unreadable += 1;
            outcome.failures.push(EngineError::io(
                path,
                std::io::Error::other(format!("scan of {} aborted", id)),
            ));
        }

        outcome.documents.sort_by(|a, b| a.id.cmp(&b.id));
        outcome.sites.sort_by(|a, b| {
            (&a.document, a.locator.literal, a.locator.offset)
                .cmp(&(&b.document, b.locator.literal, b.locator.offset))
        });

        tracing::info!(
            documents = outcome.documents_scanned,
            failed = outcome.failures.len(),
            sites = outcome.sites.len(),
            external = outcome.external_links,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Reference scan complete"
        );

        outcome
    }

    async fn scan_document(&self, file: DocumentFile) -> DocumentScan {
        let bytes = match self.storage.read(&file.key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let path = self
                    .storage
                    .key_to_path(&file.key)
                    .unwrap_or_else(|_| file.key.clone().into());
                let error = e.into_engine(path);
                tracing::warn!(document = %file.id, error = %error, "Failed to read document");
                return DocumentScan::Unreadable { id: file.id, error };
            }
        };

        match self.extract(&file.id, &bytes, file.kind) {
            Ok(extracted) => {
                tracing::debug!(
                    document = %file.id,
                    sites = extracted.sites.len(),
                    "Document scanned"
                );
                DocumentScan::Parsed {
                    document: ScannedDocument {
                        id: file.id,
                        key: file.key,
                        kind: file.kind,
                        fingerprint: fingerprint_bytes(&bytes),
                        sites: extracted.sites.len(),
                    },
                    extracted,
                }
            }
            Err(message) => {
                tracing::warn!(document = %file.id, error = %message, "Document failed to parse, excluding it from rewriting");
                let pinned = self.pinned_paths(&String::from_utf8_lossy(&bytes));
                DocumentScan::Failed {
                    error: EngineError::Parse {
                        document: file.id.to_string(),
                        message,
                    },
                    id: file.id,
                    pinned,
                }
            }
        }
    }

    /// Collect sites from a document's bytes.
    pub fn extract(
        &self,
        document: &DocumentId,
        bytes: &[u8],
        kind: DocumentKind,
    ) -> Result<Extracted, String> {
        let records = document::parse_records(bytes, kind)?;
        let mut collector = SiteCollector {
            matcher: &self.matcher,
            img_src: &self.img_src,
            document,
            line: None,
            extracted: Extracted::default(),
        };
        for record in &records {
            collector.line = record.line;
            record.root.accept(&mut collector);
        }
        Ok(collector.extracted)
    }

    /// Best-effort extraction of quoted media paths from unparseable text.
    pub fn pinned_paths(&self, text: &str) -> BTreeSet<MediaPath> {
        self.pinned_path
            .captures_iter(text)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str())
            .filter(|raw| !MediaMatcher::is_external(raw))
            .filter_map(MediaPath::parse)
            .collect()
    }
}

enum DocumentScan {
    Parsed {
        document: ScannedDocument,
        extracted: Extracted,
    },
    Failed {
        id: DocumentId,
        error: EngineError,
        pinned: BTreeSet<MediaPath>,
    },
    /// Nothing is known about what this document references
    Unreadable { id: DocumentId, error: EngineError },
}

fn pinned_path_regex(extensions: &[String]) -> Result<Regex, EngineError> {
    let alternatives: Vec<String> = extensions.iter().map(|e| regex::escape(e)).collect();
    let pattern = format!(
        r#"(?i)["'(]([^"'\\()<>\r\n]+?\.(?:{}))(?:[?#][^"'\\()<>\r\n]*)?\\?["')]"#,
        alternatives.join("|")
    );
    Regex::new(&pattern).map_err(|e| EngineError::InvalidConfig(format!("extension pattern: {}", e)))
}

struct SiteCollector<'a> {
    matcher: &'a MediaMatcher,
    img_src: &'a Regex,
    document: &'a DocumentId,
    line: Option<usize>,
    extracted: Extracted,
}

impl SiteCollector<'_> {
    fn push(&mut self, pointer: &Pointer, span: Span, value: &str, start: usize, end: usize) {
        let candidate = &value[start..end];
        let leading = candidate.len() - candidate.trim_start().len();
        let raw = candidate.trim();
        let Some(target) = MediaPath::parse(raw) else {
            return;
        };

        self.extracted.sites.push(ReferenceSite {
            document: self.document.clone(),
            locator: SiteLocator {
                line: self.line,
                pointer: pointer.to_string(),
                literal: span,
                offset: start + leading,
            },
            raw: raw.to_string(),
            target,
        });
    }

    fn is_external_media(&self, value: &str) -> bool {
        MediaMatcher::is_external(value) && self.matcher.has_media_extension(value)
    }
}

impl Visitor for SiteCollector<'_> {
    fn visit_string(&mut self, pointer: &Pointer, value: &str, span: Span) {
        if self.matcher.is_candidate(value) {
            self.push(pointer, span, value, 0, value.len());
            return;
        }

        if self.is_external_media(value) {
            self.extracted.external_links += 1;
            return;
        }

        if !value.to_ascii_lowercase().contains("<img") {
            return;
        }

        let img_src = self.img_src;
        for cap in img_src.captures_iter(value) {
            let Some(m) = cap.get(1).or_else(|| cap.get(2)) else {
                continue;
            };
            if self.matcher.is_candidate(m.as_str()) {
                self.push(pointer, span, value, m.start(), m.end());
            } else if self.is_external_media(m.as_str()) {
                self.extracted.external_links += 1;
            }
        }
    }
}
