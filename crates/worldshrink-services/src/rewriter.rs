//! Reference Rewriter
//!
//! Applies confirmed redirects to the documents that hold them. Each document is rebuilt
//! in memory from the bytes it was scanned from and replaced in a single atomic write; a
//! document with nothing to change is never written.

use crate::document::{apply_edits, Edit, ScannedDocument};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use worldshrink_core::{DocumentId, EngineError, MediaPath, RedirectPlan, ReferenceSite};
use worldshrink_storage::{fingerprint_bytes, WorldStorage};

#[derive(Debug, Default)]
pub struct RewriteOutcome {
    pub rewritten: usize,
    /// Sites left as written because their target is missing or unconfirmed
    pub skipped: usize,
    /// Sites in documents whose write failed
    pub failed: usize,
    pub documents_rewritten: usize,
    /// Assets some reference points at once rewriting is done
    pub survivors: BTreeSet<MediaPath>,
    pub failures: Vec<EngineError>,
}

#[derive(Debug, Clone)]
struct PlannedEdit {
    edit: Edit,
    /// Storage key of the redirect target, checked right before writing
    target_key: String,
    target: MediaPath,
    asset: MediaPath,
}

#[derive(Debug)]
struct DocumentJob {
    document: ScannedDocument,
    edits: Vec<PlannedEdit>,
}

#[derive(Debug, Default)]
struct DocumentResult {
    applied: Vec<MediaPath>,
    kept: Vec<MediaPath>,
    skipped: usize,
    failed: usize,
    error: Option<EngineError>,
}

pub struct ReferenceRewriter {
    storage: Arc<dyn WorldStorage>,
    max_workers: usize,
}

impl ReferenceRewriter {
    pub fn new(storage: Arc<dyn WorldStorage>, max_workers: usize) -> Self {
        Self {
            storage,
            max_workers: max_workers.max(1),
        }
    }

    #[tracing::instrument(skip_all, fields(stage = "rewrite", documents = documents.len(), sites = sites.len()))]
    pub async fn rewrite(
        &self,
        documents: &[ScannedDocument],
        sites: &[ReferenceSite],
        plan: &RedirectPlan,
    ) -> RewriteOutcome {
        let start = std::time::Instant::now();
        let mut outcome = RewriteOutcome::default();

        let mut by_document: BTreeMap<&DocumentId, Vec<PlannedEdit>> = BTreeMap::new();
        for site in sites {
            let Some(redirect) = plan.get(&site.target) else {
                outcome.skipped += 1;
                continue;
            };
            if redirect.target == site.target {
                outcome.survivors.insert(redirect.target.clone());
                continue;
            }
            if !redirect.confirmed {
                tracing::debug!(
                    document = %site.document,
                    locator = %site.locator,
                    target = %redirect.target,
                    "Redirect target not confirmed, leaving reference as written"
                );
                outcome.skipped += 1;
                outcome.survivors.insert(redirect.asset.clone());
                continue;
            }

            by_document.entry(&site.document).or_default().push(PlannedEdit {
                edit: Edit {
                    literal: site.locator.literal,
                    offset: site.locator.offset,
                    raw: site.raw.clone(),
                    replacement: replacement_text(&site.raw, &redirect.reference),
                },
                target_key: redirect.reference.clone(),
                target: redirect.target.clone(),
                asset: redirect.asset.clone(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut in_flight: BTreeMap<DocumentId, Vec<MediaPath>> = BTreeMap::new();

        for document in documents {
            let Some(edits) = by_document.remove(&document.id) else {
                continue;
            };
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            in_flight.insert(
                document.id.clone(),
                edits.iter().map(|e| e.asset.clone()).collect(),
            );
            let storage = self.storage.clone();
            let job = DocumentJob {
                document: document.clone(),
                edits,
            };
            tasks.spawn(async move {
                let _permit = permit;
                let id = job.document.id.clone();
                (id, Self::rewrite_document(storage.as_ref(), job).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    in_flight.remove(&id);
                    if result.error.is_none() && !result.applied.is_empty() {
                        outcome.documents_rewritten += 1;
                    }
                    outcome.rewritten += result.applied.len();
                    outcome.skipped += result.skipped;
                    outcome.failed += result.failed;
                    outcome.survivors.extend(result.applied);
                    outcome.survivors.extend(result.kept);
                    outcome.failures.extend(result.error);
                }
                Err(e) => tracing::error!(error = %e, "Rewrite task failed"),
            }
        }

        // Documents whose task never reported back keep every reference they had.
        for (id, assets) in in_flight {
            outcome.failed += assets.len();
            outcome.survivors.extend(assets);
            outcome.failures.push(EngineError::Write {
                document: id.to_string(),
                message: "rewrite task aborted".to_string(),
            });
        }

        tracing::info!(
            rewritten = outcome.rewritten,
            skipped = outcome.skipped,
            failed = outcome.failed,
            documents = outcome.documents_rewritten,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Rewrite stage complete"
        );

        outcome
    }

    #[tracing::instrument(skip_all, fields(document = %job.document.id, edits = job.edits.len()))]
    async fn rewrite_document(storage: &dyn WorldStorage, job: DocumentJob) -> DocumentResult {
        let mut result = DocumentResult::default();
        let mut edits = Vec::with_capacity(job.edits.len());
        let mut applied = Vec::with_capacity(job.edits.len());

        for planned in job.edits {
            match storage.exists(&planned.target_key).await {
                Ok(true) => {
                    edits.push(planned.edit);
                    applied.push((planned.target, planned.asset));
                }
                _ => {
                    tracing::warn!(
                        target_key = %planned.target_key,
                        "Redirect target vanished before rewrite, leaving reference as written"
                    );
                    result.skipped += 1;
                    result.kept.push(planned.asset);
                }
            }
        }

        if edits.is_empty() {
            return result;
        }

        let document = &job.document;
        let written = async {
            let current = storage
                .read(&document.key)
                .await
                .map_err(|e| e.to_string())?;
            if fingerprint_bytes(&current) != document.fingerprint {
                return Err("document changed since it was scanned".to_string());
            }
            let updated = apply_edits(&current, &edits)?;
            storage
                .write_atomic(&document.key, updated)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        match written {
            Ok(()) => {
                tracing::info!(
                    document = %document.id,
                    references = applied.len(),
                    "Document rewritten"
                );
                result.applied = applied.into_iter().map(|(target, _)| target).collect();
            }
            Err(message) => {
                tracing::warn!(document = %document.id, error = %message, "Document rewrite failed");
                result.failed += applied.len();
                result.kept.extend(applied.into_iter().map(|(_, asset)| asset));
                result.error = Some(EngineError::Write {
                    document: document.id.to_string(),
                    message,
                });
            }
        }

        result
    }
}

/// Text written in place of `raw`, keeping its leading slash and percent-encoding.
fn replacement_text(raw: &str, reference: &str) -> String {
    let mut text = if raw.contains('%') {
        reference
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    } else {
        reference.to_string()
    };
    if raw.starts_with('/') {
        text.insert(0, '/');
    }
    text
}
