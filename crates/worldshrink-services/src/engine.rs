//! Engine
//!
//! Runs the stages in order over one world: list, hash, scan, resolve, transcode,
//! rewrite, collect. Every stage finishes before the next one starts, and cancellation is
//! honoured only between stages.

use crate::cleanup::{GarbageCollector, GcInput};
use crate::document::DocumentKind;
use crate::resolver::{AssetResolver, Resolution};
use crate::rewriter::ReferenceRewriter;
use crate::scanner::{DocumentFile, ReferenceScanner, ScanOutcome};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use worldshrink_core::{
    clean_path, AssetRecord, DedupGroup, DocumentId, EngineConfig, EngineError, ErrorMetadata,
    LogLevel, MediaPath, ReferenceSite, RunReport, TranscodeStatus,
};
use worldshrink_processing::{sniff_format, CodecInvoker, MediaMatcher, TranscodeJob, TranscodePipeline};
use worldshrink_storage::{fingerprint, LocalWorldStorage, RestoreSummary, WorldStorage};

/// Result of a dry run: what a full run would merge, without touching the world
#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub report: RunReport,
    pub groups: Vec<DedupGroup>,
    pub missing: Vec<MediaPath>,
    pub unreferenced: Vec<MediaPath>,
}

/// Files found in the world, split by role
struct Inventory {
    assets: Vec<AssetRecord>,
    on_disk: BTreeSet<MediaPath>,
    documents: Vec<DocumentFile>,
    /// Documents never rewritten whose references still protect assets
    excluded: Vec<String>,
    /// Paths that name more than one file once case is folded
    ambiguous: BTreeSet<MediaPath>,
}

/// Everything known once references are resolved
struct Planned {
    inventory: Inventory,
    scan: ScanOutcome,
    sites: Vec<ReferenceSite>,
    /// Sites left as written because their target is ambiguous
    ambiguous_sites: usize,
    resolution: Resolution,
}

pub struct Engine {
    config: EngineConfig,
    storage: Arc<dyn WorldStorage>,
}

impl Engine {
    /// Validate the configuration and open the world on the local filesystem.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let storage = LocalWorldStorage::from_config(&config)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        Ok(Self::with_storage(config, Arc::new(storage)))
    }

    pub fn with_storage(config: EngineConfig, storage: Arc<dyn WorldStorage>) -> Self {
        Self { config, storage }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Full run. Errors only for conditions that make the run impossible; every per-item
    /// problem is recorded in the returned report.
    #[tracing::instrument(skip_all, fields(world = %self.config.world_root.display()))]
    pub async fn run(
        &self,
        codec: Arc<dyn CodecInvoker>,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let start = std::time::Instant::now();

        if codec.target() != self.config.target_codec {
            return Err(EngineError::InvalidConfig(format!(
                "codec {} produces {}, configured target is {}",
                codec.name(),
                codec.target(),
                self.config.target_codec
            )));
        }
        codec.check_available().await.map_err(|e| {
            tracing::error!(codec = codec.name(), error = %e, "Codec unavailable");
            EngineError::CodecUnavailable(e.to_string())
        })?;

        let mut report = RunReport::default();

        let Some(mut planned) = self.plan(&mut report, &cancel).await? else {
            return Ok(report);
        };

        if stop_requested(&cancel, &mut report, "transcode") {
            return Ok(report);
        }
        let confirmed = self.transcode(codec, &mut planned, &mut report).await;

        if stop_requested(&cancel, &mut report, "rewrite") {
            return Ok(report);
        }
        let rewriter = ReferenceRewriter::new(self.storage.clone(), self.config.max_workers);
        let rewrite = rewriter
            .rewrite(&planned.scan.documents, &planned.sites, &planned.resolution.plan)
            .await;
        report.references_rewritten = rewrite.rewritten;
        report.references_skipped = rewrite.skipped + planned.ambiguous_sites;
        report.references_failed = rewrite.failed;
        report.documents_rewritten = rewrite.documents_rewritten;
        for error in &rewrite.failures {
            record(&mut report, error);
        }

        if stop_requested(&cancel, &mut report, "gc") {
            return Ok(report);
        }
        let (excluded_pins, excluded_unreadable) = self
            .excluded_references(&planned.inventory.excluded, &mut report)
            .await;
        let unreadable = planned.scan.unreadable + excluded_unreadable;
        if let Some(reason) = self.gc_skip_reason(&report, unreadable) {
            tracing::info!(reason = %reason, "Skipping cleanup");
            report.gc_skipped_reason = Some(reason);
        } else {
            let mut pinned = planned.scan.pinned.clone();
            pinned.extend(excluded_pins);
            pinned.extend(planned.inventory.ambiguous.iter().cloned());

            let collector = GarbageCollector::new(self.storage.clone(), self.config.purge_trash);
            let gc = collector
                .collect(GcInput {
                    assets: &planned.inventory.assets,
                    groups: &planned.resolution.groups,
                    confirmed: &confirmed,
                    survivors: &rewrite.survivors,
                    pinned: &pinned,
                })
                .await;
            report.files_deleted = gc.files_deleted;
            report.bytes_before = gc.bytes_freed;
            for error in &gc.failures {
                record(&mut report, error);
            }
        }

        tracing::info!(
            hashed = report.assets_hashed,
            transcoded = report.assets_transcoded,
            rewritten = report.references_rewritten,
            deleted = report.files_deleted,
            failures = report.failures.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Run complete"
        );

        Ok(report)
    }

    /// Hash, scan and resolve without changing anything on disk.
    #[tracing::instrument(skip_all, fields(world = %self.config.world_root.display()))]
    pub async fn scan(&self, cancel: CancellationToken) -> Result<ScanReport, EngineError> {
        let mut report = RunReport::default();
        let Some(planned) = self.plan(&mut report, &cancel).await? else {
            return Ok(ScanReport {
                report,
                groups: Vec::new(),
                missing: Vec::new(),
                unreferenced: Vec::new(),
            });
        };

        Ok(ScanReport {
            report,
            missing: planned.resolution.plan.missing().cloned().collect(),
            unreferenced: planned.resolution.unreferenced.into_iter().collect(),
            groups: planned.resolution.groups,
        })
    }

    pub async fn restore_trash(&self) -> Result<RestoreSummary, EngineError> {
        let summary = self
            .storage
            .restore_trash()
            .await
            .map_err(|e| e.into_engine(self.storage.world_root()))?;
        tracing::info!(
            restored = summary.restored,
            skipped = summary.skipped,
            "Trash restored"
        );
        Ok(summary)
    }

    /// List, hash, scan and resolve. `None` when cancelled in between.
    async fn plan(
        &self,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Result<Option<Planned>, EngineError> {
        let mut inventory = self.discover(report).await?;

        if stop_requested(cancel, report, "hash") {
            return Ok(None);
        }
        self.hash_assets(&mut inventory.assets, report).await;

        if stop_requested(cancel, report, "scan") {
            return Ok(None);
        }
        let scanner = ReferenceScanner::new(
            self.storage.clone(),
            MediaMatcher::from_config(&self.config),
            &self.config.media_extensions,
            self.config.max_workers,
        )?;
        let mut scan = scanner.scan(inventory.documents.clone()).await;
        report.documents_scanned = scan.documents_scanned;
        report.documents_failed = scan.failures.len();
        for error in &scan.failures {
            record(report, error);
        }

        if stop_requested(cancel, report, "resolve") {
            return Ok(None);
        }
        let sites = std::mem::take(&mut scan.sites);
        let (mut sites, external) = self.split_external(sites, &inventory.assets).await;
        report.external_references = scan.external_links + external;
        report.reference_sites = sites.len();

        let resolver =
            AssetResolver::new(self.config.target_codec, self.config.repair_module_paths);
        let before = sites.len();
        sites.retain(|site| {
            let ambiguous = inventory.ambiguous.contains(&site.target)
                || resolver
                    .repair(&site.target)
                    .is_some_and(|repaired| inventory.ambiguous.contains(&repaired));
            if ambiguous {
                tracing::warn!(
                    document = %site.document,
                    raw = %site.raw,
                    "Reference names files that differ only in case, leaving it as written"
                );
            }
            !ambiguous
        });
        let ambiguous_sites = before - sites.len();
        let resolution = resolver.resolve(&inventory.assets, &inventory.on_disk, &sites);
        report.duplicate_groups = resolution
            .groups
            .iter()
            .filter(|g| g.is_duplicate_group())
            .count();
        for error in &resolution.failures {
            record(report, error);
        }

        Ok(Some(Planned {
            inventory,
            scan,
            sites,
            ambiguous_sites,
            resolution,
        }))
    }

    async fn discover(&self, report: &mut RunReport) -> Result<Inventory, EngineError> {
        let entries = self
            .storage
            .list_world()
            .await
            .map_err(|e| e.into_engine(self.storage.world_root()))?;

        let prefix = self.config.world_prefix();
        let target_ext = self.config.target_codec.extension();
        let excluded: BTreeSet<String> = self
            .config
            .excluded_documents
            .iter()
            .map(|d| d.to_lowercase())
            .collect();

        let mut inventory = Inventory {
            assets: Vec::new(),
            on_disk: BTreeSet::new(),
            documents: Vec::new(),
            excluded: Vec::new(),
            ambiguous: BTreeSet::new(),
        };

        for entry in entries {
            let Some(path) = MediaPath::parse(&entry.key) else {
                continue;
            };
            inventory.on_disk.insert(path.clone());

            let is_asset = path
                .extension()
                .is_some_and(|ext| self.config.is_media_extension(ext) || ext == target_ext);
            if is_asset {
                inventory
                    .assets
                    .push(AssetRecord::new(path, entry.key, entry.absolute, entry.size));
                continue;
            }

            if let Some(kind) = DocumentKind::from_path(&entry.key) {
                let world_relative = world_relative(&prefix, &entry.key).to_string();
                if excluded.contains(&world_relative.to_lowercase()) {
                    tracing::debug!(document = %world_relative, "Document excluded from rewriting");
                    inventory.excluded.push(entry.key);
                    continue;
                }
                inventory.documents.push(DocumentFile {
                    id: DocumentId::new(world_relative),
                    key: entry.key,
                    kind,
                });
            }
        }

        quarantine_case_collisions(&mut inventory, report);

        tracing::info!(
            assets = inventory.assets.len(),
            documents = inventory.documents.len(),
            files = inventory.on_disk.len(),
            "World discovered"
        );
        Ok(inventory)
    }

    #[tracing::instrument(skip_all, fields(stage = "hash", assets = assets.len()))]
    async fn hash_assets(&self, assets: &mut [AssetRecord], report: &mut RunReport) {
        let start = std::time::Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<usize> = BTreeSet::new();

        for (index, asset) in assets.iter().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            pending.insert(index);
            let path = asset.absolute.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let digest = fingerprint(&path).await.map_err(|e| e.into_engine(&path));
                (index, digest)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(digest))) => {
                    pending.remove(&index);
                    let asset = &mut assets[index];
                    asset.fingerprint = Some(digest.fingerprint);
                    asset.format = sniff_format(&digest.head);
                    asset.size = digest.size;
                    report.assets_hashed += 1;
                }
                Ok((index, Err(error))) => {
                    pending.remove(&index);
                    tracing::warn!(path = %assets[index].path, error = %error, "Failed to hash asset");
                    record(report, &error);
                }
                Err(e) => tracing::error!(error = %e, "Hash task failed"),
            }
        }

        // Anything still pending belongs to a task that panicked. The asset stays unhashed.
        for index in pending {
            let error = EngineError::io(
                &assets[index].absolute,
                std::io::Error::other("hash task aborted"),
            );
            record(report, &error);
        }

        tracing::info!(
            hashed = report.assets_hashed,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Hash stage complete"
        );
    }

    /// Drop sites that point into the read-only core data folder. Returns the remaining
    /// sites and how many were dropped.
    async fn split_external(
        &self,
        sites: Vec<ReferenceSite>,
        assets: &[AssetRecord],
    ) -> (Vec<ReferenceSite>, usize) {
        let Some(core_root) = &self.config.core_data_root else {
            return (sites, 0);
        };
        let known: BTreeSet<&MediaPath> = assets.iter().map(|a| &a.path).collect();
        let mut verdicts: BTreeMap<String, bool> = BTreeMap::new();
        let mut local = Vec::with_capacity(sites.len());
        let mut external = 0;

        for site in sites {
            if known.contains(&site.target) {
                local.push(site);
                continue;
            }
            let Some(cleaned) = clean_path(&site.raw) else {
                local.push(site);
                continue;
            };
            let is_core = match verdicts.get(&cleaned) {
                Some(found) => *found,
                None => {
                    let found = tokio::fs::try_exists(core_root.join(&cleaned))
                        .await
                        .unwrap_or(false);
                    verdicts.insert(cleaned, found);
                    found
                }
            };
            if is_core {
                external += 1;
            } else {
                local.push(site);
            }
        }

        if external > 0 {
            tracing::debug!(external = external, "References into core data left as written");
        }
        (local, external)
    }

    /// Produce every group's output. Returns whether each group's output is confirmed.
    async fn transcode(
        &self,
        codec: Arc<dyn CodecInvoker>,
        planned: &mut Planned,
        report: &mut RunReport,
    ) -> Vec<bool> {
        let index_of: BTreeMap<MediaPath, usize> = planned
            .inventory
            .assets
            .iter()
            .enumerate()
            .map(|(i, a)| (a.path.clone(), i))
            .collect();

        let groups = &planned.resolution.groups;
        let jobs: Vec<TranscodeJob> = groups
            .iter()
            .enumerate()
            .filter_map(|(group, g)| {
                let canonical = &planned.inventory.assets[*index_of.get(&g.canonical)?];
                Some(TranscodeJob {
                    group,
                    source_key: canonical.relative.clone(),
                    source_path: canonical.absolute.clone(),
                    output_key: g.output.relative.clone(),
                    action: g.output.action,
                })
            })
            .collect();

        let pipeline = TranscodePipeline::new(codec, self.storage.clone(), self.config.max_workers);
        let outcomes = pipeline.run(jobs).await;

        let mut confirmed = vec![false; groups.len()];
        for outcome in outcomes {
            let group = &groups[outcome.group];
            match outcome.status {
                TranscodeStatus::Done => report.assets_transcoded += 1,
                TranscodeStatus::Skipped => report.assets_skipped += 1,
                TranscodeStatus::Failed => report.assets_failed += 1,
                TranscodeStatus::Pending => {}
            }
            report.bytes_after += outcome.bytes_written;
            if let Some(error) = &outcome.error {
                record(report, error);
            }

            confirmed[outcome.group] = outcome.output_confirmed();
            if outcome.output_confirmed() {
                planned.resolution.plan.confirm(outcome.group);
                report.duplicates_merged += group.members.len() - 1;
            } else {
                planned.resolution.plan.retract(outcome.group);
            }

            for member in &group.members {
                if let Some(index) = index_of.get(member) {
                    planned.inventory.assets[*index].status = outcome.status;
                }
            }
        }

        confirmed
    }

    /// Paths mentioned by excluded documents. They are never rewritten, so whatever they
    /// point at stays.
    ///
    /// Also returns how many of them could not be read.
    async fn excluded_references(
        &self,
        keys: &[String],
        report: &mut RunReport,
    ) -> (BTreeSet<MediaPath>, usize) {
        let mut pinned = BTreeSet::new();
        let mut unreadable = 0;
        if keys.is_empty() {
            return (pinned, unreadable);
        }
        let scanner = match ReferenceScanner::new(
            self.storage.clone(),
            MediaMatcher::from_config(&self.config),
            &self.config.media_extensions,
            1,
        ) {
            Ok(scanner) => scanner,
            Err(error) => {
                record(report, &error);
                return (pinned, keys.len());
            }
        };
        for key in keys {
            match self.storage.read(key).await {
                Ok(bytes) => pinned.extend(scanner.pinned_paths(&String::from_utf8_lossy(&bytes))),
                Err(e) => {
                    let path = self
                        .storage
                        .key_to_path(key)
                        .unwrap_or_else(|_| key.clone().into());
                    unreadable += 1;
                    record(report, &e.into_engine(path));
                }
            }
        }
        (pinned, unreadable)
    }

    fn gc_skip_reason(&self, report: &RunReport, unreadable_documents: usize) -> Option<String> {
        if report.has_write_failures() {
            Some(format!(
                "{} reference(s) failed to rewrite",
                report.references_failed.max(1)
            ))
        } else if unreadable_documents > 0 {
            Some(format!(
                "{} document(s) could not be read",
                unreadable_documents
            ))
        } else if !self.config.delete_unreferenced {
            Some("deletion not enabled".to_string())
        } else {
            None
        }
    }
}

/// Run every stage over the configured world.
pub async fn run(
    config: &EngineConfig,
    codec: Arc<dyn CodecInvoker>,
    cancel: CancellationToken,
) -> Result<RunReport, EngineError> {
    Engine::new(config.clone())?.run(codec, cancel).await
}

pub async fn scan_only(
    config: &EngineConfig,
    cancel: CancellationToken,
) -> Result<ScanReport, EngineError> {
    Engine::new(config.clone())?.scan(cancel).await
}

pub async fn restore_trash(config: &EngineConfig) -> Result<RestoreSummary, EngineError> {
    Engine::new(config.clone())?.restore_trash().await
}

fn world_relative<'a>(prefix: &str, key: &'a str) -> &'a str {
    if prefix.is_empty() {
        return key;
    }
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(key)
}

fn stop_requested(cancel: &CancellationToken, report: &mut RunReport, next_stage: &str) -> bool {
    if cancel.is_cancelled() {
        tracing::warn!(next_stage = next_stage, "Run cancelled, returning partial report");
        report.cancelled = true;
        true
    } else {
        false
    }
}

/// Files whose folded paths collide cannot be told apart by references. They leave the
/// asset set, each is reported, and whatever names them is left alone.
fn quarantine_case_collisions(inventory: &mut Inventory, report: &mut RunReport) {
    let mut counts: BTreeMap<&MediaPath, usize> = BTreeMap::new();
    for asset in &inventory.assets {
        *counts.entry(&asset.path).or_default() += 1;
    }
    let ambiguous: BTreeSet<MediaPath> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(path, _)| path.clone())
        .collect();
    if ambiguous.is_empty() {
        return;
    }

    inventory.assets.retain(|asset| {
        if !ambiguous.contains(&asset.path) {
            return true;
        }
        let error = EngineError::io(
            &asset.absolute,
            std::io::Error::other(format!(
                "{} differs only in letter case from another file",
                asset.relative
            )),
        );
        record(report, &error);
        false
    });
    inventory.ambiguous = ambiguous;
}

fn record(report: &mut RunReport, error: &EngineError) {
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(code = error.error_code(), error = %error, "Item failure recorded")
        }
        LogLevel::Warn => {
            tracing::warn!(code = error.error_code(), error = %error, "Item failure recorded")
        }
        LogLevel::Error => {
            tracing::error!(code = error.error_code(), error = %error, "Item failure recorded")
        }
    }
    if let Some(failure) = error.to_failure() {
        report.record(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_relative_strips_prefix() {
        assert_eq!(world_relative("worlds/w", "worlds/w/data/scenes.db"), "data/scenes.db");
        assert_eq!(world_relative("", "data/scenes.db"), "data/scenes.db");
        assert_eq!(world_relative("worlds/w", "other/x.json"), "other/x.json");
    }

    #[test]
    fn cancellation_marks_the_report() {
        let cancel = CancellationToken::new();
        let mut report = RunReport::default();
        assert!(!stop_requested(&cancel, &mut report, "hash"));
        cancel.cancel();
        assert!(stop_requested(&cancel, &mut report, "hash"));
        assert!(report.cancelled);
    }
}
