use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use worldshrink_core::{AssetRecord, DedupGroup, EngineError, MediaPath};
use worldshrink_storage::WorldStorage;

/// What the collector needs to know about the finished run
pub struct GcInput<'a> {
    pub assets: &'a [AssetRecord],
    pub groups: &'a [DedupGroup],
    /// Whether each group's output was confirmed on disk, indexed like `groups`
    pub confirmed: &'a [bool],
    /// Assets still referenced after rewriting
    pub survivors: &'a BTreeSet<MediaPath>,
    /// Paths mentioned by documents that were not rewritten
    pub pinned: &'a BTreeSet<MediaPath>,
}

#[derive(Debug, Default)]
pub struct GcOutcome {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub deleted: Vec<MediaPath>,
    /// Files removed when the trash was purged
    pub purged: usize,
    pub failures: Vec<EngineError>,
}

#[derive(Clone)]
pub struct GarbageCollector {
    storage: Arc<dyn WorldStorage>,
    purge_trash: bool,
}

impl GarbageCollector {
    pub fn new(storage: Arc<dyn WorldStorage>, purge_trash: bool) -> Self {
        Self {
            storage,
            purge_trash,
        }
    }

    /// Assets nothing points at whose group has a confirmed replacement.
    pub fn candidates<'a>(input: &GcInput<'a>) -> Vec<&'a AssetRecord> {
        let outputs: BTreeSet<&MediaPath> = input.groups.iter().map(|g| &g.output.path).collect();
        let mut group_of: BTreeMap<&MediaPath, usize> = BTreeMap::new();
        for (index, group) in input.groups.iter().enumerate() {
            for member in &group.members {
                group_of.insert(member, index);
            }
        }

        input
            .assets
            .iter()
            .filter(|asset| {
                let Some(index) = group_of.get(&asset.path) else {
                    return false;
                };
                input.confirmed.get(*index).copied().unwrap_or(false)
                    && !outputs.contains(&asset.path)
                    && !input.survivors.contains(&asset.path)
                    && !input.pinned.contains(&asset.path)
            })
            .collect()
    }

    /// Move every candidate to the trash, then purge it when configured to.
    #[tracing::instrument(skip_all, fields(stage = "gc"))]
    pub async fn collect(&self, input: GcInput<'_>) -> GcOutcome {
        let mut outcome = GcOutcome::default();
        let candidates = Self::candidates(&input);
        let mut verified: BTreeMap<usize, bool> = BTreeMap::new();

        for asset in candidates {
            let Some(index) = input.groups.iter().position(|g| g.members.contains(&asset.path))
            else {
                continue;
            };
            let group = &input.groups[index];

            let replacement_present = match verified.get(&index) {
                Some(present) => *present,
                None => {
                    let present = self
                        .storage
                        .exists(&group.output.relative)
                        .await
                        .unwrap_or(false);
                    verified.insert(index, present);
                    present
                }
            };
            if !replacement_present {
                tracing::warn!(
                    path = %asset.path,
                    output = %group.output.path,
                    "Replacement missing on disk, keeping original"
                );
                continue;
            }

            match self.storage.move_to_trash(&asset.relative).await {
                Ok(trashed) => {
                    tracing::info!(
                        path = %asset.path,
                        trashed = %trashed.display(),
                        size_bytes = asset.size,
                        "Moved unreferenced asset to trash"
                    );
                    outcome.files_deleted += 1;
                    outcome.bytes_freed += asset.size;
                    outcome.deleted.push(asset.path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %asset.path, error = %e, "Failed to move asset to trash");
                    outcome.failures.push(e.into_engine(&asset.absolute));
                }
            }
        }

        if self.purge_trash && outcome.files_deleted > 0 {
            match self.storage.purge_trash().await {
                Ok(count) => outcome.purged = count,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to purge trash");
                    outcome
                        .failures
                        .push(e.into_engine(self.storage.world_root()));
                }
            }
        }

        tracing::info!(
            deleted = outcome.files_deleted,
            bytes_freed = outcome.bytes_freed,
            purged = outcome.purged,
            failed = outcome.failures.len(),
            "Cleanup completed"
        );

        outcome
    }
}
