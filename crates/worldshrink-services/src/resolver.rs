//! Asset Resolver
//!
//! Groups hashed assets by content, chooses one canonical member and one output path per
//! group, and binds every referenced path to the output its references should end up at.

use std::collections::{BTreeMap, BTreeSet};
use worldshrink_core::models::{replace_extension, with_stem_suffix};
use worldshrink_core::{
    AssetRecord, ContentFingerprint, DedupGroup, EngineError, MediaPath, OutputAction,
    OutputTarget, Redirect, RedirectPlan, ReferenceSite, TargetCodec,
};

const MODULES_SEGMENT: &str = "modules";
const WORLDS_SEGMENT: &str = "worlds";

#[derive(Debug, Default)]
pub struct Resolution {
    /// Ordered by canonical path
    pub groups: Vec<DedupGroup>,
    pub plan: RedirectPlan,
    /// Group index of every hashed asset
    pub group_of: BTreeMap<MediaPath, usize>,
    /// Assets no reference site is bound to
    pub unreferenced: BTreeSet<MediaPath>,
    /// References bound through the `modules/` to `worlds/` repair
    pub repaired: usize,
    /// One `MissingAsset` per site whose target does not exist
    pub failures: Vec<EngineError>,
}

impl Resolution {
    pub fn group_for(&self, path: &MediaPath) -> Option<&DedupGroup> {
        self.group_of.get(path).map(|index| &self.groups[*index])
    }
}

pub struct AssetResolver {
    target: TargetCodec,
    repair_module_paths: bool,
}

impl AssetResolver {
    pub fn new(target: TargetCodec, repair_module_paths: bool) -> Self {
        Self {
            target,
            repair_module_paths,
        }
    }

    /// Build dedup groups and the redirect plan.
    ///
    /// `on_disk` holds every file in the world, media or not; outputs are never planned
    /// over a file that exists unless that file is already the output.
    #[tracing::instrument(skip_all, fields(stage = "resolve", assets = assets.len(), sites = sites.len()))]
    pub fn resolve(
        &self,
        assets: &[AssetRecord],
        on_disk: &BTreeSet<MediaPath>,
        sites: &[ReferenceSite],
    ) -> Resolution {
        let by_path: BTreeMap<&MediaPath, &AssetRecord> =
            assets.iter().map(|asset| (&asset.path, asset)).collect();

        let referenced: BTreeSet<&MediaPath> = sites
            .iter()
            .filter_map(|site| self.bind(&site.target, &by_path))
            .map(|asset| &asset.path)
            .collect();

        let mut resolution = Resolution::default();
        self.build_groups(assets, &by_path, on_disk, &referenced, &mut resolution);
        self.build_plan(sites, &by_path, &mut resolution);

        let bound: BTreeSet<&MediaPath> = resolution
            .plan
            .entries()
            .map(|(_, redirect)| &redirect.asset)
            .collect();
        resolution.unreferenced = assets
            .iter()
            .filter(|asset| !bound.contains(&asset.path))
            .map(|asset| asset.path.clone())
            .collect();

        tracing::info!(
            groups = resolution.groups.len(),
            duplicate_groups = resolution.groups.iter().filter(|g| g.is_duplicate_group()).count(),
            redirects = resolution.plan.len(),
            missing = resolution.plan.missing().count(),
            repaired = resolution.repaired,
            unreferenced = resolution.unreferenced.len(),
            "Resolution complete"
        );

        resolution
    }

    fn build_groups(
        &self,
        assets: &[AssetRecord],
        by_path: &BTreeMap<&MediaPath, &AssetRecord>,
        on_disk: &BTreeSet<MediaPath>,
        referenced: &BTreeSet<&MediaPath>,
        resolution: &mut Resolution,
    ) {
        let mut by_fingerprint: BTreeMap<ContentFingerprint, Vec<&AssetRecord>> = BTreeMap::new();
        for asset in assets {
            if let Some(fingerprint) = asset.fingerprint {
                by_fingerprint.entry(fingerprint).or_default().push(asset);
            }
        }

        let mut pending: Vec<(ContentFingerprint, &AssetRecord, Vec<MediaPath>)> = by_fingerprint
            .into_iter()
            .filter_map(|(fingerprint, members)| {
                let canonical = *members
                    .iter()
                    .min_by(|a, b| canonical_order(&a.path, &b.path))?;
                let mut paths: Vec<MediaPath> = members.iter().map(|m| m.path.clone()).collect();
                paths.sort();
                Some((fingerprint, canonical, paths))
            })
            .collect();
        pending.sort_by(|a, b| a.1.path.cmp(&b.1.path));
        let canonicals: BTreeSet<&MediaPath> = pending.iter().map(|p| &p.1.path).collect();

        let mut claimed = BTreeSet::new();
        for (fingerprint, canonical, members) in &pending {
            let (fingerprint, canonical) = (*fingerprint, *canonical);
            let adoptable = |path: &MediaPath| {
                !canonicals.contains(path) || !members.iter().any(|m| referenced.contains(m))
            };
            let output = self.select_output(
                fingerprint,
                canonical,
                by_path,
                on_disk,
                &adoptable,
                &mut claimed,
            );
            let index = resolution.groups.len();
            for member in members {
                resolution.group_of.insert(member.clone(), index);
            }
            tracing::debug!(
                canonical = %canonical.path,
                members = members.len(),
                output = %output.path,
                action = ?output.action,
                "Dedup group"
            );
            resolution.groups.push(DedupGroup {
                fingerprint,
                canonical: canonical.path.clone(),
                members: members.clone(),
                output,
            });
        }
    }

    /// `adoptable` decides whether existing target content at the preferred path may stand
    /// in for this group. Another group's canonical only qualifies when nothing references
    /// this group, so no document ever switches to different pixels.
    fn select_output(
        &self,
        fingerprint: ContentFingerprint,
        canonical: &AssetRecord,
        by_path: &BTreeMap<&MediaPath, &AssetRecord>,
        on_disk: &BTreeSet<MediaPath>,
        adoptable: &dyn Fn(&MediaPath) -> bool,
        claimed: &mut BTreeSet<MediaPath>,
    ) -> OutputTarget {
        let format = self.target.format();
        let ext = self.target.extension();
        let is_target_asset = |path: &MediaPath| {
            by_path
                .get(path)
                .is_some_and(|asset| asset.is_format(format))
        };

        if canonical.is_format(format) && canonical.path.extension() == Some(ext) {
            return OutputTarget {
                path: canonical.path.clone(),
                relative: canonical.relative.clone(),
                absolute: canonical.absolute.clone(),
                action: OutputAction::Reuse,
            };
        }

        let produce = if canonical.is_format(format) {
            OutputAction::Copy
        } else {
            OutputAction::Encode
        };
        let preferred = replace_extension(&canonical.relative, ext);
        let derived = with_stem_suffix(&canonical.relative, &format!("-{}", fingerprint.short()), ext);

        let preferred_path = MediaPath::parse(&preferred);
        let derived_path = MediaPath::parse(&derived);
        let unclaimed =
            |path: &Option<MediaPath>| path.as_ref().is_some_and(|p| !claimed.contains(p));
        let free = |path: &Option<MediaPath>| path.as_ref().is_some_and(|p| !on_disk.contains(p));
        let target_asset = |path: &Option<MediaPath>| path.as_ref().is_some_and(is_target_asset);
        let adopt = |path: &Option<MediaPath>| path.as_ref().is_some_and(|p| adoptable(p));

        let decision = if target_asset(&derived_path) {
            Some((derived.as_str(), OutputAction::Existing))
        } else if unclaimed(&preferred_path)
            && target_asset(&preferred_path)
            && adopt(&preferred_path)
        {
            Some((preferred.as_str(), OutputAction::Existing))
        } else if unclaimed(&preferred_path) && free(&preferred_path) {
            Some((preferred.as_str(), produce))
        } else if unclaimed(&derived_path) && free(&derived_path) {
            Some((derived.as_str(), produce))
        } else {
            None
        };

        let chosen = decision.and_then(|(relative, action)| {
            let path = MediaPath::parse(relative)?;
            claimed.insert(path.clone());
            Some(OutputTarget {
                path,
                relative: relative.to_string(),
                absolute: sibling(canonical, relative),
                action,
            })
        });
        chosen.unwrap_or_else(|| {
            tracing::warn!(
                canonical = %canonical.path,
                preferred = %preferred,
                "No free output path for group"
            );
            OutputTarget {
                path: preferred_path.unwrap_or_else(|| canonical.path.clone()),
                relative: preferred.clone(),
                absolute: sibling(canonical, &preferred),
                action: OutputAction::Blocked,
            }
        })
    }

    fn build_plan(
        &self,
        sites: &[ReferenceSite],
        by_path: &BTreeMap<&MediaPath, &AssetRecord>,
        resolution: &mut Resolution,
    ) {
        let mut referenced: BTreeMap<&MediaPath, Vec<&ReferenceSite>> = BTreeMap::new();
        for site in sites {
            referenced.entry(&site.target).or_default().push(site);
        }

        for (target, sites_for_target) in referenced {
            let Some(asset) = self.bind(target, by_path) else {
                for site in &sites_for_target {
                    tracing::warn!(
                        document = %site.document,
                        locator = %site.locator,
                        raw = %site.raw,
                        "Referenced asset is missing"
                    );
                    resolution.failures.push(EngineError::MissingAsset {
                        document: site.document.to_string(),
                        raw_path: site.raw.clone(),
                    });
                }
                resolution.plan.mark_missing(target.clone());
                continue;
            };

            if asset.path != *target {
                resolution.repaired += sites_for_target.len();
                tracing::info!(from = %target, to = %asset.path, "Repaired module path reference");
            }

            let redirect = match resolution.group_of.get(&asset.path) {
                Some(index) => {
                    let output = &resolution.groups[*index].output;
                    Redirect {
                        asset: asset.path.clone(),
                        target: output.path.clone(),
                        reference: output.relative.clone(),
                        group: Some(*index),
                        confirmed: false,
                    }
                }
                // Not hashed: references stay on the asset itself.
                None => Redirect {
                    asset: asset.path.clone(),
                    target: asset.path.clone(),
                    reference: asset.relative.clone(),
                    group: None,
                    confirmed: true,
                },
            };
            resolution.plan.insert(target.clone(), redirect);
        }
    }

    fn bind<'a>(
        &self,
        target: &MediaPath,
        by_path: &BTreeMap<&MediaPath, &'a AssetRecord>,
    ) -> Option<&'a AssetRecord> {
        if let Some(asset) = by_path.get(target).copied() {
            return Some(asset);
        }
        by_path.get(&self.repair(target)?).copied()
    }

    /// The `worlds/` path a broken `modules/` reference is repaired to, when repair is on.
    pub fn repair(&self, target: &MediaPath) -> Option<MediaPath> {
        if self.repair_module_paths && target.starts_with_segment(MODULES_SEGMENT) {
            target.with_first_segment(WORLDS_SEGMENT)
        } else {
            None
        }
    }
}

/// Shortest path first, then lexicographic.
fn canonical_order(a: &MediaPath, b: &MediaPath) -> std::cmp::Ordering {
    a.as_str()
        .len()
        .cmp(&b.as_str().len())
        .then_with(|| a.cmp(b))
}

fn sibling(canonical: &AssetRecord, relative: &str) -> std::path::PathBuf {
    let file_name = relative.rsplit('/').next().unwrap_or(relative);
    canonical.absolute.with_file_name(file_name)
}
