use super::{ContentFingerprint, MediaPath};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// How a group's canonical output comes to exist on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputAction {
    /// The canonical asset is already its own output
    Reuse,
    /// Another file already holds target-codec content at the output path
    Existing,
    /// Run the external codec
    Encode,
    /// Canonical content is already the target codec under a different extension
    Copy,
    /// The output path is occupied by a file that is not target-codec content
    Blocked,
}

impl OutputAction {
    /// Whether this action produces a new file during the run.
    pub fn writes(self) -> bool {
        matches!(self, OutputAction::Encode | OutputAction::Copy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputTarget {
    pub path: MediaPath,
    pub relative: String,
    #[serde(skip)]
    pub absolute: PathBuf,
    pub action: OutputAction,
}

/// Files sharing one fingerprint, with the canonical representative.
#[derive(Debug, Clone, Serialize)]
pub struct DedupGroup {
    pub fingerprint: ContentFingerprint,
    pub canonical: MediaPath,
    /// Every member, canonical included, in path order
    pub members: Vec<MediaPath>,
    pub output: OutputTarget,
}

impl DedupGroup {
    pub fn duplicates(&self) -> impl Iterator<Item = &MediaPath> {
        self.members.iter().filter(move |m| **m != self.canonical)
    }

    pub fn is_duplicate_group(&self) -> bool {
        self.members.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    /// Asset the referenced path is bound to (differs from the key after repair)
    pub asset: MediaPath,
    /// Final path references should point at
    pub target: MediaPath,
    /// Text written into documents for `target`
    pub reference: String,
    /// Dedup group producing `target`, `None` for assets that could not be hashed
    pub group: Option<usize>,
    /// Set once `target` is known to exist on disk
    pub confirmed: bool,
}

/// Mapping from every referenced path to where its references should point.
///
/// Referenced paths that resolve to no asset are tracked in `missing` instead of
/// receiving an entry; every referenced path is in exactly one of the two.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RedirectPlan {
    entries: BTreeMap<MediaPath, Redirect>,
    missing: BTreeSet<MediaPath>,
}

impl RedirectPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: MediaPath, redirect: Redirect) {
        self.missing.remove(&from);
        self.entries.insert(from, redirect);
    }

    pub fn mark_missing(&mut self, path: MediaPath) {
        if !self.entries.contains_key(&path) {
            self.missing.insert(path);
        }
    }

    pub fn get(&self, path: &MediaPath) -> Option<&Redirect> {
        self.entries.get(path)
    }

    pub fn is_missing(&self, path: &MediaPath) -> bool {
        self.missing.contains(path)
    }

    pub fn covers(&self, path: &MediaPath) -> bool {
        self.entries.contains_key(path) || self.missing.contains(path)
    }

    /// Confirm every redirect into `group`.
    pub fn confirm(&mut self, group: usize) {
        self.set_confirmed(group, true);
    }

    /// Withdraw every redirect into `group`; references to it stay as written.
    pub fn retract(&mut self, group: usize) {
        self.set_confirmed(group, false);
    }

    fn set_confirmed(&mut self, group: usize, confirmed: bool) {
        for redirect in self.entries.values_mut() {
            if redirect.group == Some(group) {
                redirect.confirmed = confirmed;
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&MediaPath, &Redirect)> {
        self.entries.iter()
    }

    pub fn missing(&self) -> impl Iterator<Item = &MediaPath> {
        self.missing.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(s: &str) -> MediaPath {
        MediaPath::parse(s).unwrap()
    }

    fn redirect(asset: &str, target: &str, group: usize) -> Redirect {
        Redirect {
            asset: mp(asset),
            target: mp(target),
            reference: target.to_string(),
            group: Some(group),
            confirmed: false,
        }
    }

    #[test]
    fn confirm_and_retract_follow_group() {
        let mut plan = RedirectPlan::new();
        plan.insert(mp("w/a.png"), redirect("w/a.png", "w/a.webp", 0));
        plan.insert(mp("w/b.png"), redirect("w/b.png", "w/a.webp", 0));
        plan.insert(mp("w/c.png"), redirect("w/c.png", "w/c.webp", 1));

        plan.confirm(0);
        assert!(plan.get(&mp("w/a.png")).unwrap().confirmed);
        assert!(plan.get(&mp("w/b.png")).unwrap().confirmed);
        assert!(!plan.get(&mp("w/c.png")).unwrap().confirmed);

        plan.retract(0);
        assert!(!plan.get(&mp("w/b.png")).unwrap().confirmed);
    }

    #[test]
    fn missing_and_entries_are_disjoint() {
        let mut plan = RedirectPlan::new();
        plan.mark_missing(mp("w/gone.png"));
        assert!(plan.is_missing(&mp("w/gone.png")));
        assert!(plan.covers(&mp("w/gone.png")));

        plan.insert(mp("w/gone.png"), redirect("w/gone.png", "w/gone.webp", 0));
        assert!(!plan.is_missing(&mp("w/gone.png")));

        plan.mark_missing(mp("w/gone.png"));
        assert!(!plan.is_missing(&mp("w/gone.png")));
        assert_eq!(plan.missing().count(), 0);
    }
}
