use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Io,
    Codec,
    Parse,
    MissingAsset,
    Write,
}

/// One skipped or failed item, with enough identity to diagnose and rerun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    pub message: String,
}

/// Outcome of one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub documents_scanned: usize,
    pub documents_failed: usize,
    pub reference_sites: usize,
    pub external_references: usize,
    pub assets_hashed: usize,
    pub duplicate_groups: usize,
    pub duplicates_merged: usize,
    pub assets_transcoded: usize,
    pub assets_skipped: usize,
    pub assets_failed: usize,
    pub references_rewritten: usize,
    pub references_skipped: usize,
    pub references_failed: usize,
    pub documents_rewritten: usize,
    pub files_deleted: usize,
    /// Bytes of deleted originals
    pub bytes_before: u64,
    /// Bytes of outputs written this run
    pub bytes_after: u64,
    pub failures: Vec<ItemFailure>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gc_skipped_reason: Option<String>,
}

impl RunReport {
    pub fn record(&mut self, failure: ItemFailure) {
        self.failures.push(failure);
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &ItemFailure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }

    pub fn has_write_failures(&self) -> bool {
        self.references_failed > 0 || self.failures_of(FailureKind::Write).next().is_some()
    }

    /// Nothing failed and nothing was left unresolved.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failures_are_detected_from_either_source() {
        let mut report = RunReport::default();
        assert!(!report.has_write_failures());
        assert!(report.is_clean());

        report.record(ItemFailure {
            kind: FailureKind::MissingAsset,
            path: Some("worlds/w/missing.png".to_string()),
            document: Some("data/scenes.db".to_string()),
            message: "referenced file does not exist".to_string(),
        });
        assert!(!report.has_write_failures());
        assert!(!report.is_clean());

        report.record(ItemFailure {
            kind: FailureKind::Write,
            path: None,
            document: Some("data/scenes.db".to_string()),
            message: "permission denied".to_string(),
        });
        assert!(report.has_write_failures());
        assert_eq!(report.failures_of(FailureKind::Write).count(), 1);
    }

    #[test]
    fn serializes_kinds_in_snake_case() {
        let failure = ItemFailure {
            kind: FailureKind::MissingAsset,
            path: None,
            document: Some("a.json".to_string()),
            message: "x".to_string(),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "missing_asset");
        assert!(json.get("path").is_none());
    }
}
