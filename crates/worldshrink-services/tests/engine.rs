use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use worldshrink_core::{DocumentId, EngineConfig, EngineError, FailureKind, RunReport, TargetCodec};
use worldshrink_services::{
    run, scan_only, CodecError, CodecInvoker, DocumentKind, Engine, LocalWorldStorage,
    MediaMatcher, ReferenceScanner, RestoreSummary, WorldStorage,
};
use worldshrink_storage::{fingerprint_bytes, FileEntry, StorageError, StorageResult};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const WEBP_HEADER: &[u8] = b"RIFF\0\0\0\0WEBPVP8 ";

/// Writes a WebP-signed copy of its input.
struct FakeCodec {
    calls: AtomicUsize,
}

impl FakeCodec {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CodecInvoker for FakeCodec {
    async fn encode(&self, input: &Path, output: &Path) -> Result<(), CodecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut data = WEBP_HEADER.to_vec();
        data.extend(std::fs::read(input).map_err(|e| CodecError::InvalidOutput(e.to_string()))?);
        std::fs::write(output, data).map_err(|e| CodecError::InvalidOutput(e.to_string()))
    }

    fn target(&self) -> TargetCodec {
        TargetCodec::WebP
    }

    async fn check_available(&self) -> Result<(), CodecError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct FailingCodec {
    available: bool,
}

#[async_trait]
impl CodecInvoker for FailingCodec {
    async fn encode(&self, _input: &Path, _output: &Path) -> Result<(), CodecError> {
        Err(CodecError::Failed {
            status: "exit status: 1".to_string(),
            stderr: "unsupported input".to_string(),
        })
    }

    fn target(&self) -> TargetCodec {
        TargetCodec::WebP
    }

    async fn check_available(&self) -> Result<(), CodecError> {
        if self.available {
            Ok(())
        } else {
            Err(CodecError::Unavailable {
                program: "failing".to_string(),
                reason: "not installed".to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Local storage that can refuse document writes and reads of chosen keys.
struct FaultyStorage {
    inner: LocalWorldStorage,
    read_only: bool,
    unreadable: Vec<&'static str>,
}

impl FaultyStorage {
    fn read_only(cfg: &EngineConfig) -> Self {
        Self {
            inner: LocalWorldStorage::from_config(cfg).unwrap(),
            read_only: true,
            unreadable: Vec::new(),
        }
    }

    fn unreadable(cfg: &EngineConfig, suffixes: &[&'static str]) -> Self {
        Self {
            inner: LocalWorldStorage::from_config(cfg).unwrap(),
            read_only: false,
            unreadable: suffixes.to_vec(),
        }
    }
}

#[async_trait]
impl WorldStorage for FaultyStorage {
    fn reference_root(&self) -> &Path {
        self.inner.reference_root()
    }

    fn world_root(&self) -> &Path {
        self.inner.world_root()
    }

    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        self.inner.key_to_path(key)
    }

    async fn list_world(&self) -> StorageResult<Vec<FileEntry>> {
        self.inner.list_world().await
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        if self.unreadable.iter().any(|suffix| key.ends_with(suffix)) {
            return Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            )));
        }
        self.inner.read(key).await
    }

    async fn write_atomic(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::WriteFailed(key.to_string()));
        }
        self.inner.write_atomic(key, data).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn stage(&self, key: &str, suffix: &str) -> StorageResult<tempfile::TempPath> {
        self.inner.stage(key, suffix).await
    }

    async fn commit(&self, staged: tempfile::TempPath, key: &str) -> StorageResult<()> {
        self.inner.commit(staged, key).await
    }

    async fn move_to_trash(&self, key: &str) -> StorageResult<PathBuf> {
        self.inner.move_to_trash(key).await
    }

    async fn purge_trash(&self) -> StorageResult<usize> {
        self.inner.purge_trash().await
    }

    async fn restore_trash(&self) -> StorageResult<RestoreSummary> {
        self.inner.restore_trash().await
    }
}

fn png(tag: &str) -> Vec<u8> {
    let mut data = PNG_MAGIC.to_vec();
    data.extend_from_slice(tag.as_bytes());
    data
}

fn write(root: &Path, relative: &str, data: impl AsRef<[u8]>) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

fn read(root: &Path, relative: &str) -> String {
    std::fs::read_to_string(root.join(relative)).unwrap()
}

/// a.png and b.png share bytes; scene1 points at a.png, scene2 at b.png; c.png is unreferenced.
fn scenario_world() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "a.png", png("same"));
    write(root, "b.png", png("same"));
    write(root, "c.png", png("other"));
    write(root, "scenes/scene1.json", r#"{"name": "Scene 1", "background": "a.png"}"#);
    write(root, "scenes/scene2.json", r#"{"name": "Scene 2", "token": {"img": "b.png"}}"#);
    dir
}

fn config(root: &Path, delete_unreferenced: bool) -> EngineConfig {
    let mut config = EngineConfig::for_world(root);
    config.max_workers = 2;
    config.delete_unreferenced = delete_unreferenced;
    config
}

async fn run_with(config: &EngineConfig, codec: Arc<dyn CodecInvoker>) -> RunReport {
    run(config, codec, CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn duplicates_merge_into_one_canonical_output() {
    let dir = scenario_world();
    let root = dir.path();

    let report = run_with(&config(root, true), FakeCodec::new()).await;

    assert_eq!(
        read(root, "scenes/scene1.json"),
        r#"{"name": "Scene 1", "background": "a.webp"}"#
    );
    assert_eq!(
        read(root, "scenes/scene2.json"),
        r#"{"name": "Scene 2", "token": {"img": "a.webp"}}"#
    );
    assert!(root.join("a.webp").exists());
    assert!(root.join("c.webp").exists());
    assert!(!root.join("b.png").exists());
    assert!(!root.join("a.png").exists());
    assert!(!root.join("c.png").exists());
    assert!(!root.join("_trash").exists());

    assert_eq!(report.assets_hashed, 3);
    assert_eq!(report.duplicate_groups, 1);
    assert_eq!(report.duplicates_merged, 1);
    assert_eq!(report.assets_transcoded, 2);
    assert_eq!(report.references_rewritten, 2);
    assert_eq!(report.documents_rewritten, 2);
    assert_eq!(report.files_deleted, 3);
    assert!(report.is_clean());
}

#[tokio::test]
async fn unreferenced_files_stay_without_opt_in() {
    let dir = scenario_world();
    let root = dir.path();

    let report = run_with(&config(root, false), FakeCodec::new()).await;

    assert!(root.join("c.png").exists());
    assert!(root.join("c.webp").exists());
    assert!(root.join("b.png").exists());
    assert_eq!(report.files_deleted, 0);
    assert_eq!(report.gc_skipped_reason.as_deref(), Some("deletion not enabled"));
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let dir = scenario_world();
    let root = dir.path();
    let cfg = config(root, false);

    run_with(&cfg, FakeCodec::new()).await;
    let scene1 = read(root, "scenes/scene1.json");

    let codec = FakeCodec::new();
    let second = run_with(&cfg, codec.clone()).await;

    assert_eq!(second.assets_transcoded, 0);
    assert_eq!(second.references_rewritten, 0);
    assert_eq!(second.documents_rewritten, 0);
    assert_eq!(codec.calls.load(Ordering::SeqCst), 0);
    assert_eq!(read(root, "scenes/scene1.json"), scene1);
}

#[tokio::test]
async fn second_run_after_deletion_changes_nothing() {
    let dir = scenario_world();
    let cfg = config(dir.path(), true);

    run_with(&cfg, FakeCodec::new()).await;
    let second = run_with(&cfg, FakeCodec::new()).await;

    assert_eq!(second.assets_transcoded, 0);
    assert_eq!(second.assets_skipped, 2);
    assert_eq!(second.references_rewritten, 0);
    assert_eq!(second.files_deleted, 0);
}

#[tokio::test]
async fn rescanned_references_point_at_group_outputs() {
    let dir = scenario_world();
    let root = dir.path();
    run_with(&config(root, false), FakeCodec::new()).await;

    let storage = Arc::new(LocalWorldStorage::new(root, root, "_trash").unwrap());
    let exts: Vec<String> = ["png", "jpg", "jpeg", "webp"].iter().map(|s| s.to_string()).collect();
    let scanner = ReferenceScanner::new(storage, MediaMatcher::new(exts.clone()), &exts, 1).unwrap();

    for doc in ["scenes/scene1.json", "scenes/scene2.json"] {
        let bytes = std::fs::read(root.join(doc)).unwrap();
        let found = scanner
            .extract(&DocumentId::new(doc), &bytes, DocumentKind::Json)
            .unwrap();
        assert_eq!(found.sites.len(), 1);
        assert_eq!(found.sites[0].target.as_str(), "a.webp");
    }
}

#[tokio::test]
async fn failed_transcode_leaves_references_and_files_alone() {
    let dir = scenario_world();
    let root = dir.path();
    let scene2 = read(root, "scenes/scene2.json");

    let report = run_with(&config(root, true), Arc::new(FailingCodec { available: true })).await;

    assert_eq!(read(root, "scenes/scene2.json"), scene2);
    assert!(root.join("a.png").exists());
    assert!(root.join("b.png").exists());
    assert!(root.join("c.png").exists());
    assert!(!root.join("a.webp").exists());
    assert_eq!(report.assets_failed, 2);
    assert_eq!(report.references_rewritten, 0);
    assert_eq!(report.references_skipped, 2);
    assert_eq!(report.files_deleted, 0);
    assert_eq!(report.failures_of(FailureKind::Codec).count(), 2);
}

#[tokio::test]
async fn unusable_codec_aborts_before_touching_the_world() {
    let dir = scenario_world();
    let err = run(
        &config(dir.path(), true),
        Arc::new(FailingCodec { available: false }),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::CodecUnavailable(_)));
}

#[tokio::test]
async fn missing_world_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = run(
        &config(&dir.path().join("nope"), false),
        FakeCodec::new(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::WorldRootMissing(_)));
}

#[tokio::test]
async fn write_failure_blocks_all_deletion() {
    let dir = scenario_world();
    let root = dir.path();
    let cfg = config(root, true);
    let storage = FaultyStorage::read_only(&cfg);

    let report = Engine::with_storage(cfg, Arc::new(storage))
        .run(FakeCodec::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.references_failed, 2);
    assert_eq!(report.files_deleted, 0);
    assert!(report.gc_skipped_reason.is_some());
    assert_eq!(report.failures_of(FailureKind::Write).count(), 2);
    assert!(root.join("b.png").exists());
    assert!(root.join("c.png").exists());
}

#[tokio::test]
async fn unreadable_document_blocks_all_deletion() {
    let dir = scenario_world();
    let root = dir.path();
    let cfg = config(root, true);
    let storage = FaultyStorage::unreadable(&cfg, &["scene2.json"]);

    let report = Engine::with_storage(cfg, Arc::new(storage))
        .run(FakeCodec::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.files_deleted, 0);
    assert!(report
        .gc_skipped_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("could not be read")));
    assert_eq!(report.failures_of(FailureKind::Io).count(), 1);
    assert!(root.join("b.png").exists());
    assert!(root.join("c.png").exists());
    assert_eq!(read(root, "scenes/scene2.json"), r#"{"name": "Scene 2", "token": {"img": "b.png"}}"#);
}

#[tokio::test]
async fn unreadable_settings_database_blocks_all_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "logo.png", png("logo"));
    write(root, "data/settings.db", "{\"key\":\"core.logo\",\"value\":\"logo.png\"}\n");
    let cfg = config(root, true);
    let storage = FaultyStorage::unreadable(&cfg, &["settings.db"]);

    let report = Engine::with_storage(cfg, Arc::new(storage))
        .run(FakeCodec::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.files_deleted, 0);
    assert!(report.gc_skipped_reason.is_some());
    assert_eq!(report.failures_of(FailureKind::Io).count(), 1);
    assert!(root.join("logo.png").exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn paths_differing_only_in_case_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "Art.png", png("upper"));
    write(root, "art.png", png("lower"));
    write(root, "s1.json", r#"{"img": "Art.png"}"#);
    write(root, "s2.json", r#"{"img": "art.png"}"#);

    let report = run_with(&config(root, true), FakeCodec::new()).await;

    assert_eq!(read(root, "s1.json"), r#"{"img": "Art.png"}"#);
    assert_eq!(read(root, "s2.json"), r#"{"img": "art.png"}"#);
    assert!(root.join("Art.png").exists());
    assert!(root.join("art.png").exists());
    assert_eq!(report.files_deleted, 0);
    assert_eq!(report.assets_transcoded, 0);
    assert_eq!(report.references_skipped, 2);
    let collisions: Vec<_> = report
        .failures_of(FailureKind::Io)
        .filter(|failure| failure.message.contains("letter case"))
        .collect();
    assert_eq!(collisions.len(), 2);
}

#[tokio::test]
async fn unrelated_webp_at_the_preferred_path_is_not_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut unrelated = WEBP_HEADER.to_vec();
    unrelated.extend_from_slice(b"unrelated");
    write(root, "a.png", png("a"));
    write(root, "a.webp", &unrelated);
    write(root, "scene.json", r#"{"img": "a.png"}"#);

    let report = run_with(&config(root, true), FakeCodec::new()).await;

    let derived = format!("a-{}.webp", fingerprint_bytes(&png("a")).short());
    assert_eq!(read(root, "scene.json"), format!(r#"{{"img": "{}"}}"#, derived));
    assert!(root.join(&derived).exists());
    assert_eq!(std::fs::read(root.join("a.webp")).unwrap(), unrelated);
    assert!(!root.join("a.png").exists());
    assert_eq!(report.assets_transcoded, 1);
}

#[tokio::test]
async fn missing_asset_is_reported_and_left_as_written() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let doc = r#"{"img": "missing.png", "thumb": "a.png"}"#;
    write(root, "a.png", png("a"));
    write(root, "actor.json", doc);

    let report = run_with(&config(root, false), FakeCodec::new()).await;

    let missing: Vec<_> = report.failures_of(FailureKind::MissingAsset).collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].document.as_deref(), Some("actor.json"));
    assert_eq!(missing[0].path.as_deref(), Some("missing.png"));
    assert_eq!(read(root, "actor.json"), r#"{"img": "missing.png", "thumb": "a.webp"}"#);
    assert_eq!(report.references_skipped, 1);
}

#[tokio::test]
async fn html_sources_and_nedb_records_are_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "art/map.png", png("map"));
    write(
        root,
        "data/journal.db",
        "{\"_id\":\"j1\",\"content\":\"<p>See</p><img src=\\\"art/map.png\\\" width=\\\"300\\\">\"}\n\n{\"_id\":\"j2\",\"img\":\"/art/map.png\"}\n",
    );

    let report = run_with(&config(root, false), FakeCodec::new()).await;

    assert_eq!(report.references_rewritten, 2);
    assert_eq!(
        read(root, "data/journal.db"),
        "{\"_id\":\"j1\",\"content\":\"<p>See</p><img src=\\\"art/map.webp\\\" width=\\\"300\\\">\"}\n\n{\"_id\":\"j2\",\"img\":\"/art/map.webp\"}\n"
    );
}

#[tokio::test]
async fn settings_database_is_never_rewritten_and_protects_its_assets() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "logo.png", png("logo"));
    let settings = "{\"key\":\"core.logo\",\"value\":\"\\\"logo.png\\\"\"}\n";
    write(root, "data/settings.db", settings);

    let report = run_with(&config(root, true), FakeCodec::new()).await;

    assert_eq!(read(root, "data/settings.db"), settings);
    assert!(root.join("logo.png").exists());
    assert_eq!(report.documents_scanned, 0);
}

#[tokio::test]
async fn broken_documents_are_reported_and_pin_their_assets() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "d.png", png("d"));
    write(root, "broken.json", r#"{"img": "d.png", "#);

    let report = run_with(&config(root, true), FakeCodec::new()).await;

    assert_eq!(report.documents_scanned, 1);
    assert_eq!(report.documents_failed, 1);
    assert_eq!(report.failures_of(FailureKind::Parse).count(), 1);
    assert!(root.join("d.png").exists());
    assert_eq!(read(root, "broken.json"), r#"{"img": "d.png", "#);
}

#[tokio::test]
async fn module_paths_are_repaired_in_foundry_layout() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    let world = data.join("worlds").join("w");
    write(&world, "art/a.png", png("a"));
    write(&world, "scenes/s.json", r#"{"img": "modules/w/art/a.png"}"#);

    let cfg = config(&world, false);
    assert_eq!(cfg.reference_root, data);
    let report = run_with(&cfg, FakeCodec::new()).await;

    assert_eq!(report.references_rewritten, 1);
    assert_eq!(read(&world, "scenes/s.json"), r#"{"img": "worlds/w/art/a.webp"}"#);
}

#[tokio::test]
async fn core_data_references_are_external() {
    let dir = tempfile::tempdir().unwrap();
    let world = dir.path().join("world");
    let core = dir.path().join("core");
    write(&core, "icons/svg/chest.png", png("chest"));
    write(&world, "item.json", r#"{"img": "icons/svg/chest.png"}"#);

    let mut cfg = config(&world, false);
    cfg.core_data_root = Some(core);
    let report = run_with(&cfg, FakeCodec::new()).await;

    assert_eq!(report.external_references, 1);
    assert_eq!(report.failures_of(FailureKind::MissingAsset).count(), 0);
    assert_eq!(read(&world, "item.json"), r#"{"img": "icons/svg/chest.png"}"#);
}

#[tokio::test]
async fn cancelled_run_returns_partial_report() {
    let dir = scenario_world();
    let root = dir.path();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = run(&config(root, true), FakeCodec::new(), cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.assets_transcoded, 0);
    assert!(root.join("b.png").exists());
    assert!(!root.join("a.webp").exists());
}

#[tokio::test]
async fn scan_only_reports_without_changing_anything() {
    let dir = scenario_world();
    let root = dir.path();

    let scan = scan_only(&config(root, true), CancellationToken::new()).await.unwrap();

    assert_eq!(scan.report.duplicate_groups, 1);
    assert_eq!(scan.groups.len(), 2);
    assert_eq!(scan.unreferenced.len(), 1);
    assert!(scan.missing.is_empty());
    assert!(!root.join("a.webp").exists());
    assert_eq!(read(root, "scenes/scene2.json"), r#"{"name": "Scene 2", "token": {"img": "b.png"}}"#);
}
