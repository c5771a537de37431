use anyhow::Context;
use serde::Serialize;
use worldshrink_core::{QualityPreset, RunReport, TargetCodec};
use worldshrink_services::{RestoreSummary, ScanReport};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const FAILURE_MESSAGE_LEN: usize = 100;

/// Truncate a string to max_len characters, appending "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CodecArg {
    Webp,
    Avif,
}

impl From<CodecArg> for TargetCodec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Webp => TargetCodec::WebP,
            CodecArg::Avif => TargetCodec::Avif,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QualityArg {
    Normal,
    Better,
    Best,
    Lighter,
    Lightest,
}

impl From<QualityArg> for QualityPreset {
    fn from(arg: QualityArg) -> Self {
        match arg {
            QualityArg::Normal => QualityPreset::Normal,
            QualityArg::Better => QualityPreset::Better,
            QualityArg::Best => QualityPreset::Best,
            QualityArg::Lighter => QualityPreset::Lighter,
            QualityArg::Lightest => QualityPreset::Lightest,
        }
    }
}

/// Initialize tracing for the CLI. Logs go to stderr so stdout stays machine-readable.
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize report")?;
    println!("{}", out);
    Ok(())
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

pub fn print_report_table(report: &RunReport) {
    println!("\n=== Worldshrink Report ===\n");

    if report.cancelled {
        println!("Run was cancelled; counts cover the stages that finished.\n");
    }

    println!("--- Documents ---");
    println!("Scanned:     {:>8}", report.documents_scanned);
    println!("Failed:      {:>8}", report.documents_failed);
    println!("Rewritten:   {:>8}", report.documents_rewritten);

    println!("\n--- References ---");
    println!("Sites:       {:>8}", report.reference_sites);
    println!("External:    {:>8}", report.external_references);
    println!("Rewritten:   {:>8}", report.references_rewritten);
    println!("Skipped:     {:>8}", report.references_skipped);
    println!("Failed:      {:>8}", report.references_failed);

    println!("\n--- Assets ---");
    println!("Hashed:      {:>8}", report.assets_hashed);
    println!("Dup groups:  {:>8}", report.duplicate_groups);
    println!("Merged:      {:>8}", report.duplicates_merged);
    println!("Transcoded:  {:>8}", report.assets_transcoded);
    println!("Skipped:     {:>8}", report.assets_skipped);
    println!("Failed:      {:>8}", report.assets_failed);

    println!("\n--- Cleanup ---");
    match &report.gc_skipped_reason {
        Some(reason) => println!("Skipped: {}", reason),
        None => {
            println!("Deleted:     {:>8}", report.files_deleted);
            println!("Freed:       {:>8.2} MB", mb(report.bytes_before));
        }
    }
    println!("Written:     {:>8.2} MB", mb(report.bytes_after));

    print_failures(report);
}

fn print_failures(report: &RunReport) {
    if report.failures.is_empty() {
        return;
    }
    println!("\n--- Failures ({}) ---", report.failures.len());
    for failure in &report.failures {
        let location = match (&failure.document, &failure.path) {
            (Some(document), Some(path)) => format!("{} -> {}", document, path),
            (Some(document), None) => document.clone(),
            (None, Some(path)) => path.clone(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{:<14} {}: {}",
            format!("{:?}", failure.kind),
            location,
            truncate_string(&failure.message, FAILURE_MESSAGE_LEN)
        );
    }
}

pub fn print_scan_table(scan: &ScanReport) {
    println!("\n=== Worldshrink Scan ===\n");
    println!("Documents:   {:>8}", scan.report.documents_scanned);
    println!("Failed:      {:>8}", scan.report.documents_failed);
    println!("Sites:       {:>8}", scan.report.reference_sites);
    println!("Assets:      {:>8}", scan.report.assets_hashed);

    let duplicates: Vec<_> = scan.groups.iter().filter(|g| g.is_duplicate_group()).collect();
    println!("\n--- Duplicate groups ({}) ---", duplicates.len());
    for group in duplicates {
        println!("{} -> {} ({:?})", group.canonical, group.output.path, group.output.action);
        for member in group.duplicates() {
            println!("    {}", member);
        }
    }

    if !scan.missing.is_empty() {
        println!("\n--- Missing ({}) ---", scan.missing.len());
        for path in &scan.missing {
            println!("{}", path);
        }
    }

    println!("\n--- Unreferenced ({}) ---", scan.unreferenced.len());
    for path in &scan.unreferenced {
        println!("{}", path);
    }

    print_failures(&scan.report);
}

pub fn print_restore(summary: &RestoreSummary) {
    println!("Restored: {}", summary.restored);
    if summary.skipped > 0 {
        println!(
            "Left in trash (original location occupied): {}",
            summary.skipped
        );
    }
}
