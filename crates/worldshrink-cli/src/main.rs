//! Worldshrink CLI: shrink a world by transcoding and deduplicating its images.
//!
//! Settings come from `WORLDSHRINK_*` environment variables (a `.env` file is honoured);
//! command-line flags override them.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use worldshrink_cli::{
    init_tracing, print_json, print_report_table, print_restore, print_scan_table, CodecArg,
    LogFormat, OutputFormat, QualityArg,
};
use worldshrink_core::{EngineConfig, ErrorMetadata};
use worldshrink_services::{CodecInvoker, CommandCodec, Engine};

#[derive(Parser)]
#[command(name = "worldshrink", version, about = "Transcode and deduplicate images in a world directory")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcode, deduplicate and rewrite references
    Compress {
        #[command(flatten)]
        world: WorldArgs,

        /// Target codec
        #[arg(long, value_enum)]
        codec: Option<CodecArg>,

        /// Quality preset
        #[arg(long, value_enum)]
        quality: Option<QualityArg>,

        /// Codec executable (defaults to ffmpeg on PATH)
        #[arg(long, value_name = "PATH")]
        codec_path: Option<String>,

        /// Argument template for a custom codec, with {input} and {output} placeholders
        #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
        codec_args: Option<String>,

        /// Delete images nothing references once their replacement exists
        #[arg(long)]
        delete_unreferenced: bool,

        /// Leave deleted files in the world's trash directory for `restore-trash`
        #[arg(long)]
        keep_trash: bool,

        /// Leave `modules/...` references that do not resolve as they are
        #[arg(long)]
        no_repair: bool,
    },
    /// Report duplicates, missing and unreferenced images without changing anything
    Scan {
        #[command(flatten)]
        world: WorldArgs,
    },
    /// Move files kept in the trash back where they came from
    RestoreTrash {
        /// World directory
        world: PathBuf,
    },
}

#[derive(Args)]
struct WorldArgs {
    /// World directory (e.g. Data/worlds/my-world)
    world: PathBuf,

    /// Directory document paths are relative to (defaults to the Data folder)
    #[arg(long, value_name = "DIR")]
    reference_root: Option<PathBuf>,

    /// Read-only core data folder whose files are referenced but never changed
    #[arg(long, value_name = "DIR")]
    core_data: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(long)]
    workers: Option<usize>,

    /// Output format: table or json
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
}

impl WorldArgs {
    fn config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = EngineConfig::from_env_for(&self.world)
            .context("Failed to load configuration from environment")?;
        if let Some(root) = &self.reference_root {
            config.reference_root = root.clone();
        }
        if let Some(core) = &self.core_data {
            config.core_data_root = Some(core.clone());
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        Ok(config)
    }
}

fn build_codec(config: &EngineConfig, codec_args: Option<&str>) -> Arc<dyn CodecInvoker> {
    match codec_args {
        Some(template) => Arc::new(CommandCodec::new(
            config.codec_program.clone(),
            template.split_whitespace().map(str::to_string).collect(),
            config.target_codec,
        )),
        None => Arc::new(CommandCodec::ffmpeg(
            config.codec_program.clone(),
            config.target_codec,
            config.quality,
        )),
    }
}

/// Cancel the token on Ctrl-C. The engine stops at the next stage boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current stage");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Compress {
            world,
            codec,
            quality,
            codec_path,
            codec_args,
            delete_unreferenced,
            keep_trash,
            no_repair,
        } => {
            let mut config = world.config()?;
            if let Some(codec) = codec {
                config.target_codec = codec.into();
            }
            if let Some(quality) = quality {
                config.quality = quality.into();
            }
            if let Some(path) = codec_path {
                config.codec_program = path;
            }
            config.delete_unreferenced |= delete_unreferenced;
            if keep_trash {
                config.purge_trash = false;
            }
            if no_repair {
                config.repair_module_paths = false;
            }

            let codec = build_codec(&config, codec_args.as_deref());
            let engine = Engine::new(config).map_err(describe)?;
            let report = engine
                .run(codec, cancel_on_ctrl_c())
                .await
                .map_err(describe)?;

            match world.format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => print_report_table(&report),
            }
            if report.has_write_failures() {
                anyhow::bail!("{} reference(s) could not be rewritten", report.references_failed);
            }
        }
        Commands::Scan { world } => {
            let config = world.config()?;
            let engine = Engine::new(config).map_err(describe)?;
            let scan = engine.scan(cancel_on_ctrl_c()).await.map_err(describe)?;

            match world.format {
                OutputFormat::Json => print_json(&scan)?,
                OutputFormat::Table => print_scan_table(&scan),
            }
        }
        Commands::RestoreTrash { world } => {
            let config = EngineConfig::from_env_for(&world)
                .context("Failed to load configuration from environment")?;
            let engine = Engine::new(config).map_err(describe)?;
            let summary = engine.restore_trash().await.map_err(describe)?;
            print_restore(&summary);
        }
    }

    Ok(())
}

fn describe(error: worldshrink_core::EngineError) -> anyhow::Error {
    tracing::error!(code = error.error_code(), error = %error, "Run aborted");
    anyhow::Error::new(error)
}
