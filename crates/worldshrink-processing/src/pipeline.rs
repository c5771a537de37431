//! Transcode pipeline
//!
//! Produces each group's canonical output once, on a bounded worker pool. An output only
//! replaces its destination after it has been checked to be non-empty target-codec content.

use crate::codec::{CodecError, CodecInvoker};
use crate::validator::{validate_output, ValidationError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use worldshrink_core::{EngineError, ImageFormat, OutputAction, TranscodeStatus};
use worldshrink_storage::{WorldStorage, SNIFF_LEN};

/// Work item for one dedup group
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Index of the group in the resolver's output
    pub group: usize,
    pub source_key: String,
    pub source_path: PathBuf,
    pub output_key: String,
    pub action: OutputAction,
}

#[derive(Debug)]
pub struct TranscodeOutcome {
    pub group: usize,
    pub status: TranscodeStatus,
    /// Size of the file produced this run, 0 when nothing was written
    pub bytes_written: u64,
    pub error: Option<EngineError>,
}

impl TranscodeOutcome {
    fn failed(group: usize, error: EngineError) -> Self {
        Self {
            group,
            status: TranscodeStatus::Failed,
            bytes_written: 0,
            error: Some(error),
        }
    }

    /// Whether the group's output is on disk after this outcome
    pub fn output_confirmed(&self) -> bool {
        matches!(self.status, TranscodeStatus::Done | TranscodeStatus::Skipped)
    }
}

pub struct TranscodePipeline {
    codec: Arc<dyn CodecInvoker>,
    storage: Arc<dyn WorldStorage>,
    max_workers: usize,
}

impl TranscodePipeline {
    pub fn new(
        codec: Arc<dyn CodecInvoker>,
        storage: Arc<dyn WorldStorage>,
        max_workers: usize,
    ) -> Self {
        Self {
            codec,
            storage,
            max_workers: max_workers.max(1),
        }
    }

    /// Run every job and return one outcome per job, ordered by group.
    #[tracing::instrument(skip(self, jobs), fields(stage = "transcode", jobs = jobs.len()))]
    pub async fn run(&self, jobs: Vec<TranscodeJob>) -> Vec<TranscodeOutcome> {
        let start = std::time::Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut pending: BTreeSet<(usize, String)> = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for job in jobs {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            pending.insert((job.group, job.source_key.clone()));
            let codec = self.codec.clone();
            let storage = self.storage.clone();

            tasks.spawn(async move {
                let _permit = permit;
                Self::process_job(job, codec, storage).await
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending.retain(|(group, _)| *group != outcome.group);
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!(error = %e, "Transcode task failed"),
            }
        }

        // Anything still pending belongs to a task that panicked.
        for (group, source_key) in pending {
            outcomes.push(TranscodeOutcome::failed(
                group,
                EngineError::Codec {
                    path: source_key,
                    message: "transcode task aborted".to_string(),
                },
            ));
        }

        outcomes.sort_by_key(|o| o.group);

        let done = outcomes.iter().filter(|o| o.status == TranscodeStatus::Done).count();
        let skipped = outcomes.iter().filter(|o| o.status == TranscodeStatus::Skipped).count();
        let failed = outcomes.iter().filter(|o| o.status == TranscodeStatus::Failed).count();
        tracing::info!(
            done = done,
            skipped = skipped,
            failed = failed,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Transcode stage complete"
        );

        outcomes
    }

    #[tracing::instrument(skip(codec, storage), fields(source = %job.source_key, output = %job.output_key, action = ?job.action))]
    async fn process_job(
        job: TranscodeJob,
        codec: Arc<dyn CodecInvoker>,
        storage: Arc<dyn WorldStorage>,
    ) -> TranscodeOutcome {
        let start = std::time::Instant::now();
        let expected = codec.target().format();

        let result = match job.action {
            OutputAction::Reuse => Self::verify_key(storage.as_ref(), &job.source_key, expected)
                .await
                .map(|_| (TranscodeStatus::Skipped, 0)),
            OutputAction::Existing => {
                match Self::verify_key(storage.as_ref(), &job.output_key, expected).await {
                    Ok(_) => Ok((TranscodeStatus::Skipped, 0)),
                    Err(reason) => {
                        tracing::warn!(
                            output = %job.output_key,
                            reason = %reason,
                            "Existing output failed verification, encoding again"
                        );
                        Self::produce(&job, codec.as_ref(), storage.as_ref(), false)
                            .await
                            .map(|size| (TranscodeStatus::Done, size))
                    }
                }
            }
            OutputAction::Encode => Self::produce(&job, codec.as_ref(), storage.as_ref(), false)
                .await
                .map(|size| (TranscodeStatus::Done, size)),
            OutputAction::Copy => Self::produce(&job, codec.as_ref(), storage.as_ref(), true)
                .await
                .map(|size| (TranscodeStatus::Done, size)),
            OutputAction::Blocked => Err(EngineError::Codec {
                path: job.source_key.clone(),
                message: format!("output path {} is occupied", job.output_key),
            }),
        };

        match result {
            Ok((status, bytes_written)) => {
                if status == TranscodeStatus::Done {
                    tracing::info!(
                        source = %job.source_key,
                        output = %job.output_key,
                        size_bytes = bytes_written,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "Canonical output produced"
                    );
                } else {
                    tracing::debug!(output = %job.output_key, "Output already present");
                }
                TranscodeOutcome {
                    group: job.group,
                    status,
                    bytes_written,
                    error: None,
                }
            }
            Err(error) => {
                tracing::warn!(
                    source = %job.source_key,
                    output = %job.output_key,
                    error = %error,
                    "Transcode failed"
                );
                TranscodeOutcome::failed(job.group, error)
            }
        }
    }

    /// Write the output next to its destination, verify it, then move it into place.
    async fn produce(
        job: &TranscodeJob,
        codec: &dyn CodecInvoker,
        storage: &dyn WorldStorage,
        copy_only: bool,
    ) -> Result<u64, EngineError> {
        let target = codec.target();
        let suffix = format!(".{}", target.extension());
        let staged = storage
            .stage(&job.output_key, &suffix)
            .await
            .map_err(|e| e.into_engine(&job.output_key))?;

        if copy_only {
            tokio::fs::copy(&job.source_path, &*staged)
                .await
                .map_err(|e| EngineError::io(&job.source_path, e))?;
        } else {
            codec
                .encode(&job.source_path, &staged)
                .await
                .map_err(|e| e.for_asset(&job.source_key))?;
        }

        let (size, head) = inspect(&staged).await.map_err(|_| {
            CodecError::InvalidOutput("output file is missing".to_string()).for_asset(&job.source_key)
        })?;
        validate_output(size, &head, target.format())
            .map_err(|e| CodecError::InvalidOutput(e.to_string()).for_asset(&job.source_key))?;

        storage
            .commit(staged, &job.output_key)
            .await
            .map_err(|e| e.into_engine(&job.output_key))?;

        Ok(size)
    }

    async fn verify_key(
        storage: &dyn WorldStorage,
        key: &str,
        expected: ImageFormat,
    ) -> Result<u64, EngineError> {
        let path = storage.key_to_path(key).map_err(|e| e.into_engine(key))?;
        let (size, head) = inspect(&path).await.map_err(|_| EngineError::Codec {
            path: key.to_string(),
            message: ValidationError::Missing.to_string(),
        })?;
        validate_output(size, &head, expected).map_err(|e| EngineError::Codec {
            path: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(size)
    }
}

/// Size and leading bytes of a file.
async fn inspect(path: &Path) -> std::io::Result<(u64, Vec<u8>)> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok((size, head))
}
