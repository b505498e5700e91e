//! Batch worker pool.
//!
//! Workers claim jobs from the queue one at a time, acquire a
//! concurrent-job slot for the owner, and walk the stage list from the
//! resume point. Cancellation is observed at stage boundaries; transient
//! stage failures re-enqueue the job until `max_retries` is exhausted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use murmur_blobstore::Storage;
use murmur_cache::Cache;
use murmur_config::PipelineConfig;
use murmur_limits::{QuotaManager, RateLimiter};
use murmur_stt::SttFacade;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpointer;
use crate::diarize::Diarizer;
use crate::job::{JobRepository, JobStatus, Stage, TranscriptionJob};
use crate::queue::JobQueue;
use crate::stages::run_stage;
use crate::Result;

/// Pause before re-enqueueing a job that could not get an admission slot.
const ADMISSION_BACKOFF: Duration = Duration::from_millis(500);

/// Everything a worker (and the job service) needs, built once at
/// startup and passed explicitly.
#[derive(Clone)]
pub struct PipelineServices {
    pub repo: Arc<dyn JobRepository>,
    pub checkpointer: Checkpointer,
    pub storage: Storage,
    pub stt: Arc<SttFacade>,
    pub cache: Cache,
    pub diarizer: Arc<dyn Diarizer>,
    pub rate: Arc<RateLimiter>,
    pub quota: Arc<QuotaManager>,
    pub queue: Arc<JobQueue>,
    pub cfg: PipelineConfig,
}

/// Balances the quota job counter across every exit path.
struct QuotaJobGuard {
    quota: Arc<QuotaManager>,
    owner_id: String,
}

impl QuotaJobGuard {
    fn acquire(quota: Arc<QuotaManager>, owner_id: &str) -> Self {
        quota.job_started(owner_id);
        Self {
            quota,
            owner_id: owner_id.to_string(),
        }
    }
}

impl Drop for QuotaJobGuard {
    fn drop(&mut self) {
        self.quota.job_finished(&self.owner_id);
    }
}

pub struct WorkerPool {
    services: PipelineServices,
}

impl WorkerPool {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    /// Spawn the configured number of workers; they stop when `cancel`
    /// fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.services.cfg.workers.max(1))
            .map(|worker_id| {
                let services = self.services.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tracing::info!(worker_id, "batch worker started");
                    loop {
                        let job_id = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job_id = services.queue.pop() => job_id,
                        };
                        if let Err(e) = run_job(&services, &job_id).await {
                            tracing::error!(worker_id, job_id, error = %e, "job run failed");
                        }
                    }
                    tracing::info!(worker_id, "batch worker stopped");
                })
            })
            .collect()
    }
}

/// First stage whose checkpoint is absent or incomplete, honoring the
/// diarization toggle.
pub(crate) fn resume_stage(
    checkpointer: &Checkpointer,
    job: &TranscriptionJob,
) -> Result<Stage> {
    for stage in Stage::ORDER {
        if stage == Stage::Diarizing && !job.enable_diarization {
            continue;
        }
        let complete = if stage == Stage::Transcribing {
            // The transcribing checkpoint grows per segment; only the
            // final write flips its completed flag.
            checkpointer
                .load::<crate::stages::TranscribingState>(&job.job_id, stage)?
                .map(|state| state.completed)
                .unwrap_or(false)
        } else {
            checkpointer.exists(&job.job_id, stage)?
        };
        if !complete {
            return Ok(stage);
        }
    }
    Ok(Stage::GeneratingOutputs)
}

pub(crate) async fn run_job(services: &PipelineServices, job_id: &str) -> Result<()> {
    let Some(mut job) = services.repo.get(job_id)? else {
        tracing::warn!(job_id, "queued job no longer exists");
        return Ok(());
    };
    if job.status.is_terminal() {
        tracing::debug!(job_id, status = job.status.as_str(), "skipping terminal job");
        return Ok(());
    }

    // Admission: a concurrent-job slot per owner. Without one the job
    // stays queued and is retried shortly.
    let Some(_slot) = services.rate.try_acquire_job(&job.owner_id) else {
        tracing::debug!(job_id, owner_id = %job.owner_id, "no job slot available, requeueing");
        tokio::time::sleep(ADMISSION_BACKOFF).await;
        services.queue.push(job_id.to_string());
        return Ok(());
    };
    let _quota_guard = QuotaJobGuard::acquire(services.quota.clone(), &job.owner_id);

    job.status = JobStatus::Processing;
    job.error_code = None;
    job.error_message = None;
    job.updated_at = Utc::now();
    services.repo.update(&job)?;
    services.cache.invalidate_user_jobs(&job.owner_id).await;

    let start_stage = resume_stage(&services.checkpointer, &job)?;
    tracing::info!(
        job_id,
        start_stage = %start_stage,
        retry_count = job.retry_count,
        "running job"
    );

    for stage in &Stage::ORDER[start_stage.index()..] {
        let stage = *stage;
        if stage == Stage::Diarizing && !job.enable_diarization {
            continue;
        }

        // Cancellation boundary: drop the job if the user cancelled it
        // while the previous stage ran.
        if let Some(latest) = services.repo.get(job_id)? {
            if latest.status == JobStatus::Cancelled {
                tracing::info!(job_id, "job cancelled, stopping at stage boundary");
                return Ok(());
            }
        }

        job.current_stage = Some(stage);
        job.stage_progress.insert(stage.as_str().to_string(), 0.0);
        job.updated_at = Utc::now();
        services.repo.update(&job)?;

        let started = Instant::now();
        match run_stage(services, &mut job, stage).await {
            Ok(()) => {
                job.stage_durations
                    .insert(stage.as_str().to_string(), started.elapsed().as_secs_f64());
                job.stage_progress.insert(stage.as_str().to_string(), 100.0);
                job.updated_at = Utc::now();
                services.repo.update(&job)?;
                services.cache.invalidate_user_jobs(&job.owner_id).await;
                services
                    .cache
                    .delete(&murmur_cache::keys::job_status(job_id))
                    .await;
                tracing::debug!(job_id, stage = %stage, elapsed_s = started.elapsed().as_secs_f64(), "stage complete");
            }
            Err(error) => {
                return handle_stage_failure(services, job, stage, error).await;
            }
        }
    }

    job.status = JobStatus::Complete;
    job.completed_at = Some(Utc::now());
    job.updated_at = Utc::now();
    services.repo.update(&job)?;
    services.cache.invalidate_user_jobs(&job.owner_id).await;
    services
        .cache
        .delete(&murmur_cache::keys::job_status(job_id))
        .await;

    if let Some(duration_s) = job.total_duration_s {
        services
            .quota
            .consume(&job.owner_id, duration_s / 60.0, 0.0, 0);
    }
    tracing::info!(
        job_id,
        word_count = job.word_count.unwrap_or(0),
        "job complete"
    );
    Ok(())
}

async fn handle_stage_failure(
    services: &PipelineServices,
    mut job: TranscriptionJob,
    stage: Stage,
    error: murmur_transcript::CoreError,
) -> Result<()> {
    tracing::warn!(
        job_id = %job.job_id,
        stage = %stage,
        error = %error,
        retryable = error.is_retryable(),
        "stage failed"
    );

    if error.is_retryable() && job.retry_count + 1 < job.max_retries {
        job.retry_count += 1;
        job.status = JobStatus::Created;
        job.updated_at = Utc::now();
        services.repo.update(&job)?;
        services.queue.push(job.job_id.clone());
        tracing::info!(
            job_id = %job.job_id,
            retry_count = job.retry_count,
            "job requeued after transient failure"
        );
        return Ok(());
    }

    // Permanent failure; checkpoints stay for postmortem and manual
    // retry.
    if error.is_retryable() {
        job.retry_count += 1;
    }
    job.record_failure(&error);
    job.updated_at = Utc::now();
    services.repo.update(&job)?;
    services.cache.invalidate_user_jobs(&job.owner_id).await;
    services
        .cache
        .delete(&murmur_cache::keys::job_status(&job.job_id))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::MemoryCheckpointStore;
    use crate::test_support::make_job;

    #[test]
    fn test_resume_stage_skips_checkpointed() {
        let checkpointer = Checkpointer::new(Arc::new(MemoryCheckpointStore::new()));
        let job = make_job("j1", "u1");
        assert_eq!(
            resume_stage(&checkpointer, &job).unwrap(),
            Stage::Validating
        );

        checkpointer
            .save("j1", Stage::Validating, &serde_json::json!({"ok": 1}))
            .unwrap();
        checkpointer
            .save("j1", Stage::Transcoding, &serde_json::json!({"ok": 1}))
            .unwrap();
        assert_eq!(
            resume_stage(&checkpointer, &job).unwrap(),
            Stage::Segmenting
        );
    }

    #[test]
    fn test_resume_stage_skips_disabled_diarization() {
        let checkpointer = Checkpointer::new(Arc::new(MemoryCheckpointStore::new()));
        let mut job = make_job("j1", "u1");
        job.enable_diarization = false;
        for stage in &Stage::ORDER[..6] {
            if *stage == Stage::Transcribing {
                checkpointer
                    .save(
                        "j1",
                        *stage,
                        &serde_json::json!({"results": {}, "completed": true}),
                    )
                    .unwrap();
            } else {
                checkpointer
                    .save("j1", *stage, &serde_json::json!({"ok": 1}))
                    .unwrap();
            }
        }
        assert_eq!(
            resume_stage(&checkpointer, &job).unwrap(),
            Stage::GeneratingOutputs
        );
    }
}
