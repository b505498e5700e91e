//! User-facing job operations: creation, status, retry, cancel, delete,
//! listing, downloads, and the stuck-job sweep.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use murmur_cache::{keys as cache_keys, Ttl};
use murmur_transcript::{ArtifactKind, CoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobStatus, Stage, TranscriptionJob};
use crate::worker::PipelineServices;
use crate::Result;

/// Jobs processing with no update for this many seconds are considered
/// stuck.
const STUCK_JOB_AGE_S: i64 = 3600;

#[derive(Debug, Clone)]
pub struct NewJobRequest {
    pub owner_id: String,
    pub source_blob_key: String,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub upload_id: Option<String>,
    pub language: Option<String>,
    pub enable_diarization: bool,
}

/// Listing row; lighter than the full job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub filename: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<&TranscriptionJob> for JobSummary {
    fn from(job: &TranscriptionJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            filename: job.filename.clone(),
            status: job.status,
            current_stage: job.current_stage,
            progress_percent: job.progress_fraction() * 100.0,
            detected_language: job.detected_language.clone(),
            total_duration_s: job.total_duration_s,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Clone)]
pub struct JobService {
    services: PipelineServices,
}

impl JobService {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    /// Create a job in `created` state and enqueue it.
    pub async fn create_job(&self, request: NewJobRequest) -> Result<TranscriptionJob> {
        let now = Utc::now();
        let job = TranscriptionJob {
            job_id: Uuid::new_v4().to_string(),
            owner_id: request.owner_id,
            upload_id: request.upload_id,
            source_blob_key: request.source_blob_key,
            filename: request.filename,
            mime_type: request.mime_type,
            total_size: request.total_size,
            language: request.language,
            enable_diarization: request.enable_diarization,
            status: JobStatus::Created,
            current_stage: None,
            stage_progress: BTreeMap::new(),
            stage_durations: BTreeMap::new(),
            retry_count: 0,
            max_retries: self.services.cfg.max_retries,
            error_code: None,
            error_message: None,
            detected_language: None,
            total_duration_s: None,
            word_count: None,
            artifact_keys: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.services.repo.create(&job)?;
        self.services.queue.push(job.job_id.clone());
        self.services.cache.invalidate_user_jobs(&job.owner_id).await;
        tracing::info!(job_id = %job.job_id, filename = %job.filename, "created transcription job");
        Ok(job)
    }

    fn load_owned(&self, job_id: &str, owner_id: &str) -> Result<TranscriptionJob> {
        let job = self
            .services
            .repo
            .get(job_id)?
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        if job.owner_id != owner_id {
            return Err(CoreError::Forbidden("job access denied".to_string()));
        }
        Ok(job)
    }

    pub async fn get(&self, job_id: &str, owner_id: &str) -> Result<TranscriptionJob> {
        let cache_key = cache_keys::job_status(job_id);
        if let Some(job) = self
            .services
            .cache
            .get_json::<TranscriptionJob>(&cache_key)
            .await
        {
            if job.owner_id != owner_id {
                return Err(CoreError::Forbidden("job access denied".to_string()));
            }
            return Ok(job);
        }

        let job = self.load_owned(job_id, owner_id)?;
        self.services
            .cache
            .set_json(&cache_key, &job, Ttl::Default)
            .await;
        Ok(job)
    }

    pub async fn list(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobSummary>> {
        let unfiltered = status.is_none();
        if unfiltered {
            if let Some(cached) = self
                .services
                .cache
                .get_json::<Vec<JobSummary>>(&cache_keys::user_jobs(owner_id))
                .await
            {
                return Ok(cached.into_iter().take(limit).collect());
            }
        }

        let jobs = self.services.repo.list_for_user(owner_id, status, limit)?;
        let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
        if unfiltered {
            self.services
                .cache
                .set_json(&cache_keys::user_jobs(owner_id), &summaries, Ttl::Default)
                .await;
        }
        Ok(summaries)
    }

    /// Signed URL for one artifact of a complete job.
    pub async fn download_url(
        &self,
        job_id: &str,
        owner_id: &str,
        kind: ArtifactKind,
    ) -> Result<String> {
        let job = self.load_owned(job_id, owner_id)?;
        if job.status != JobStatus::Complete {
            return Err(CoreError::InvalidInput(format!(
                "job is not complete (status: {})",
                job.status.as_str()
            )));
        }
        let blob_key = job.artifact_keys.get(kind.as_str()).ok_or_else(|| {
            CoreError::NotFound(format!("artifact {kind} for job {job_id}"))
        })?;
        self.services
            .storage
            .get_url(blob_key, Duration::from_secs(3600))
            .await
            .map_err(|e| CoreError::Internal(format!("presign: {e}")))
    }

    /// Queue a failed job for another run. With `from_stage`, checkpoints
    /// from that stage on are discarded so the worker resumes there; the
    /// stage must already have completed once.
    pub async fn retry(
        &self,
        job_id: &str,
        owner_id: &str,
        from_stage: Option<Stage>,
    ) -> Result<TranscriptionJob> {
        let mut job = self.load_owned(job_id, owner_id)?;
        if job.status != JobStatus::Failed {
            return Err(CoreError::InvalidInput(format!(
                "only failed jobs can be retried (status: {})",
                job.status.as_str()
            )));
        }
        if job.retry_count >= job.max_retries {
            return Err(CoreError::InvalidInput(format!(
                "maximum retry attempts reached ({})",
                job.max_retries
            )));
        }

        if let Some(stage) = from_stage {
            let completed = job.stage_durations.contains_key(stage.as_str());
            if !completed {
                return Err(CoreError::InvalidInput(format!(
                    "stage {stage} has not completed; cannot retry from it"
                )));
            }
            for later in &Stage::ORDER[stage.index()..] {
                self.services.checkpointer.delete(job_id, *later)?;
            }
        }

        job.status = JobStatus::Created;
        job.retry_count += 1;
        job.error_code = None;
        job.error_message = None;
        job.updated_at = Utc::now();
        self.services.repo.update(&job)?;
        self.services.queue.push(job.job_id.clone());
        self.services.cache.invalidate_user_jobs(owner_id).await;
        self.services
            .cache
            .delete(&cache_keys::job_status(job_id))
            .await;
        tracing::info!(job_id, from_stage = ?from_stage, "job queued for retry");
        Ok(job)
    }

    /// Mark the job cancelled; the worker drops it at the next stage
    /// boundary. In-flight provider calls are allowed to finish.
    pub async fn cancel(&self, job_id: &str, owner_id: &str) -> Result<()> {
        let mut job = self.load_owned(job_id, owner_id)?;
        if job.status.is_terminal() {
            return Err(CoreError::InvalidInput(format!(
                "job cannot be cancelled (status: {})",
                job.status.as_str()
            )));
        }
        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();
        self.services.repo.update(&job)?;
        self.services.cache.invalidate_user_jobs(owner_id).await;
        self.services
            .cache
            .delete(&cache_keys::job_status(job_id))
            .await;
        tracing::info!(job_id, "job cancelled");
        Ok(())
    }

    /// Remove the job, its artifacts, its source blob, and every
    /// checkpoint.
    pub async fn delete(&self, job_id: &str, owner_id: &str) -> Result<()> {
        let mut job = self.load_owned(job_id, owner_id)?;
        if !job.status.is_terminal() {
            job.status = JobStatus::Cancelled;
            job.updated_at = Utc::now();
            self.services.repo.update(&job)?;
        }

        for artifact in self.services.repo.artifacts_for_job(job_id)? {
            self.services.storage.delete(&artifact.blob_key).await;
            self.services
                .cache
                .delete(&cache_keys::transcription(job_id, &artifact.kind))
                .await;
        }
        self.services.repo.delete_artifacts(job_id)?;
        self.services.storage.delete(&job.source_blob_key).await;
        self.services.checkpointer.delete_all(job_id)?;
        self.services.repo.delete(job_id)?;

        self.services
            .cache
            .delete(&cache_keys::job_status(job_id))
            .await;
        self.services.cache.invalidate_user_jobs(owner_id).await;
        tracing::info!(job_id, "job deleted");
        Ok(())
    }

    /// Fail jobs stuck in `processing` for over an hour. Returns how many
    /// were failed.
    pub async fn sweep_stuck(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(STUCK_JOB_AGE_S);
        let stale = self.services.repo.list_stale_processing(cutoff)?;
        let count = stale.len();
        for mut job in stale {
            job.record_failure(&CoreError::Timeout(
                "job timed out after 1 hour without progress".to_string(),
            ));
            job.updated_at = Utc::now();
            self.services.repo.update(&job)?;
            self.services.cache.invalidate_user_jobs(&job.owner_id).await;
            tracing::warn!(job_id = %job.job_id, "failed stuck job");
        }
        Ok(count)
    }
}
