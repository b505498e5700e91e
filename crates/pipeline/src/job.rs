//! Batch transcription job model and persistence seams.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_transcript::CoreError;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Transcoding,
    Segmenting,
    DetectingLanguage,
    Transcribing,
    Merging,
    Diarizing,
    GeneratingOutputs,
}

impl Stage {
    pub const ORDER: [Stage; 8] = [
        Stage::Validating,
        Stage::Transcoding,
        Stage::Segmenting,
        Stage::DetectingLanguage,
        Stage::Transcribing,
        Stage::Merging,
        Stage::Diarizing,
        Stage::GeneratingOutputs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Transcoding => "transcoding",
            Stage::Segmenting => "segmenting",
            Stage::DetectingLanguage => "detecting_language",
            Stage::Transcribing => "transcribing",
            Stage::Merging => "merging",
            Stage::Diarizing => "diarizing",
            Stage::GeneratingOutputs => "generating_outputs",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        Stage::ORDER.into_iter().find(|stage| stage.as_str() == s)
    }

    pub fn index(&self) -> usize {
        Stage::ORDER
            .iter()
            .position(|s| s == self)
            .expect("stage present in ORDER")
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "created" => Some(JobStatus::Created),
            "processing" => Some(JobStatus::Processing),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionJob {
    pub job_id: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub source_blob_key: String,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub enable_diarization: bool,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    /// Percent complete per stage, keyed by stage name.
    pub stage_progress: BTreeMap<String, f64>,
    /// Seconds each completed stage took, in completion order.
    pub stage_durations: BTreeMap<String, f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    /// Artifact kind → blob key, filled by the output stage.
    pub artifact_keys: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TranscriptionJob {
    /// Fraction of the pipeline already done, judged by completed stages.
    pub fn progress_fraction(&self) -> f64 {
        self.stage_durations.len() as f64 / Stage::ORDER.len() as f64
    }

    /// Processing-time hint: `remaining_fraction × 3.5 × audio duration`.
    pub fn estimated_completion_s(&self) -> Option<f64> {
        if self.status != JobStatus::Processing {
            return None;
        }
        let duration = self.total_duration_s?;
        let remaining = (1.0 - self.progress_fraction()).max(0.0);
        Some(remaining * 3.5 * duration)
    }

    pub fn record_failure(&mut self, error: &CoreError) {
        self.status = JobStatus::Failed;
        self.error_code = Some(error.code().to_string());
        self.error_message = Some(error.to_string());
    }
}

/// One persisted output artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub job_id: String,
    pub kind: String,
    pub blob_key: String,
    pub size: u64,
    pub sha256: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// Durable job rows. Implemented on SQLite by the storage crate and in
/// memory for tests.
pub trait JobRepository: Send + Sync {
    fn create(&self, job: &TranscriptionJob) -> Result<()>;

    fn get(&self, job_id: &str) -> Result<Option<TranscriptionJob>>;

    /// Whole-row update keyed by `job_id`.
    fn update(&self, job: &TranscriptionJob) -> Result<()>;

    fn delete(&self, job_id: &str) -> Result<()>;

    /// Caller's jobs, newest first, optionally filtered by status.
    fn list_for_user(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<TranscriptionJob>>;

    /// Jobs stuck in `processing` with no update since `cutoff`.
    fn list_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<TranscriptionJob>>;

    /// Upsert one artifact row keyed by `(job_id, kind)`.
    fn save_artifact(&self, artifact: &ArtifactRecord) -> Result<()>;

    fn artifacts_for_job(&self, job_id: &str) -> Result<Vec<ArtifactRecord>>;

    fn delete_artifacts(&self, job_id: &str) -> Result<()>;
}

/// Append-only per-(job, stage) checkpoint ledger; a new write replaces
/// the previous state atomically.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, job_id: &str, stage: Stage, state: &serde_json::Value) -> Result<()>;

    fn load(&self, job_id: &str, stage: Stage) -> Result<Option<serde_json::Value>>;

    fn delete(&self, job_id: &str, stage: Stage) -> Result<()>;

    fn delete_all(&self, job_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: DashMap<String, TranscriptionJob>,
    artifacts: DashMap<(String, String), ArtifactRecord>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for MemoryJobRepository {
    fn create(&self, job: &TranscriptionJob) -> Result<()> {
        self.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<TranscriptionJob>> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    fn update(&self, job: &TranscriptionJob) -> Result<()> {
        match self.jobs.get_mut(&job.job_id) {
            Some(mut slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("job {}", job.job_id))),
        }
    }

    fn delete(&self, job_id: &str) -> Result<()> {
        self.jobs.remove(job_id);
        Ok(())
    }

    fn list_for_user(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<TranscriptionJob>> {
        let mut jobs: Vec<TranscriptionJob> = self
            .jobs
            .iter()
            .filter(|j| j.owner_id == owner_id)
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn list_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<TranscriptionJob>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < cutoff)
            .map(|j| j.clone())
            .collect())
    }

    fn save_artifact(&self, artifact: &ArtifactRecord) -> Result<()> {
        self.artifacts.insert(
            (artifact.job_id.clone(), artifact.kind.clone()),
            artifact.clone(),
        );
        Ok(())
    }

    fn artifacts_for_job(&self, job_id: &str) -> Result<Vec<ArtifactRecord>> {
        let mut artifacts: Vec<ArtifactRecord> = self
            .artifacts
            .iter()
            .filter(|entry| entry.key().0 == job_id)
            .map(|entry| entry.value().clone())
            .collect();
        artifacts.sort_by(|a, b| a.kind.cmp(&b.kind));
        Ok(artifacts)
    }

    fn delete_artifacts(&self, job_id: &str) -> Result<()> {
        self.artifacts.retain(|(id, _), _| id != job_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<(String, Stage), serde_json::Value>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, job_id: &str, stage: Stage, state: &serde_json::Value) -> Result<()> {
        self.checkpoints
            .insert((job_id.to_string(), stage), state.clone());
        Ok(())
    }

    fn load(&self, job_id: &str, stage: Stage) -> Result<Option<serde_json::Value>> {
        Ok(self
            .checkpoints
            .get(&(job_id.to_string(), stage))
            .map(|v| v.clone()))
    }

    fn delete(&self, job_id: &str, stage: Stage) -> Result<()> {
        self.checkpoints.remove(&(job_id.to_string(), stage));
        Ok(())
    }

    fn delete_all(&self, job_id: &str) -> Result<()> {
        self.checkpoints.retain(|(id, _), _| id != job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_names() {
        assert_eq!(Stage::ORDER.len(), 8);
        assert_eq!(Stage::Validating.index(), 0);
        assert_eq!(Stage::GeneratingOutputs.index(), 7);
        assert_eq!(Stage::DetectingLanguage.as_str(), "detecting_language");
        assert_eq!(Stage::parse("merging"), Some(Stage::Merging));
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn test_estimated_completion() {
        let mut job = crate::test_support::make_job("j1", "u1");
        job.status = JobStatus::Processing;
        job.total_duration_s = Some(120.0);
        job.stage_durations.insert("validating".into(), 0.5);
        job.stage_durations.insert("transcoding".into(), 1.0);
        // 6 of 8 stages remain.
        let estimate = job.estimated_completion_s().unwrap();
        assert!((estimate - 0.75 * 3.5 * 120.0).abs() < 1e-6);

        job.status = JobStatus::Complete;
        assert!(job.estimated_completion_s().is_none());
    }

    #[test]
    fn test_memory_repo_list_filters() {
        let repo = MemoryJobRepository::new();
        let mut a = crate::test_support::make_job("a", "u1");
        a.status = JobStatus::Complete;
        let b = crate::test_support::make_job("b", "u1");
        let c = crate::test_support::make_job("c", "u2");
        repo.create(&a).unwrap();
        repo.create(&b).unwrap();
        repo.create(&c).unwrap();

        assert_eq!(repo.list_for_user("u1", None, 10).unwrap().len(), 2);
        assert_eq!(
            repo.list_for_user("u1", Some(JobStatus::Complete), 10)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(repo.list_for_user("u2", None, 10).unwrap().len(), 1);
    }
}
