//! Staged batch transcription pipeline.
//!
//! Jobs flow validating → transcoding → segmenting → detecting_language
//! → transcribing → merging → diarizing → generating_outputs, with a
//! durable checkpoint after every stage so retries resume exactly where
//! work stopped.

mod checkpoint;
mod diarize;
mod job;
mod media;
mod queue;
mod service;
mod stages;
mod worker;

pub use checkpoint::Checkpointer;
pub use diarize::{annotate, Diarizer, SingleSpeakerDiarizer, SpokenWord, TurnTakingDiarizer};
pub use job::{
    ArtifactRecord, CheckpointStore, JobRepository, JobStatus, MemoryCheckpointStore,
    MemoryJobRepository, Stage, TranscriptionJob,
};
pub use media::{
    decode_to_mono, decode_wav, encode_wav, plan_segments, probe, resample_to_target, DecodedAudio,
    MediaProbe, SegmentPlan, TARGET_SAMPLE_RATE,
};
pub use queue::JobQueue;
pub use service::{JobService, JobSummary, NewJobRequest};
pub use stages::{
    DetectingLanguageState, DiarizingState, GeneratingOutputsState, MergingState, SegmentRef,
    SegmentingState, TranscodingState, TranscribingState, ValidatingState,
};
pub use worker::{PipelineServices, WorkerPool};

pub type Result<T> = std::result::Result<T, murmur_transcript::CoreError>;

pub mod test_support {
    //! Shared constructors for unit and integration tests.

    use std::collections::BTreeMap;

    use chrono::Utc;

    use crate::job::{JobStatus, TranscriptionJob};

    pub fn make_job(job_id: &str, owner_id: &str) -> TranscriptionJob {
        let now = Utc::now();
        TranscriptionJob {
            job_id: job_id.to_string(),
            owner_id: owner_id.to_string(),
            upload_id: None,
            source_blob_key: format!("jobs/{job_id}/source.wav"),
            filename: "source.wav".to_string(),
            mime_type: "audio/wav".to_string(),
            total_size: 1024,
            language: None,
            enable_diarization: true,
            status: JobStatus::Created,
            current_stage: None,
            stage_progress: BTreeMap::new(),
            stage_durations: BTreeMap::new(),
            retry_count: 0,
            max_retries: 3,
            error_code: None,
            error_message: None,
            detected_language: None,
            total_duration_s: None,
            word_count: None,
            artifact_keys: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
