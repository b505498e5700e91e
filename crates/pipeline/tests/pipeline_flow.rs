//! End-to-end pipeline runs against local storage, in-memory stores, and
//! a scripted provider.

use std::sync::Arc;

use bytes::Bytes;
use murmur_blobstore::{BlobMetadata, LocalStore, ObjectStore, Storage};
use murmur_cache::{Cache, MemoryCache};
use murmur_config::PipelineConfig;
use murmur_limits::{QuotaManager, RateLimiter};
use murmur_pipeline::{
    Checkpointer, JobQueue, JobService, JobStatus, MemoryCheckpointStore, MemoryJobRepository,
    NewJobRequest, PipelineServices, Stage, TurnTakingDiarizer, WorkerPool,
};
use murmur_stt::{MockProvider, SttError, SttFacade, Transcription};
use murmur_transcript::Word;
use tokio_util::sync::CancellationToken;

struct Harness {
    services: PipelineServices,
    job_service: JobService,
    provider: Arc<MockProvider>,
    storage: Storage,
    _dir: tempfile::TempDir,
}

fn harness(cfg: PipelineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
    let storage = Storage::new(store);
    let provider = Arc::new(MockProvider::new("scripted"));
    let services = PipelineServices {
        repo: Arc::new(MemoryJobRepository::new()),
        checkpointer: Checkpointer::new(Arc::new(MemoryCheckpointStore::new())),
        storage: storage.clone(),
        stt: Arc::new(SttFacade::new(provider.clone(), None)),
        cache: Cache::new(Arc::new(MemoryCache::new(256))),
        diarizer: Arc::new(TurnTakingDiarizer::default()),
        rate: Arc::new(RateLimiter::new(true)),
        quota: Arc::new(QuotaManager::new(true)),
        queue: Arc::new(JobQueue::new()),
        cfg,
    };
    Harness {
        job_service: JobService::new(services.clone()),
        services,
        provider,
        storage,
        _dir: dir,
    }
}

fn sine_wav(seconds: f64) -> Vec<u8> {
    let rate = murmur_pipeline::TARGET_SAMPLE_RATE;
    let samples: Vec<f32> = (0..(rate as f64 * seconds) as usize)
        .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32).sin() * 0.4)
        .collect();
    murmur_pipeline::encode_wav(&samples, rate).unwrap()
}

fn words_response(words: &[(&str, u64, u64)]) -> Transcription {
    Transcription {
        text: words.iter().map(|w| w.0).collect::<Vec<_>>().join(" "),
        words: words
            .iter()
            .map(|(t, s, e)| Word::new(*t, *s, *e, 0.9))
            .collect(),
        confidence: 0.9,
        language: "en".to_string(),
        duration_s: 2.0,
    }
}

async fn seed_source(harness: &Harness, seconds: f64) -> (String, u64) {
    let wav = sine_wav(seconds);
    let size = wav.len() as u64;
    harness
        .storage
        .put(
            "sessions/up-1/audio.wav",
            Bytes::from(wav),
            BlobMetadata {
                content_type: "audio/wav".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    ("sessions/up-1/audio.wav".to_string(), size)
}

fn job_request(blob_key: String, size: u64) -> NewJobRequest {
    NewJobRequest {
        owner_id: "u1".to_string(),
        source_blob_key: blob_key,
        filename: "audio.wav".to_string(),
        mime_type: "audio/wav".to_string(),
        total_size: size,
        upload_id: Some("up-1".to_string()),
        language: None,
        enable_diarization: false,
    }
}

async fn wait_terminal(harness: &Harness, job_id: &str) -> JobStatus {
    for _ in 0..600 {
        let job = harness.services.repo.get(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("job never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_segment_job_completes() {
    let harness = harness(PipelineConfig {
        workers: 1,
        ..Default::default()
    });
    let (blob_key, size) = seed_source(&harness, 2.0).await;

    // One call for language detection, one for the single segment.
    harness
        .provider
        .push_ok(words_response(&[("hello", 0, 500), ("world", 500, 1100)]));
    harness
        .provider
        .push_ok(words_response(&[("hello", 0, 500), ("world", 500, 1100)]));

    let job = harness
        .job_service
        .create_job(job_request(blob_key, size))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handles = WorkerPool::new(harness.services.clone()).start(cancel.clone());
    let status = wait_terminal(&harness, &job.job_id).await;
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(status, JobStatus::Complete);
    let finished = harness.services.repo.get(&job.job_id).unwrap().unwrap();
    assert_eq!(finished.word_count, Some(2));
    assert_eq!(finished.detected_language.as_deref(), Some("en"));
    assert_eq!(finished.artifact_keys.len(), 4);

    // Every earlier stage recorded a duration, in order.
    for stage in &Stage::ORDER {
        if *stage == Stage::Diarizing {
            continue;
        }
        assert!(
            finished.stage_durations.contains_key(stage.as_str()),
            "missing duration for {stage}"
        );
    }

    // The txt artifact holds the transcript.
    let txt = harness
        .storage
        .get(&finished.artifact_keys["txt"])
        .await
        .unwrap();
    assert_eq!(&txt[..], b"hello world");

    // Regenerating artifacts from the checkpointed words is
    // reproducible: the json blob parses and matches the word count.
    let json = harness
        .storage
        .get(&finished.artifact_keys["json"])
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(parsed["metadata"]["total_words"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_checkpoints_and_retries() {
    // Small segments: 2 s budget over 8 s of audio → 4+ segments.
    let rate = murmur_pipeline::TARGET_SAMPLE_RATE as u64;
    let cfg = PipelineConfig {
        workers: 1,
        transcribe_concurrency: 1,
        max_segment_bytes: 44 + 2 * rate * 2,
        ..Default::default()
    };
    let harness = harness(cfg);
    let (blob_key, size) = seed_source(&harness, 8.0).await;

    // Language detection succeeds.
    harness.provider.push_ok(words_response(&[("lang", 0, 300)]));
    // Segments 0..2 succeed.
    for i in 0..3 {
        harness
            .provider
            .push_ok(words_response(&[(&format!("seg{i}"), 0, 400)]));
    }
    // Segment 3: the provider fails hard enough to exhaust the façade's
    // three attempts, failing the stage once.
    for _ in 0..3 {
        harness
            .provider
            .push_err(SttError::Unavailable("blip".to_string()));
    }
    // On the requeued run the remaining segments succeed.
    for i in 3..10 {
        harness
            .provider
            .push_ok(words_response(&[(&format!("seg{i}"), 0, 400)]));
    }

    let job = harness
        .job_service
        .create_job(job_request(blob_key, size))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handles = WorkerPool::new(harness.services.clone()).start(cancel.clone());
    let status = wait_terminal(&harness, &job.job_id).await;
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(status, JobStatus::Complete);
    let finished = harness.services.repo.get(&job.job_id).unwrap().unwrap();
    assert_eq!(finished.retry_count, 1, "exactly one automatic retry");
    assert!(finished.stage_durations["transcribing"] >= 0.0);
    assert!(finished.stage_durations.contains_key("merging"));
    assert!(finished.word_count.unwrap_or(0) >= 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_media_fails_permanently() {
    let harness = harness(PipelineConfig {
        workers: 1,
        ..Default::default()
    });
    harness
        .storage
        .put(
            "sessions/up-1/audio.wav",
            Bytes::from_static(b"this is not audio at all"),
            BlobMetadata::default(),
        )
        .await
        .unwrap();

    let job = harness
        .job_service
        .create_job(job_request("sessions/up-1/audio.wav".to_string(), 24))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handles = WorkerPool::new(harness.services.clone()).start(cancel.clone());
    let status = wait_terminal(&harness, &job.job_id).await;
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(status, JobStatus::Failed);
    let failed = harness.services.repo.get(&job.job_id).unwrap().unwrap();
    assert_eq!(failed.error_code.as_deref(), Some("invalid_input"));
    assert!(failed.artifact_keys.is_empty(), "no artifacts on failure");
    assert_eq!(failed.retry_count, 0, "permanent errors are not retried");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_from_stage_validation() {
    let harness = harness(PipelineConfig::default());
    let (blob_key, size) = seed_source(&harness, 1.0).await;
    let job = harness
        .job_service
        .create_job(job_request(blob_key, size))
        .await
        .unwrap();

    // Not failed yet: retry refused.
    let err = harness
        .job_service
        .retry(&job.job_id, "u1", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");

    // Fail it manually, then retry from an uncompleted stage: refused.
    let mut failed = harness.services.repo.get(&job.job_id).unwrap().unwrap();
    failed.status = JobStatus::Failed;
    harness.services.repo.update(&failed).unwrap();
    let err = harness
        .job_service
        .retry(&job.job_id, "u1", Some(Stage::Merging))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");

    // Plain retry requeues and increments the count.
    let retried = harness.job_service.retry(&job.job_id, "u1", None).await.unwrap();
    assert_eq!(retried.status, JobStatus::Created);
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_removes_artifacts_and_source() {
    let harness = harness(PipelineConfig {
        workers: 1,
        ..Default::default()
    });
    let (blob_key, size) = seed_source(&harness, 1.0).await;
    harness.provider.push_ok(words_response(&[("a", 0, 200)]));
    harness.provider.push_ok(words_response(&[("a", 0, 200)]));

    let job = harness
        .job_service
        .create_job(job_request(blob_key.clone(), size))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let handles = WorkerPool::new(harness.services.clone()).start(cancel.clone());
    wait_terminal(&harness, &job.job_id).await;
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    let finished = harness.services.repo.get(&job.job_id).unwrap().unwrap();
    let artifact_key = finished.artifact_keys["txt"].clone();
    assert!(harness.storage.exists(&artifact_key).await);

    harness.job_service.delete(&job.job_id, "u1").await.unwrap();
    assert!(harness.services.repo.get(&job.job_id).unwrap().is_none());
    assert!(!harness.storage.exists(&artifact_key).await);
    assert!(!harness.storage.exists(&blob_key).await);
}
