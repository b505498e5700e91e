//! The eight pipeline stages.
//!
//! Every stage reads its predecessors' checkpoints, does its work, and
//! writes its own checkpoint before the worker marks it complete. CPU
//! heavy media work runs on the blocking pool.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use murmur_blobstore::{keys, BlobMetadata};
use murmur_live::resolve_overlap;
use murmur_stt::TranscribeRequest;
use murmur_transcript::{ArtifactKind, CoreError, Word};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::diarize::{annotate, SpokenWord};
use crate::job::{Stage, TranscriptionJob};
use crate::media::{self, MediaProbe, SegmentPlan};
use crate::worker::PipelineServices;
use crate::Result;

/// Floor for per-segment STT timeouts.
const MIN_SEGMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidatingState {
    pub duration_s: f64,
    pub container: String,
    pub streams: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscodingState {
    pub normalized_blob_key: String,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRef {
    pub idx: u32,
    pub blob_key: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentingState {
    pub segments: Vec<SegmentRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetectingLanguageState {
    pub detected_language: String,
    pub confidence: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscribingState {
    /// Segment idx → words on the job timeline. Written durably after
    /// every completed segment.
    pub results: BTreeMap<u32, Vec<Word>>,
    /// False while segments are still outstanding; an incomplete
    /// checkpoint means a retry resumes inside this stage.
    pub completed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MergingState {
    pub merged_words: Vec<Word>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiarizingState {
    pub words_with_speaker: Vec<SpokenWord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeneratingOutputsState {
    pub artifact_keys: BTreeMap<String, String>,
}

pub(crate) async fn run_stage(
    services: &PipelineServices,
    job: &mut TranscriptionJob,
    stage: Stage,
) -> Result<()> {
    match stage {
        Stage::Validating => validating(services, job).await,
        Stage::Transcoding => transcoding(services, job).await,
        Stage::Segmenting => segmenting(services, job).await,
        Stage::DetectingLanguage => detecting_language(services, job).await,
        Stage::Transcribing => transcribing(services, job).await,
        Stage::Merging => merging(services, job).await,
        Stage::Diarizing => diarizing(services, job).await,
        Stage::GeneratingOutputs => generating_outputs(services, job).await,
    }
}

fn blob_err(err: murmur_blobstore::StoreError) -> CoreError {
    match err {
        murmur_blobstore::StoreError::NotFound(_) => {
            CoreError::NotFound("stored media".to_string())
        }
        murmur_blobstore::StoreError::Unavailable(msg) => {
            CoreError::Timeout(format!("storage unavailable: {msg}"))
        }
        murmur_blobstore::StoreError::InvalidKey(_) => {
            CoreError::Internal("invalid storage key".to_string())
        }
    }
}

async fn validating(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let family_allowed =
        job.mime_type.starts_with("audio/") || job.mime_type.starts_with("video/");
    if !family_allowed {
        return Err(CoreError::InvalidInput(format!(
            "unsupported media type: {}",
            job.mime_type
        )));
    }
    if job.total_size == 0 {
        return Err(CoreError::InvalidInput("empty media file".to_string()));
    }
    if job.total_size > services.cfg.max_file_size {
        return Err(CoreError::InvalidInput(format!(
            "file too large, maximum is {} MB",
            services.cfg.max_file_size / (1024 * 1024)
        )));
    }

    let source = services
        .storage
        .get(&job.source_blob_key)
        .await
        .map_err(blob_err)?;
    let filename = job.filename.clone();
    let probe: MediaProbe =
        tokio::task::spawn_blocking(move || media::probe(source.to_vec(), &filename))
            .await
            .map_err(|e| CoreError::Internal(format!("probe task: {e}")))??;

    if probe.duration_s > 0.0 {
        job.total_duration_s = Some(probe.duration_s);
    }
    services.checkpointer.save(
        &job.job_id,
        Stage::Validating,
        &ValidatingState {
            duration_s: probe.duration_s,
            container: probe.container,
            streams: probe.streams,
        },
    )
}

async fn transcoding(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let source = services
        .storage
        .get(&job.source_blob_key)
        .await
        .map_err(blob_err)?;
    let filename = job.filename.clone();

    let (wav, duration_s) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, f64)> {
        let decoded = media::decode_to_mono(source.to_vec(), &filename)?;
        let samples = media::resample_to_target(decoded)?;
        let duration_s = samples.len() as f64 / media::TARGET_SAMPLE_RATE as f64;
        let wav = media::encode_wav(&samples, media::TARGET_SAMPLE_RATE)?;
        Ok((wav, duration_s))
    })
    .await
    .map_err(|e| CoreError::Internal(format!("transcode task: {e}")))??;

    let normalized_blob_key = keys::job(&job.job_id, "normalized.wav");
    services
        .storage
        .put(
            &normalized_blob_key,
            Bytes::from(wav),
            BlobMetadata {
                content_type: "audio/wav".to_string(),
                ..Default::default()
            },
        )
        .await
        .map_err(blob_err)?;

    job.total_duration_s = Some(duration_s);
    services.checkpointer.save(
        &job.job_id,
        Stage::Transcoding,
        &TranscodingState {
            normalized_blob_key,
            duration_s,
        },
    )
}

async fn segmenting(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let transcoded: TranscodingState = services
        .checkpointer
        .load(&job.job_id, Stage::Transcoding)?
        .ok_or_else(|| CoreError::Internal("transcoding checkpoint missing".to_string()))?;

    let normalized = services
        .storage
        .get(&transcoded.normalized_blob_key)
        .await
        .map_err(blob_err)?;

    let max_bytes = services.cfg.max_segment_bytes;
    let overlap_ms = services.cfg.segment_overlap_ms;
    let (plans, encoded): (Vec<SegmentPlan>, Vec<Vec<u8>>) =
        tokio::task::spawn_blocking(move || -> Result<(Vec<SegmentPlan>, Vec<Vec<u8>>)> {
            let audio = media::decode_wav(&normalized)?;
            let plans =
                media::plan_segments(audio.samples.len(), audio.sample_rate, max_bytes, overlap_ms);
            let mut encoded = Vec::with_capacity(plans.len());
            for plan in &plans {
                let slice = &audio.samples[plan.start_sample..plan.end_sample];
                encoded.push(media::encode_wav(slice, audio.sample_rate)?);
            }
            Ok((plans, encoded))
        })
        .await
        .map_err(|e| CoreError::Internal(format!("segment task: {e}")))??;

    let mut segments = Vec::with_capacity(plans.len());
    for (plan, wav) in plans.iter().zip(encoded) {
        let blob_key = keys::job(&job.job_id, &format!("segments/{:04}.wav", plan.idx));
        services
            .storage
            .put(
                &blob_key,
                Bytes::from(wav),
                BlobMetadata {
                    content_type: "audio/wav".to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(blob_err)?;
        segments.push(SegmentRef {
            idx: plan.idx,
            blob_key,
            start_ms: plan.start_ms,
            end_ms: plan.end_ms,
        });
    }

    tracing::info!(job_id = %job.job_id, segment_count = segments.len(), "segmented audio");
    services
        .checkpointer
        .save(&job.job_id, Stage::Segmenting, &SegmentingState { segments })
}

async fn detecting_language(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let segmenting: SegmentingState = services
        .checkpointer
        .load(&job.job_id, Stage::Segmenting)?
        .ok_or_else(|| CoreError::Internal("segmenting checkpoint missing".to_string()))?;

    let state = match (job.language.clone(), segmenting.segments.first()) {
        // Caller pinned the language; no provider call needed.
        (Some(language), _) => DetectingLanguageState {
            detected_language: language,
            confidence: 1.0,
        },
        (None, None) => DetectingLanguageState {
            detected_language: "en".to_string(),
            confidence: 0.0,
        },
        (None, Some(first)) => {
            let audio = services.storage.get(&first.blob_key).await.map_err(blob_err)?;
            let request = TranscribeRequest {
                audio,
                filename: "segment_0000.wav".to_string(),
                content_type: "audio/wav".to_string(),
                language: None,
                session_id: None,
                chunk_idx: Some(first.idx),
                timeout: segment_timeout(first),
            };
            let transcription = services.stt.transcribe(&request).await?;
            DetectingLanguageState {
                detected_language: transcription.language,
                confidence: transcription.confidence,
            }
        }
    };

    job.detected_language = Some(state.detected_language.clone());
    services
        .checkpointer
        .save(&job.job_id, Stage::DetectingLanguage, &state)
}

fn segment_timeout(segment: &SegmentRef) -> Duration {
    let span = Duration::from_millis(segment.end_ms.saturating_sub(segment.start_ms));
    (span * 3).max(MIN_SEGMENT_TIMEOUT)
}

async fn transcribing(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let segmenting: SegmentingState = services
        .checkpointer
        .load(&job.job_id, Stage::Segmenting)?
        .ok_or_else(|| CoreError::Internal("segmenting checkpoint missing".to_string()))?;

    let mut state: TranscribingState = services
        .checkpointer
        .load(&job.job_id, Stage::Transcribing)?
        .unwrap_or_default();

    let total = segmenting.segments.len();
    let pending: Vec<SegmentRef> = segmenting
        .segments
        .iter()
        .filter(|s| !state.results.contains_key(&s.idx))
        .cloned()
        .collect();
    tracing::info!(
        job_id = %job.job_id,
        total,
        pending = pending.len(),
        "transcribing segments"
    );

    let language = job.detected_language.clone().or_else(|| job.language.clone());
    let mut in_flight = futures::stream::iter(pending.into_iter().map(|segment| {
        let services = services.clone();
        let language = language.clone();
        async move {
            let audio = services
                .storage
                .get(&segment.blob_key)
                .await
                .map_err(blob_err)?;
            let request = TranscribeRequest {
                audio,
                filename: format!("segment_{:04}.wav", segment.idx),
                content_type: "audio/wav".to_string(),
                language,
                session_id: None,
                chunk_idx: Some(segment.idx),
                timeout: segment_timeout(&segment),
            };
            let transcription = services.stt.transcribe(&request).await?;
            // Provider timestamps are segment-relative.
            let words: Vec<Word> = transcription
                .words
                .into_iter()
                .map(|w| Word {
                    start_ms: w.start_ms + segment.start_ms,
                    end_ms: w.end_ms + segment.start_ms,
                    ..w
                })
                .collect();
            Ok::<(u32, Vec<Word>), CoreError>((segment.idx, words))
        }
    }))
    .buffer_unordered(services.cfg.transcribe_concurrency.max(1));

    while let Some(finished) = in_flight.next().await {
        let (idx, words) = finished?;
        state.results.insert(idx, words);
        // Durable after each segment: a crash or retry resumes here.
        services
            .checkpointer
            .save(&job.job_id, Stage::Transcribing, &state)?;
        job.stage_progress.insert(
            Stage::Transcribing.as_str().to_string(),
            state.results.len() as f64 / total.max(1) as f64 * 100.0,
        );
        job.updated_at = chrono::Utc::now();
        services.repo.update(job)?;
    }
    drop(in_flight);

    state.completed = true;
    services
        .checkpointer
        .save(&job.job_id, Stage::Transcribing, &state)
}

async fn merging(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let segmenting: SegmentingState = services
        .checkpointer
        .load(&job.job_id, Stage::Segmenting)?
        .ok_or_else(|| CoreError::Internal("segmenting checkpoint missing".to_string()))?;
    let transcribed: TranscribingState = services
        .checkpointer
        .load(&job.job_id, Stage::Transcribing)?
        .ok_or_else(|| CoreError::Internal("transcribing checkpoint missing".to_string()))?;

    let overlap_ms = services.cfg.segment_overlap_ms;
    let mut merged: Vec<Word> = Vec::new();
    for segment in &segmenting.segments {
        let Some(words) = transcribed.results.get(&segment.idx) else {
            return Err(CoreError::Internal(format!(
                "segment {} missing from transcribing checkpoint",
                segment.idx
            )));
        };
        let avg_confidence = murmur_transcript::mean_confidence(words).unwrap_or(0.0);
        merged = resolve_overlap(
            merged,
            words.clone(),
            segment.start_ms.saturating_sub(overlap_ms),
            segment.start_ms + overlap_ms,
            avg_confidence,
        );
    }

    job.word_count = Some(merged.len());
    tracing::info!(job_id = %job.job_id, word_count = merged.len(), "merged segment transcripts");
    services.checkpointer.save(
        &job.job_id,
        Stage::Merging,
        &MergingState {
            merged_words: merged,
        },
    )
}

async fn diarizing(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let merged: MergingState = services
        .checkpointer
        .load(&job.job_id, Stage::Merging)?
        .ok_or_else(|| CoreError::Internal("merging checkpoint missing".to_string()))?;

    let words_with_speaker = annotate(&merged.merged_words, services.diarizer.as_ref());
    let speakers = words_with_speaker
        .iter()
        .map(|w| w.speaker_id)
        .collect::<std::collections::BTreeSet<i32>>();
    tracing::info!(
        job_id = %job.job_id,
        speaker_count = speakers.len(),
        "annotated speakers"
    );
    services.checkpointer.save(
        &job.job_id,
        Stage::Diarizing,
        &DiarizingState { words_with_speaker },
    )
}

async fn generating_outputs(services: &PipelineServices, job: &mut TranscriptionJob) -> Result<()> {
    let merged: MergingState = services
        .checkpointer
        .load(&job.job_id, Stage::Merging)?
        .ok_or_else(|| CoreError::Internal("merging checkpoint missing".to_string()))?;
    let words = merged.merged_words;
    let created_at = chrono::Utc::now();

    let mut artifact_keys = BTreeMap::new();
    for kind in ArtifactKind::ALL {
        let content = kind.render(&job.job_id, &words, created_at);
        let blob_key = keys::job(&job.job_id, &format!("transcript.{kind}"));
        let bytes = Bytes::from(content.into_bytes());
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let size = bytes.len() as u64;

        services
            .storage
            .put(
                &blob_key,
                bytes.clone(),
                BlobMetadata {
                    content_type: kind.content_type().to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(blob_err)?;

        services.repo.save_artifact(&crate::job::ArtifactRecord {
            job_id: job.job_id.clone(),
            kind: kind.as_str().to_string(),
            blob_key: blob_key.clone(),
            size,
            sha256,
            content_type: kind.content_type().to_string(),
            created_at,
        })?;

        services
            .cache
            .set(
                &murmur_cache::keys::transcription(&job.job_id, kind.as_str()),
                bytes.to_vec(),
                murmur_cache::Ttl::Default,
            )
            .await;

        artifact_keys.insert(kind.as_str().to_string(), blob_key);
    }

    job.word_count = Some(words.len());
    job.artifact_keys = artifact_keys.clone();
    services.checkpointer.save(
        &job.job_id,
        Stage::GeneratingOutputs,
        &GeneratingOutputsState { artifact_keys },
    )
}
