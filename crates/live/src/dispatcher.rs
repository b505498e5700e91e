//! Per-session chunk dispatch and finalization.
//!
//! The HTTP layer hands a chunk off and returns immediately; one worker
//! task per session consumes chunks in arrival order, which keeps the
//! rolling state single-writer without locks. Workers shut down after the
//! configured idle window and are respawned on the next chunk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_blobstore::{keys, BlobMetadata, Storage};
use murmur_config::LiveConfig;
use murmur_stt::{SttFacade, TranscribeRequest};
use murmur_transcript::{ArtifactKind, Word};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::{EventKind, EventSink};
use crate::merge::{merge_chunk, MergeConfig};
use crate::state::{ChunkRecord, RollingState};
use crate::{ChunkStore, LiveError, Result};

/// Bound on how long finalize waits for in-flight chunk transcriptions.
const FINALIZE_DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Poll interval while draining in-flight chunks.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Queue depth per session worker.
const WORKER_QUEUE: usize = 64;

/// Optional per-chunk parameters from the upload form.
#[derive(Debug, Clone, Default)]
pub struct ChunkParams {
    pub sample_rate: Option<u32>,
    pub codec: Option<String>,
    pub chunk_ms: Option<u64>,
    pub overlap_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub blob_key: String,
    pub url: String,
}

/// The finalize response; cached so finalizing twice returns the same
/// artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedSession {
    pub session_id: String,
    pub transcript: String,
    pub word_count: usize,
    pub duration_ms: u64,
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub finalized_at: DateTime<Utc>,
}

/// Snapshot of the current rolling transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveTranscript {
    pub session_id: String,
    pub text: String,
    pub words: Vec<Word>,
    pub committed_words: usize,
    pub tail_words: usize,
    pub updated_at: DateTime<Utc>,
}

struct ChunkTask {
    chunk_idx: u32,
    audio: Bytes,
    chunk_ms: u64,
    overlap_ms: u64,
}

struct SessionHandle {
    tx: mpsc::Sender<ChunkTask>,
}

struct Inner {
    chunk_store: Arc<dyn ChunkStore>,
    events: Arc<dyn EventSink>,
    stt: Arc<SttFacade>,
    storage: Storage,
    cfg: LiveConfig,
    stt_timeout: Duration,
    sessions: DashMap<String, SessionHandle>,
    pending: DashMap<String, Arc<AtomicUsize>>,
}

#[derive(Clone)]
pub struct LiveService {
    inner: Arc<Inner>,
}

impl LiveService {
    pub fn new(
        chunk_store: Arc<dyn ChunkStore>,
        events: Arc<dyn EventSink>,
        stt: Arc<SttFacade>,
        storage: Storage,
        cfg: LiveConfig,
        stt_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                chunk_store,
                events,
                stt,
                storage,
                cfg,
                stt_timeout,
                sessions: DashMap::new(),
                pending: DashMap::new(),
            }),
        }
    }

    /// Persist an audio chunk and queue it for transcription. Returns as
    /// soon as the chunk is durable; processing continues in the
    /// session's worker.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_idx: u32,
        audio: Bytes,
        owner_id: &str,
        params: ChunkParams,
    ) -> Result<()> {
        let blob_key = keys::live_chunk(session_id, chunk_idx);
        let content_type = match params.codec.as_deref() {
            Some("opus") | Some("webm") => "audio/webm",
            Some("ogg") => "audio/ogg",
            _ => "audio/wav",
        };
        self.inner
            .storage
            .put(
                &blob_key,
                audio.clone(),
                BlobMetadata {
                    content_type: content_type.to_string(),
                    ..Default::default()
                },
            )
            .await?;

        let chunk_ms = params.chunk_ms.unwrap_or(self.inner.cfg.chunk_ms);
        let overlap_ms = params.overlap_ms.unwrap_or(self.inner.cfg.overlap_ms);
        let record = ChunkRecord {
            idx: chunk_idx,
            blob_key,
            size: audio.len() as u64,
            sample_rate: params.sample_rate,
            codec: params.codec,
            chunk_ms,
            overlap_ms,
            uploaded_at: Utc::now(),
            owner_id: owner_id.to_string(),
        };
        self.inner
            .chunk_store
            .put_chunk_record(session_id, &record)
            .await?;

        self.enqueue(
            session_id,
            ChunkTask {
                chunk_idx,
                audio,
                chunk_ms,
                overlap_ms,
            },
        )
        .await;
        tracing::info!(session_id, chunk_idx, "chunk accepted, processing started");
        Ok(())
    }

    async fn enqueue(&self, session_id: &str, task: ChunkTask) {
        let pending = self
            .inner
            .pending
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        pending.fetch_add(1, Ordering::SeqCst);

        let mut task = task;
        loop {
            let tx = {
                let handle = self
                    .inner
                    .sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| self.spawn_worker(session_id, pending.clone()));
                handle.tx.clone()
            };
            match tx.send(task).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // Worker exited between lookup and send; respawn.
                    self.inner.sessions.remove(session_id);
                    task = returned;
                }
            }
        }
    }

    fn spawn_worker(&self, session_id: &str, pending: Arc<AtomicUsize>) -> SessionHandle {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        tokio::spawn(worker_loop(inner, session_id, rx, pending));
        SessionHandle { tx }
    }

    /// Chunks accepted but not yet merged.
    pub fn pending_chunks(&self, session_id: &str) -> usize {
        self.inner
            .pending
            .get(session_id)
            .map(|p| p.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Error unless the session exists and belongs to `owner_id`.
    pub async fn verify_owner(&self, session_id: &str, owner_id: &str) -> Result<()> {
        let records = self.inner.chunk_store.chunk_records(session_id).await?;
        if records.is_empty() {
            return Err(LiveError::SessionNotFound(session_id.to_string()));
        }
        if records.iter().any(|r| r.owner_id != owner_id) {
            return Err(LiveError::NotOwner);
        }
        Ok(())
    }

    pub async fn live_transcript(&self, session_id: &str) -> Result<LiveTranscript> {
        let state = match self.inner.chunk_store.load_rolling(session_id).await? {
            Some(state) => state,
            None => {
                let records = self.inner.chunk_store.chunk_records(session_id).await?;
                if records.is_empty() {
                    return Err(LiveError::SessionNotFound(session_id.to_string()));
                }
                RollingState::new()
            }
        };
        let words = state.full_words();
        Ok(LiveTranscript {
            session_id: session_id.to_string(),
            text: murmur_transcript::join_words(&words),
            committed_words: state.committed_words.len(),
            tail_words: state.tail_buffer.len(),
            updated_at: state.updated_at,
            words,
        })
    }

    pub async fn events(
        &self,
        session_id: &str,
        kind: Option<EventKind>,
    ) -> Result<Vec<crate::events::EventEnvelope>> {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => EventKind::ALL.to_vec(),
        };
        self.inner.events.fetch(session_id, &kinds).await
    }

    /// Close the session: drain in-flight work for a bounded time,
    /// collapse the tail buffer, emit `final`, and write the artifacts.
    pub async fn finalize(&self, session_id: &str, owner_id: &str) -> Result<FinalizedSession> {
        let records = self.inner.chunk_store.chunk_records(session_id).await?;
        if records.is_empty() {
            return Err(LiveError::SessionNotFound(session_id.to_string()));
        }
        if records.iter().any(|r| r.owner_id != owner_id) {
            return Err(LiveError::NotOwner);
        }

        if let Some(cached) = self.inner.chunk_store.load_final(session_id).await? {
            tracing::debug!(session_id, "returning cached finalization");
            return Ok(serde_json::from_str(&cached)?);
        }

        self.drain_in_flight(session_id).await;

        let mut state = self
            .inner
            .chunk_store
            .load_rolling(session_id)
            .await?
            .unwrap_or_default();

        // Collapse the tail even though it never crossed the commit
        // boundary; finalize is the boundary.
        let tail = std::mem::take(&mut state.tail_buffer);
        state.committed_words.extend(tail);
        state.committed_words = murmur_transcript::sort_and_dedup(state.committed_words);
        state.last_committed_ms = murmur_transcript::duration_ms(&state.committed_words);
        state.updated_at = Utc::now();
        self.inner.chunk_store.save_rolling(session_id, &state).await?;

        let words = state.committed_words;
        let transcript = murmur_transcript::join_words(&words);
        let duration_ms = murmur_transcript::duration_ms(&words);
        let finalized_at = Utc::now();

        self.inner
            .events
            .publish(
                session_id,
                EventKind::Final,
                serde_json::json!({
                    "session_id": session_id,
                    "text": transcript,
                    "word_count": words.len(),
                    "duration_ms": duration_ms,
                    "finalized_at": finalized_at,
                }),
            )
            .await?;

        let mut artifacts = BTreeMap::new();
        for kind in ArtifactKind::ALL {
            let content = kind.render(session_id, &words, finalized_at);
            let blob_key = format!("sessions/{session_id}/transcript.{kind}");
            self.inner
                .storage
                .put(
                    &blob_key,
                    Bytes::from(content.into_bytes()),
                    BlobMetadata {
                        content_type: kind.content_type().to_string(),
                        ..Default::default()
                    },
                )
                .await?;
            let url = self
                .inner
                .storage
                .get_url(&blob_key, Duration::from_secs(3600))
                .await?;
            artifacts.insert(kind.as_str().to_string(), ArtifactRef { blob_key, url });
        }

        let finalized = FinalizedSession {
            session_id: session_id.to_string(),
            transcript,
            word_count: words.len(),
            duration_ms,
            artifacts,
            finalized_at,
        };
        self.inner
            .chunk_store
            .save_final(session_id, &serde_json::to_string(&finalized)?)
            .await?;
        self.inner.pending.remove(session_id);

        tracing::info!(
            session_id,
            word_count = finalized.word_count,
            duration_ms,
            "session finalized"
        );
        Ok(finalized)
    }

    async fn drain_in_flight(&self, session_id: &str) {
        let deadline = tokio::time::Instant::now() + FINALIZE_DRAIN_BUDGET;
        while self.pending_chunks(session_id) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let leftover = self.pending_chunks(session_id);
        if leftover > 0 {
            tracing::warn!(
                session_id,
                leftover,
                "finalizing with chunks still in flight"
            );
        }
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    session_id: String,
    mut rx: mpsc::Receiver<ChunkTask>,
    pending: Arc<AtomicUsize>,
) {
    let idle = Duration::from_secs(inner.cfg.idle_timeout_s);
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(task)) => {
                if let Err(e) = process_chunk(&inner, &session_id, &task).await {
                    tracing::warn!(
                        session_id,
                        chunk_idx = task.chunk_idx,
                        error = %e,
                        "chunk processing failed"
                    );
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(session_id, "session idle, worker shutting down");
                inner.sessions.remove(&session_id);
                break;
            }
        }
    }
}

async fn process_chunk(inner: &Inner, session_id: &str, task: &ChunkTask) -> Result<()> {
    let request = TranscribeRequest {
        audio: task.audio.clone(),
        filename: format!("chunk_{}.wav", task.chunk_idx),
        content_type: "audio/wav".to_string(),
        language: None,
        session_id: Some(session_id.to_string()),
        chunk_idx: Some(task.chunk_idx),
        timeout: inner.stt_timeout,
    };

    let transcription = inner
        .stt
        .transcribe(&request)
        .await
        .map_err(|e| LiveError::Store(format!("stt: {e}")))?;

    let chunk_start_ms = task.chunk_idx as u64 * task.chunk_ms;
    // Provider timestamps are chunk-relative; shift onto the session
    // timeline before merging.
    let words: Vec<Word> = transcription
        .words
        .into_iter()
        .map(|w| Word {
            start_ms: w.start_ms + chunk_start_ms,
            end_ms: w.end_ms + chunk_start_ms,
            ..w
        })
        .collect();

    let mut state = inner
        .chunk_store
        .load_rolling(session_id)
        .await?
        .unwrap_or_default();

    let merge_cfg = MergeConfig {
        chunk_ms: task.chunk_ms,
        overlap_ms: task.overlap_ms,
        commit_window_ms: inner.cfg.commit_window_ms,
    };
    let events = merge_chunk(
        &mut state,
        merge_cfg,
        task.chunk_idx,
        words,
        transcription.confidence,
        chunk_start_ms,
    );
    inner.chunk_store.save_rolling(session_id, &state).await?;

    if let Some(commit) = &events.commit {
        inner
            .events
            .publish(session_id, EventKind::Commit, serde_json::to_value(commit)?)
            .await?;
    }
    if let Some(partial) = &events.partial {
        inner
            .events
            .publish(session_id, EventKind::Partial, serde_json::to_value(partial)?)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunkstore::MemoryChunkStore;
    use crate::events::InMemoryEventSink;
    use murmur_blobstore::{LocalStore, ObjectStore};
    use murmur_stt::{MockProvider, Transcription};

    struct Fixture {
        service: LiveService,
        provider: Arc<MockProvider>,
        events: Arc<InMemoryEventSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let provider = Arc::new(MockProvider::new("mock"));
        let events = Arc::new(InMemoryEventSink::new());
        let service = LiveService::new(
            Arc::new(MemoryChunkStore::new()),
            events.clone(),
            Arc::new(SttFacade::new(provider.clone(), None)),
            Storage::new(store),
            LiveConfig::default(),
            Duration::from_secs(30),
        );
        Fixture {
            service,
            provider,
            events,
            _dir: dir,
        }
    }

    fn transcription(words: &[(&str, u64, u64)], confidence: f32) -> Transcription {
        Transcription {
            text: words.iter().map(|w| w.0).collect::<Vec<_>>().join(" "),
            words: words
                .iter()
                .map(|(t, s, e)| Word::new(*t, *s, *e, confidence))
                .collect(),
            confidence,
            language: "en".to_string(),
            duration_s: 5.0,
        }
    }

    async fn wait_idle(service: &LiveService, session_id: &str) {
        for _ in 0..100 {
            if service.pending_chunks(session_id) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatcher did not drain");
    }

    #[tokio::test]
    async fn test_chunk_flows_into_rolling_state() {
        let fx = fixture();
        fx.provider
            .push_ok(transcription(&[("hello", 0, 400), ("world", 400, 900)], 0.9));

        fx.service
            .upload_chunk("s1", 0, Bytes::from_static(b"pcm"), "u1", ChunkParams::default())
            .await
            .unwrap();
        wait_idle(&fx.service, "s1").await;

        let live = fx.service.live_transcript("s1").await.unwrap();
        assert_eq!(live.text, "hello world");
        assert_eq!(live.tail_words, 2);

        let events = fx.events.all_for("s1");
        assert!(events.iter().any(|e| e.kind == EventKind::Partial));
    }

    #[tokio::test]
    async fn test_finalize_collapses_tail_and_caches() {
        let fx = fixture();
        fx.provider
            .push_ok(transcription(&[("only", 0, 300), ("take", 300, 700)], 0.9));

        fx.service
            .upload_chunk("s1", 0, Bytes::from_static(b"pcm"), "u1", ChunkParams::default())
            .await
            .unwrap();
        wait_idle(&fx.service, "s1").await;

        let first = fx.service.finalize("s1", "u1").await.unwrap();
        assert_eq!(first.transcript, "only take");
        assert_eq!(first.word_count, 2);
        assert_eq!(first.artifacts.len(), 4);
        assert!(first.artifacts.contains_key("txt"));
        assert!(first.artifacts.contains_key("vtt"));

        // Finalizing again returns the cached result byte-for-byte.
        let second = fx.service.finalize("s1", "u1").await.unwrap();
        assert_eq!(second.finalized_at, first.finalized_at);
        assert_eq!(second.artifacts["json"].blob_key, first.artifacts["json"].blob_key);

        let events = fx.events.all_for("s1");
        assert!(events.iter().any(|e| e.kind == EventKind::Final));
    }

    #[tokio::test]
    async fn test_finalize_rejects_wrong_owner() {
        let fx = fixture();
        fx.provider.push_ok(transcription(&[("x", 0, 100)], 0.9));
        fx.service
            .upload_chunk("s1", 0, Bytes::from_static(b"pcm"), "u1", ChunkParams::default())
            .await
            .unwrap();
        wait_idle(&fx.service, "s1").await;

        assert!(matches!(
            fx.service.finalize("s1", "intruder").await,
            Err(LiveError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.service.live_transcript("ghost").await,
            Err(LiveError::SessionNotFound(_))
        ));
        assert!(matches!(
            fx.service.finalize("ghost", "u1").await,
            Err(LiveError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_produce_sorted_words() {
        let fx = fixture();
        // Arrival order 2, 0, 1; timestamps are chunk-relative.
        fx.provider.push_ok(transcription(&[("third", 0, 800)], 0.9));
        fx.provider.push_ok(transcription(&[("first", 0, 800)], 0.9));
        fx.provider.push_ok(transcription(&[("second", 0, 800)], 0.9));

        for idx in [2u32, 0, 1] {
            fx.service
                .upload_chunk("s2", idx, Bytes::from_static(b"pcm"), "u1", ChunkParams::default())
                .await
                .unwrap();
        }
        wait_idle(&fx.service, "s2").await;

        let finalized = fx.service.finalize("s2", "u1").await.unwrap();
        assert_eq!(finalized.transcript, "first second third");

        let json_blob = fx
            .service
            .inner
            .storage
            .get(&finalized.artifacts["json"].blob_key)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&json_blob).unwrap();
        let words = parsed["words"].as_array().unwrap();
        let starts: Vec<u64> = words
            .iter()
            .map(|w| w["start_ms"].as_u64().unwrap())
            .collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted, "json artifact words must be ordered");
    }
}
