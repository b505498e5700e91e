//! Ephemeral per-session storage: chunk records, rolling state, and the
//! cached finalization result.
//!
//! The Redis layout follows the persisted key contract:
//! `session:{sid}:chunks` (hash of chunk records),
//! `meeting:{sid}:rolling` (hash of rolling-state fields), and
//! `meeting:{sid}:final` for the finalize cache. Every key carries the
//! session TTL so abandoned sessions age out.

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::state::{ChunkRecord, RollingState};
use crate::Result;

#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    async fn put_chunk_record(&self, session_id: &str, record: &ChunkRecord) -> Result<()>;

    /// All recorded chunks, ascending by index.
    async fn chunk_records(&self, session_id: &str) -> Result<Vec<ChunkRecord>>;

    async fn load_rolling(&self, session_id: &str) -> Result<Option<RollingState>>;

    async fn save_rolling(&self, session_id: &str, state: &RollingState) -> Result<()>;

    /// Cache the finalization result so repeated finalize calls return
    /// the same artifacts.
    async fn save_final(&self, session_id: &str, payload: &str) -> Result<()>;

    async fn load_final(&self, session_id: &str) -> Result<Option<String>>;
}

fn chunks_key(session_id: &str) -> String {
    format!("session:{session_id}:chunks")
}

fn rolling_key(session_id: &str) -> String {
    format!("meeting:{session_id}:rolling")
}

fn final_key(session_id: &str) -> String {
    format!("meeting:{session_id}:final")
}

pub struct RedisChunkStore {
    conn: ConnectionManager,
    ttl_s: i64,
}

impl RedisChunkStore {
    pub fn new(conn: ConnectionManager, ttl_s: u64) -> Self {
        Self {
            conn,
            ttl_s: ttl_s as i64,
        }
    }
}

#[async_trait::async_trait]
impl ChunkStore for RedisChunkStore {
    async fn put_chunk_record(&self, session_id: &str, record: &ChunkRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = chunks_key(session_id);
        let field = format!("chunk_{}", record.idx);
        let payload = serde_json::to_string(record)?;
        conn.hset::<_, _, _, ()>(&key, field, payload).await?;
        conn.expire::<_, ()>(&key, self.ttl_s).await?;
        Ok(())
    }

    async fn chunk_records(&self, session_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, String> =
            conn.hgetall(chunks_key(session_id)).await?;
        let mut records: Vec<ChunkRecord> = raw
            .values()
            .filter_map(|v| serde_json::from_str(v).ok())
            .collect();
        records.sort_by_key(|r| r.idx);
        Ok(records)
    }

    async fn load_rolling(&self, session_id: &str) -> Result<Option<RollingState>> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, String> =
            conn.hgetall(rolling_key(session_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| raw.get(name).cloned().unwrap_or_default();
        Ok(Some(RollingState {
            last_committed_ms: field("last_committed_ms").parse().unwrap_or(0),
            tail_buffer: serde_json::from_str(&field("tail_buffer")).unwrap_or_default(),
            received_idx_set: serde_json::from_str(&field("received_idx_set"))
                .unwrap_or_default(),
            last_seq: field("last_seq").parse().unwrap_or(-1),
            updated_at: field("updated_at")
                .parse()
                .unwrap_or_else(|_| chrono::Utc::now()),
            committed_words: serde_json::from_str(&field("committed_words")).unwrap_or_default(),
        }))
    }

    async fn save_rolling(&self, session_id: &str, state: &RollingState) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = rolling_key(session_id);
        let fields = [
            ("last_committed_ms", state.last_committed_ms.to_string()),
            ("tail_buffer", serde_json::to_string(&state.tail_buffer)?),
            (
                "received_idx_set",
                serde_json::to_string(&state.received_idx_set)?,
            ),
            ("last_seq", state.last_seq.to_string()),
            ("updated_at", state.updated_at.to_rfc3339()),
            (
                "committed_words",
                serde_json::to_string(&state.committed_words)?,
            ),
        ];
        conn.hset_multiple::<_, _, _, ()>(&key, &fields).await?;
        conn.expire::<_, ()>(&key, self.ttl_s).await?;
        Ok(())
    }

    async fn save_final(&self, session_id: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(final_key(session_id), payload, self.ttl_s as u64)
            .await?;
        Ok(())
    }

    async fn load_final(&self, session_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(final_key(session_id)).await?)
    }
}

/// DashMap-backed store for tests and Redis-less deployments. TTLs are
/// not enforced here; the dispatcher's idle shutdown bounds its growth.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: DashMap<String, Vec<ChunkRecord>>,
    rolling: DashMap<String, RollingState>,
    finals: DashMap<String, String>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put_chunk_record(&self, session_id: &str, record: &ChunkRecord) -> Result<()> {
        let mut entry = self.chunks.entry(session_id.to_string()).or_default();
        match entry.iter_mut().find(|r| r.idx == record.idx) {
            Some(existing) => *existing = record.clone(),
            None => entry.push(record.clone()),
        }
        Ok(())
    }

    async fn chunk_records(&self, session_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut records = self
            .chunks
            .get(session_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        records.sort_by_key(|r| r.idx);
        Ok(records)
    }

    async fn load_rolling(&self, session_id: &str) -> Result<Option<RollingState>> {
        Ok(self.rolling.get(session_id).map(|s| s.clone()))
    }

    async fn save_rolling(&self, session_id: &str, state: &RollingState) -> Result<()> {
        self.rolling.insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn save_final(&self, session_id: &str, payload: &str) -> Result<()> {
        self.finals
            .insert(session_id.to_string(), payload.to_string());
        Ok(())
    }

    async fn load_final(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.finals.get(session_id).map(|p| p.clone()))
    }
}
