//! SQLite persistence for upload sessions, jobs, checkpoints, and
//! artifact rows.
//!
//! One [`Database`] handle implements the repository traits the ingest
//! and pipeline crates define. Nested maps are stored as JSON columns;
//! the columns that queries filter on (owner, status, timestamps) are
//! first-class.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use murmur_ingest::{IngestError, SessionRepository, SessionStatus, UploadSession};
use murmur_pipeline::{
    ArtifactRecord, CheckpointStore, JobRepository, JobStatus, Stage, TranscriptionJob,
};
use murmur_transcript::CoreError;
use rusqlite::Connection;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                chunks_json TEXT NOT NULL,
                final_blob_key TEXT,
                sha256 TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                job_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                job_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (job_id, stage)
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                blob_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                content_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (job_id, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status_expiry
                ON upload_sessions(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_owner_created
                ON jobs(owner_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_status_updated
                ON jobs(status, updated_at);
            "#,
        )?;
        Ok(())
    }
}

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn ingest_err(err: impl std::fmt::Display) -> IngestError {
    IngestError::Repo(err.to_string())
}

fn core_err(err: impl std::fmt::Display) -> CoreError {
    CoreError::Internal(format!("job store: {err}"))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadSession> {
    let chunks_json: String = row.get("chunks_json")?;
    let chunks_uploaded: BTreeSet<u32> = serde_json::from_str(&chunks_json).unwrap_or_default();
    let status_str: String = row.get("status")?;
    Ok(UploadSession {
        upload_id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        filename: row.get("filename")?,
        total_size: row.get::<_, i64>("total_size")? as u64,
        mime_type: row.get("mime_type")?,
        chunk_size: row.get::<_, i64>("chunk_size")? as u64,
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Expired),
        chunks_uploaded,
        final_blob_key: row.get("final_blob_key")?,
        sha256: row.get("sha256")?,
        created_at: from_ts(row.get("created_at")?),
        expires_at: from_ts(row.get("expires_at")?),
    })
}

impl SessionRepository for Database {
    fn create(&self, session: &UploadSession) -> murmur_ingest::Result<()> {
        let chunks_json =
            serde_json::to_string(&session.chunks_uploaded).map_err(ingest_err)?;
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO upload_sessions
             (id, owner_id, filename, total_size, mime_type, chunk_size, status,
              chunks_json, final_blob_key, sha256, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            (
                &session.upload_id,
                &session.owner_id,
                &session.filename,
                session.total_size as i64,
                &session.mime_type,
                session.chunk_size as i64,
                session.status.as_str(),
                chunks_json,
                &session.final_blob_key,
                &session.sha256,
                ts(session.created_at),
                ts(session.expires_at),
            ),
        )
        .map_err(ingest_err)?;
        Ok(())
    }

    fn get(&self, upload_id: &str) -> murmur_ingest::Result<Option<UploadSession>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM upload_sessions WHERE id = ?1")
            .map_err(ingest_err)?;
        let session = stmt
            .query_row([upload_id], row_to_session)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(ingest_err(other)),
            })?;
        Ok(session)
    }

    fn add_chunk(&self, upload_id: &str, idx: u32) -> murmur_ingest::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let chunks_json: String = conn
            .query_row(
                "SELECT chunks_json FROM upload_sessions WHERE id = ?1",
                [upload_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    IngestError::SessionNotFound(upload_id.to_string())
                }
                other => ingest_err(other),
            })?;
        let mut chunks: BTreeSet<u32> = serde_json::from_str(&chunks_json).unwrap_or_default();
        chunks.insert(idx);
        conn.execute(
            "UPDATE upload_sessions SET chunks_json = ?1 WHERE id = ?2",
            (serde_json::to_string(&chunks).map_err(ingest_err)?, upload_id),
        )
        .map_err(ingest_err)?;
        Ok(())
    }

    fn set_status(&self, upload_id: &str, status: SessionStatus) -> murmur_ingest::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE upload_sessions SET status = ?1 WHERE id = ?2",
                (status.as_str(), upload_id),
            )
            .map_err(ingest_err)?;
        if affected == 0 {
            return Err(IngestError::SessionNotFound(upload_id.to_string()));
        }
        Ok(())
    }

    fn complete(&self, upload_id: &str, blob_key: &str, sha256: &str) -> murmur_ingest::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE upload_sessions
                 SET status = 'completed', final_blob_key = ?1, sha256 = ?2
                 WHERE id = ?3",
                (blob_key, sha256, upload_id),
            )
            .map_err(ingest_err)?;
        if affected == 0 {
            return Err(IngestError::SessionNotFound(upload_id.to_string()));
        }
        Ok(())
    }

    fn delete(&self, upload_id: &str) -> murmur_ingest::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute("DELETE FROM upload_sessions WHERE id = ?1", [upload_id])
            .map_err(ingest_err)?;
        Ok(())
    }

    fn list_expired(&self, now: DateTime<Utc>) -> murmur_ingest::Result<Vec<UploadSession>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT * FROM upload_sessions
                 WHERE status = 'active' AND expires_at <= ?1",
            )
            .map_err(ingest_err)?;
        let rows = stmt
            .query_map([ts(now)], row_to_session)
            .map_err(ingest_err)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(ingest_err)?);
        }
        Ok(sessions)
    }
}

impl JobRepository for Database {
    fn create(&self, job: &TranscriptionJob) -> murmur_pipeline::Result<()> {
        let job_json = serde_json::to_string(job).map_err(core_err)?;
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO jobs (id, owner_id, status, created_at, updated_at, job_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &job.job_id,
                &job.owner_id,
                job.status.as_str(),
                ts(job.created_at),
                ts(job.updated_at),
                job_json,
            ),
        )
        .map_err(core_err)?;
        Ok(())
    }

    fn get(&self, job_id: &str) -> murmur_pipeline::Result<Option<TranscriptionJob>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let job_json: Option<String> = conn
            .query_row("SELECT job_json FROM jobs WHERE id = ?1", [job_id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(core_err(other)),
            })?;
        match job_json {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(core_err)?)),
            None => Ok(None),
        }
    }

    fn update(&self, job: &TranscriptionJob) -> murmur_pipeline::Result<()> {
        let job_json = serde_json::to_string(job).map_err(core_err)?;
        let conn = self.conn.lock().expect("database mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE jobs SET owner_id = ?1, status = ?2, updated_at = ?3, job_json = ?4
                 WHERE id = ?5",
                (
                    &job.owner_id,
                    job.status.as_str(),
                    ts(job.updated_at),
                    job_json,
                    &job.job_id,
                ),
            )
            .map_err(core_err)?;
        if affected == 0 {
            return Err(CoreError::NotFound(format!("job {}", job.job_id)));
        }
        Ok(())
    }

    fn delete(&self, job_id: &str) -> murmur_pipeline::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute("DELETE FROM jobs WHERE id = ?1", [job_id])
            .map_err(core_err)?;
        Ok(())
    }

    fn list_for_user(
        &self,
        owner_id: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> murmur_pipeline::Result<Vec<TranscriptionJob>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut json_rows: Vec<String> = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT job_json FROM jobs
                         WHERE owner_id = ?1 AND status = ?2
                         ORDER BY created_at DESC LIMIT ?3",
                    )
                    .map_err(core_err)?;
                let rows = stmt
                    .query_map((owner_id, status.as_str(), limit as i64), |row| {
                        row.get::<_, String>(0)
                    })
                    .map_err(core_err)?;
                for row in rows {
                    json_rows.push(row.map_err(core_err)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT job_json FROM jobs
                         WHERE owner_id = ?1
                         ORDER BY created_at DESC LIMIT ?2",
                    )
                    .map_err(core_err)?;
                let rows = stmt
                    .query_map((owner_id, limit as i64), |row| row.get::<_, String>(0))
                    .map_err(core_err)?;
                for row in rows {
                    json_rows.push(row.map_err(core_err)?);
                }
            }
        }
        let mut jobs = Vec::new();
        for json in json_rows {
            jobs.push(serde_json::from_str(&json).map_err(core_err)?);
        }
        Ok(jobs)
    }

    fn list_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> murmur_pipeline::Result<Vec<TranscriptionJob>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT job_json FROM jobs
                 WHERE status = 'processing' AND updated_at < ?1",
            )
            .map_err(core_err)?;
        let rows = stmt
            .query_map([ts(cutoff)], |row| row.get::<_, String>(0))
            .map_err(core_err)?;
        let mut jobs = Vec::new();
        for row in rows {
            let json = row.map_err(core_err)?;
            jobs.push(serde_json::from_str(&json).map_err(core_err)?);
        }
        Ok(jobs)
    }

    fn save_artifact(&self, artifact: &ArtifactRecord) -> murmur_pipeline::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO artifacts
             (job_id, kind, blob_key, size, sha256, content_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &artifact.job_id,
                &artifact.kind,
                &artifact.blob_key,
                artifact.size as i64,
                &artifact.sha256,
                &artifact.content_type,
                ts(artifact.created_at),
            ),
        )
        .map_err(core_err)?;
        Ok(())
    }

    fn artifacts_for_job(&self, job_id: &str) -> murmur_pipeline::Result<Vec<ArtifactRecord>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT job_id, kind, blob_key, size, sha256, content_type, created_at
                 FROM artifacts WHERE job_id = ?1 ORDER BY kind",
            )
            .map_err(core_err)?;
        let rows = stmt
            .query_map([job_id], |row| {
                Ok(ArtifactRecord {
                    job_id: row.get(0)?,
                    kind: row.get(1)?,
                    blob_key: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                    sha256: row.get(4)?,
                    content_type: row.get(5)?,
                    created_at: from_ts(row.get(6)?),
                })
            })
            .map_err(core_err)?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.map_err(core_err)?);
        }
        Ok(artifacts)
    }

    fn delete_artifacts(&self, job_id: &str) -> murmur_pipeline::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute("DELETE FROM artifacts WHERE job_id = ?1", [job_id])
            .map_err(core_err)?;
        Ok(())
    }
}

impl CheckpointStore for Database {
    fn save(
        &self,
        job_id: &str,
        stage: Stage,
        state: &serde_json::Value,
    ) -> murmur_pipeline::Result<()> {
        let state_json = serde_json::to_string(state).map_err(core_err)?;
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (job_id, stage, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            (job_id, stage.as_str(), state_json, ts(Utc::now())),
        )
        .map_err(core_err)?;
        Ok(())
    }

    fn load(&self, job_id: &str, stage: Stage) -> murmur_pipeline::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let state_json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM checkpoints WHERE job_id = ?1 AND stage = ?2",
                (job_id, stage.as_str()),
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(core_err(other)),
            })?;
        match state_json {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(core_err)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, job_id: &str, stage: Stage) -> murmur_pipeline::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute(
            "DELETE FROM checkpoints WHERE job_id = ?1 AND stage = ?2",
            (job_id, stage.as_str()),
        )
        .map_err(core_err)?;
        Ok(())
    }

    fn delete_all(&self, job_id: &str) -> murmur_pipeline::Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute("DELETE FROM checkpoints WHERE job_id = ?1", [job_id])
            .map_err(core_err)?;
        Ok(())
    }
}
