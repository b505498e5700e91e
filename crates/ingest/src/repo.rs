//! Session persistence seam. The SQLite implementation lives in the
//! storage crate; the in-memory one backs tests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::session::{SessionStatus, UploadSession};
use crate::{IngestError, Result};

pub trait SessionRepository: Send + Sync {
    fn create(&self, session: &UploadSession) -> Result<()>;

    fn get(&self, upload_id: &str) -> Result<Option<UploadSession>>;

    /// Record a chunk index as uploaded. Duplicate additions are fine.
    fn add_chunk(&self, upload_id: &str, idx: u32) -> Result<()>;

    fn set_status(&self, upload_id: &str, status: SessionStatus) -> Result<()>;

    /// Seal the session with the assembled blob key and digest.
    fn complete(&self, upload_id: &str, blob_key: &str, sha256: &str) -> Result<()>;

    fn delete(&self, upload_id: &str) -> Result<()>;

    /// Active sessions whose `expires_at` has passed.
    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>>;
}

#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: DashMap<String, UploadSession>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, upload_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut UploadSession),
    {
        match self.sessions.get_mut(upload_id) {
            Some(mut session) => {
                mutate(&mut session);
                Ok(())
            }
            None => Err(IngestError::SessionNotFound(upload_id.to_string())),
        }
    }
}

impl SessionRepository for MemorySessionRepository {
    fn create(&self, session: &UploadSession) -> Result<()> {
        self.sessions
            .insert(session.upload_id.clone(), session.clone());
        Ok(())
    }

    fn get(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        Ok(self.sessions.get(upload_id).map(|s| s.clone()))
    }

    fn add_chunk(&self, upload_id: &str, idx: u32) -> Result<()> {
        self.update(upload_id, |session| {
            session.chunks_uploaded.insert(idx);
        })
    }

    fn set_status(&self, upload_id: &str, status: SessionStatus) -> Result<()> {
        self.update(upload_id, |session| session.status = status)
    }

    fn complete(&self, upload_id: &str, blob_key: &str, sha256: &str) -> Result<()> {
        self.update(upload_id, |session| {
            session.status = SessionStatus::Completed;
            session.final_blob_key = Some(blob_key.to_string());
            session.sha256 = Some(sha256.to_string());
        })
    }

    fn delete(&self, upload_id: &str) -> Result<()> {
        self.sessions.remove(upload_id);
        Ok(())
    }

    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active && s.expires_at <= now)
            .map(|s| s.clone())
            .collect())
    }
}
