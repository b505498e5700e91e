//! Checkpointer: durable per-stage state with write verification.
//!
//! A stage's checkpoint is saved and read back before the stage is marked
//! complete, and loads log the keys found. The transcribing→merging
//! hand-off has historically been the fragile boundary, so both sides are
//! logged explicitly.

use std::sync::Arc;

use murmur_transcript::CoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::job::{CheckpointStore, Stage};
use crate::Result;

#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Persist `state`, then read it back to confirm the write landed.
    /// The stage must not be marked complete until this returns.
    pub fn save<T: Serialize>(&self, job_id: &str, stage: Stage, state: &T) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| CoreError::Internal(format!("checkpoint encode: {e}")))?;
        let entry_count = match &value {
            serde_json::Value::Object(map) => map
                .get("results")
                .or_else(|| map.get("segments"))
                .and_then(|v| match v {
                    serde_json::Value::Object(m) => Some(m.len()),
                    serde_json::Value::Array(a) => Some(a.len()),
                    _ => None,
                })
                .unwrap_or(map.len()),
            _ => 0,
        };
        tracing::debug!(
            job_id,
            stage = %stage,
            "saving checkpoint with {entry_count} transcripts"
        );

        self.store.save(job_id, stage, &value)?;

        let verified = self.store.load(job_id, stage)?.is_some();
        if !verified {
            return Err(CoreError::Internal(format!(
                "checkpoint for stage {stage} not readable after write"
            )));
        }
        tracing::debug!(job_id, stage = %stage, "checkpoint verified");
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self, job_id: &str, stage: Stage) -> Result<Option<T>> {
        let Some(value) = self.store.load(job_id, stage)? else {
            return Ok(None);
        };
        if let serde_json::Value::Object(map) = &value {
            let keys: Vec<&String> = map.keys().collect();
            tracing::debug!(job_id, stage = %stage, "found checkpoint with keys {keys:?}");
        }
        let state = serde_json::from_value(value)
            .map_err(|e| CoreError::Internal(format!("checkpoint decode for {stage}: {e}")))?;
        Ok(Some(state))
    }

    pub fn exists(&self, job_id: &str, stage: Stage) -> Result<bool> {
        Ok(self.store.load(job_id, stage)?.is_some())
    }

    pub fn delete(&self, job_id: &str, stage: Stage) -> Result<()> {
        self.store.delete(job_id, stage)
    }

    pub fn delete_all(&self, job_id: &str) -> Result<()> {
        self.store.delete_all(job_id)
    }
}
