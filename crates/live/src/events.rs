//! Per-session event publication for polling consumers.
//!
//! Each event type holds one slot per session (`events:{sid}:{type}`)
//! with a short TTL; consumers poll and deduplicate by
//! `(session_id, type, timestamp)`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_transcript::Word;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::Result;

/// Seconds an event record stays pollable.
const EVENT_TTL_S: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Partial,
    Commit,
    Final,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Partial, EventKind::Commit, EventKind::Final];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Partial => "partial",
            EventKind::Commit => "commit",
            EventKind::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "partial" => Some(EventKind::Partial),
            "commit" => Some(EventKind::Commit),
            "final" => Some(EventKind::Final),
            _ => None,
        }
    }
}

/// Stable words moved to the permanent transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub word_count: usize,
}

/// Current tail buffer; replaced wholesale by the next partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialEvent {
    pub text: String,
    pub words: Vec<Word>,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// What consumers poll: the typed payload wrapped with identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, session_id: &str, kind: EventKind, data: serde_json::Value)
        -> Result<()>;

    /// Whatever is currently present for the requested kinds, oldest
    /// first.
    async fn fetch(&self, session_id: &str, kinds: &[EventKind]) -> Result<Vec<EventEnvelope>>;
}

fn event_key(session_id: &str, kind: EventKind) -> String {
    format!("events:{session_id}:{}", kind.as_str())
}

pub struct RedisEventSink {
    conn: ConnectionManager,
}

impl RedisEventSink {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl EventSink for RedisEventSink {
    async fn publish(
        &self,
        session_id: &str,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<()> {
        let envelope = EventEnvelope {
            kind,
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            data,
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(event_key(session_id, kind), payload, EVENT_TTL_S)
            .await?;
        tracing::debug!(session_id, kind = kind.as_str(), "published event");
        Ok(())
    }

    async fn fetch(&self, session_id: &str, kinds: &[EventKind]) -> Result<Vec<EventEnvelope>> {
        let mut conn = self.conn.clone();
        let mut events = Vec::new();
        for kind in kinds {
            let raw: Option<String> = conn.get(event_key(session_id, *kind)).await?;
            if let Some(raw) = raw {
                if let Ok(envelope) = serde_json::from_str::<EventEnvelope>(&raw) {
                    events.push(envelope);
                }
            }
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

/// In-memory sink for tests and Redis-less deployments.
#[derive(Default)]
pub struct InMemoryEventSink {
    slots: DashMap<String, (EventEnvelope, Instant)>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live envelopes for a session, any kind. Test helper.
    pub fn all_for(&self, session_id: &str) -> Vec<EventEnvelope> {
        let mut events: Vec<EventEnvelope> = EventKind::ALL
            .iter()
            .filter_map(|kind| {
                self.slots
                    .get(&event_key(session_id, *kind))
                    .map(|e| e.0.clone())
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }
}

#[async_trait::async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(
        &self,
        session_id: &str,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<()> {
        let envelope = EventEnvelope {
            kind,
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            data,
        };
        let expires = Instant::now() + Duration::from_secs(EVENT_TTL_S);
        self.slots
            .insert(event_key(session_id, kind), (envelope, expires));
        Ok(())
    }

    async fn fetch(&self, session_id: &str, kinds: &[EventKind]) -> Result<Vec<EventEnvelope>> {
        let now = Instant::now();
        let mut events: Vec<EventEnvelope> = kinds
            .iter()
            .filter_map(|kind| {
                let slot = self.slots.get(&event_key(session_id, *kind))?;
                (slot.1 > now).then(|| slot.0.clone())
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_and_fetch() {
        let sink = InMemoryEventSink::new();
        sink.publish("s1", EventKind::Partial, json!({"text": "hel"}))
            .await
            .unwrap();
        sink.publish("s1", EventKind::Commit, json!({"text": "hello"}))
            .await
            .unwrap();

        let events = sink.fetch("s1", &EventKind::ALL).await.unwrap();
        assert_eq!(events.len(), 2);
        let only_commit = sink.fetch("s1", &[EventKind::Commit]).await.unwrap();
        assert_eq!(only_commit.len(), 1);
        assert_eq!(only_commit[0].kind, EventKind::Commit);
    }

    #[tokio::test]
    async fn test_partial_slot_is_replaced() {
        let sink = InMemoryEventSink::new();
        sink.publish("s1", EventKind::Partial, json!({"text": "a"}))
            .await
            .unwrap();
        sink.publish("s1", EventKind::Partial, json!({"text": "a b"}))
            .await
            .unwrap();

        let events = sink.fetch("s1", &[EventKind::Partial]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["text"], "a b");
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(EventKind::parse("final"), Some(EventKind::Final));
        assert_eq!(EventKind::parse("nope"), None);
    }
}
