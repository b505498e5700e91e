//! In-memory cache backend with least-recently-inserted eviction.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{CacheBackend, Result};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    seq: u64,
}

struct State {
    entries: HashMap<String, Entry>,
    /// Insertion order; may hold stale (key, seq) pairs for overwritten
    /// entries, skipped during eviction.
    insert_order: VecDeque<(String, u64)>,
    next_seq: u64,
}

pub struct MemoryCache {
    max_size: usize,
    state: Mutex<State>,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            state: Mutex::new(State {
                entries: HashMap::new(),
                insert_order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_oldest(state: &mut State) {
        while let Some((key, seq)) = state.insert_order.pop_front() {
            let live = state.entries.get(&key).map(|e| e.seq) == Some(seq);
            if live {
                state.entries.remove(&key);
                tracing::debug!(key = %key, "evicted cache entry");
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) => entry
                .expires_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false),
            None => return Ok(None),
        };
        if expired {
            state.entries.remove(key);
            return Ok(None);
        }
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_s: u64) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(key) && state.entries.len() >= self.max_size {
            Self::evict_oldest(&mut state);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let expires_at = (ttl_s > 0).then(|| Instant::now() + Duration::from_secs(ttl_s));
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
        state.insert_order.push_back((key.to_string(), seq));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.get(key).await.map(|hit| hit.is_some())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.insert_order.clear();
        Ok(())
    }
}
