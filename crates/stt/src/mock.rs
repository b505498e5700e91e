//! Scripted provider for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{Result, SttError, SttProvider, TranscribeRequest, Transcription};

/// Returns queued responses in order; once the queue is empty every call
/// reports `Unavailable`.
pub struct MockProvider {
    name: String,
    responses: Mutex<VecDeque<Result<Transcription>>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_ok(&self, transcription: Transcription) {
        self.responses.lock().push_back(Ok(transcription));
    }

    pub fn push_err(&self, err: SttError) {
        self.responses.lock().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SttProvider for MockProvider {
    async fn transcribe(&self, _request: &TranscribeRequest) -> Result<Transcription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SttError::Unavailable("mock queue exhausted".to_string())))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
