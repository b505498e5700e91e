//! Speech-to-text provider façade.
//!
//! One [`SttProvider`] seam hides the actual vendor; [`SttFacade`] layers
//! retry with back-off, primary→fallback routing, and word-timestamp
//! synthesis on top so callers always receive word-level timings.

mod facade;
mod mock;
mod provider;

pub use facade::SttFacade;
pub use mock::MockProvider;
pub use provider::HttpSttProvider;

use std::time::Duration;

use bytes::Bytes;
use murmur_transcript::{CoreError, Word};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SttError {
    /// Explicit 429 / quota from the provider. Never silently replaced
    /// with empty text.
    #[error("provider rate limited")]
    RateLimited { retry_after_s: Option<u64> },
    /// 400 / decode failure; the provider message is preserved.
    #[error("provider rejected media: {0}")]
    InvalidMedia(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<SttError> for CoreError {
    fn from(err: SttError) -> Self {
        match err {
            SttError::RateLimited { retry_after_s } => CoreError::RateLimited {
                retry_after_s: retry_after_s.unwrap_or(60),
            },
            SttError::InvalidMedia(msg) => CoreError::ProviderBadMedia(msg),
            SttError::Unavailable(msg) => CoreError::ProviderUnavailable(msg),
            SttError::Timeout(d) => CoreError::Timeout(format!("stt call after {d:?}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, SttError>;

/// One audio payload to transcribe.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio: Bytes,
    pub filename: String,
    pub content_type: String,
    pub language: Option<String>,
    pub session_id: Option<String>,
    pub chunk_idx: Option<u32>,
    pub timeout: Duration,
}

impl TranscribeRequest {
    pub fn new(audio: Bytes, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            content_type: "audio/wav".to_string(),
            audio,
            filename,
            language: None,
            session_id: None,
            chunk_idx: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Normalized provider response.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub words: Vec<Word>,
    pub confidence: f32,
    pub language: String,
    pub duration_s: f64,
}

#[async_trait::async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe(&self, request: &TranscribeRequest) -> Result<Transcription>;

    fn name(&self) -> &str;
}

/// Evenly spread words across `duration_ms` when a provider returns text
/// without timings. Confidence is pinned to 0.0 so overlap resolution
/// prefers any timed words in the same region.
pub fn synthesize_words(text: &str, duration_ms: u64) -> Vec<Word> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    let step = duration_ms / tokens.len() as u64;
    tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            let start_ms = i as u64 * step;
            let end_ms = if i == tokens.len() - 1 {
                duration_ms
            } else {
                (i as u64 + 1) * step
            };
            Word::new(*token, start_ms, end_ms.max(start_ms + 1), 0.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_uniform_intervals() {
        let words = synthesize_words("the cat sat", 3000);
        assert_eq!(words.len(), 3);
        assert_eq!(words[0].start_ms, 0);
        assert_eq!(words[0].end_ms, 1000);
        assert_eq!(words[2].end_ms, 3000);
        assert!(words.iter().all(|w| w.confidence == 0.0));
    }

    #[test]
    fn test_synthesize_empty_text() {
        assert!(synthesize_words("   ", 5000).is_empty());
        assert!(synthesize_words("", 0).is_empty());
    }

    #[test]
    fn test_error_maps_to_taxonomy() {
        let err: CoreError = SttError::RateLimited {
            retry_after_s: Some(30),
        }
        .into();
        assert_eq!(err.code(), "rate_limited");
        let err: CoreError = SttError::InvalidMedia("bad codec".into()).into();
        assert_eq!(err.code(), "provider_bad_media");
    }
}
