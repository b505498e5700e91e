//! Retry, fallback, and timestamp-synthesis policy around the providers.

use std::sync::Arc;
use std::time::Duration;

use crate::{synthesize_words, Result, SttError, SttProvider, TranscribeRequest, Transcription};

const MAX_ATTEMPTS: u32 = 3;

pub struct SttFacade {
    primary: Arc<dyn SttProvider>,
    fallback: Option<Arc<dyn SttProvider>>,
}

impl SttFacade {
    pub fn new(primary: Arc<dyn SttProvider>, fallback: Option<Arc<dyn SttProvider>>) -> Self {
        Self { primary, fallback }
    }

    /// Transcribe with up to three attempts and exponential back-off
    /// (2 s, 4 s, 8 s) on transient failure. Per attempt, a transiently
    /// failing primary falls through to the fallback provider. Rate
    /// limiting and invalid media surface immediately; they are caller
    /// decisions, not retry fodder.
    pub async fn transcribe(&self, request: &TranscribeRequest) -> Result<Transcription> {
        let mut last_transient = SttError::Unavailable("no providers configured".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt_once(request).await {
                Ok(result) => {
                    return Ok(self.ensure_word_timestamps(result));
                }
                Err(err @ (SttError::RateLimited { .. } | SttError::InvalidMedia(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        chunk_idx = ?request.chunk_idx,
                        error = %err,
                        "transcription attempt failed"
                    );
                    last_transient = err;
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let wait = Duration::from_secs(2u64 << attempt);
                tracing::debug!(wait_s = wait.as_secs(), "backing off before retry");
                tokio::time::sleep(wait).await;
            }
        }

        Err(last_transient)
    }

    async fn attempt_once(&self, request: &TranscribeRequest) -> Result<Transcription> {
        match self.primary.transcribe(request).await {
            Ok(result) => Ok(result),
            Err(err @ (SttError::RateLimited { .. } | SttError::InvalidMedia(_))) => Err(err),
            Err(primary_err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(primary_err);
                };
                tracing::info!(
                    primary = self.primary.name(),
                    fallback = fallback.name(),
                    error = %primary_err,
                    "primary provider unavailable, using fallback"
                );
                fallback.transcribe(request).await
            }
        }
    }

    /// Word-level timestamps are part of the façade contract. When a
    /// provider returns only text, spread the tokens uniformly across the
    /// reported duration at confidence 0.0.
    fn ensure_word_timestamps(&self, mut result: Transcription) -> Transcription {
        if result.words.is_empty() && !result.text.trim().is_empty() {
            let duration_ms = (result.duration_s * 1000.0).round() as u64;
            let duration_ms = if duration_ms == 0 {
                // No duration either: assume 200 ms per token.
                result.text.split_whitespace().count() as u64 * 200
            } else {
                duration_ms
            };
            result.words = synthesize_words(&result.text, duration_ms);
            result.confidence = 0.0;
            tracing::debug!(
                word_count = result.words.len(),
                duration_ms,
                "synthesized uniform word timestamps"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockProvider;
    use bytes::Bytes;
    use murmur_transcript::Word;

    fn request() -> TranscribeRequest {
        TranscribeRequest::new(Bytes::from_static(b"fake-audio"), "chunk_0.wav")
    }

    fn transcription(text: &str) -> Transcription {
        Transcription {
            text: text.to_string(),
            words: vec![Word::new(text, 0, 500, 0.9)],
            confidence: 0.9,
            language: "en".to_string(),
            duration_s: 0.5,
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.push_ok(transcription("hello"));
        let fallback = Arc::new(MockProvider::new("fallback"));

        let facade = SttFacade::new(primary.clone(), Some(fallback.clone()));
        let out = facade.transcribe(&request()).await.unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_unavailable() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.push_err(SttError::Unavailable("down".into()));
        let fallback = Arc::new(MockProvider::new("fallback"));
        fallback.push_ok(transcription("from fallback"));

        let facade = SttFacade::new(primary, Some(fallback.clone()));
        let out = facade.transcribe(&request()).await.unwrap();
        assert_eq!(out.text, "from fallback");
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_is_immediate() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.push_err(SttError::RateLimited {
            retry_after_s: Some(30),
        });
        let fallback = Arc::new(MockProvider::new("fallback"));
        fallback.push_ok(transcription("should not be used"));

        let facade = SttFacade::new(primary.clone(), Some(fallback.clone()));
        let err = facade.transcribe(&request()).await.unwrap_err();
        assert!(matches!(err, SttError::RateLimited { .. }));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_media_preserves_message() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.push_err(SttError::InvalidMedia("corrupt header".into()));

        let facade = SttFacade::new(primary, None);
        let err = facade.transcribe(&request()).await.unwrap_err();
        match err {
            SttError::InvalidMedia(msg) => assert_eq!(msg, "corrupt header"),
            other => panic!("expected InvalidMedia, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.push_err(SttError::Unavailable("blip".into()));
        primary.push_ok(transcription("recovered"));

        let facade = SttFacade::new(primary.clone(), None);
        let out = facade.transcribe(&request()).await.unwrap();
        assert_eq!(out.text, "recovered");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_synthesizes_missing_word_timestamps() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.push_ok(Transcription {
            text: "one two three four".to_string(),
            words: Vec::new(),
            confidence: 0.9,
            language: "en".to_string(),
            duration_s: 4.0,
        });

        let facade = SttFacade::new(primary, None);
        let out = facade.transcribe(&request()).await.unwrap();
        assert_eq!(out.words.len(), 4);
        assert_eq!(out.words[0].end_ms, 1000);
        assert_eq!(out.confidence, 0.0);
        assert!(out.words.iter().all(|w| w.confidence == 0.0));
    }
}
