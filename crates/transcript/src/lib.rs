//! Core transcript domain: timed words, the error taxonomy shared across
//! services, and the artifact writer.

mod artifact;
mod srt;

pub use artifact::{render_json, render_txt, render_vtt, ArtifactKind};
pub use srt::{format_srt_timestamp, format_vtt_timestamp, group_cues, parse_srt, render_srt, Cue};

use serde::{Deserialize, Serialize};

/// A single transcribed word with timing and recognition confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

impl Word {
    pub fn new(text: impl Into<String>, start_ms: u64, end_ms: u64, confidence: f32) -> Self {
        Self {
            text: text.into(),
            start_ms,
            end_ms,
            confidence,
        }
    }

    /// Whether this word's span touches the half-open interval
    /// `[interval_start_ms, interval_end_ms)`.
    pub fn overlaps(&self, interval_start_ms: u64, interval_end_ms: u64) -> bool {
        self.start_ms < interval_end_ms && self.end_ms > interval_start_ms
    }
}

/// Join word texts with single spaces.
pub fn join_words(words: &[Word]) -> String {
    words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sort by `start_ms` (stable) and drop later words that collide on the
/// same start.
pub fn sort_and_dedup(mut words: Vec<Word>) -> Vec<Word> {
    words.sort_by_key(|w| w.start_ms);
    let mut deduped: Vec<Word> = Vec::with_capacity(words.len());
    for word in words {
        if deduped.last().map(|last| last.start_ms) != Some(word.start_ms) {
            deduped.push(word);
        }
    }
    deduped
}

/// End timestamp of the last word, or 0 for an empty list.
pub fn duration_ms(words: &[Word]) -> u64 {
    words.iter().map(|w| w.end_ms).max().unwrap_or(0)
}

/// Mean confidence over a word list, or `None` when empty.
pub fn mean_confidence(words: &[Word]) -> Option<f32> {
    if words.is_empty() {
        return None;
    }
    Some(words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32)
}

/// The error taxonomy every user-facing operation resolves into.
///
/// Messages are short, stable strings; internal paths, storage keys, and
/// provider credentials never appear here.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("integrity mismatch: expected sha256 {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },
    #[error("transcription provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rejected media: {0}")]
    ProviderBadMedia(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code stored on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::IntegrityMismatch { .. } => "integrity_mismatch",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::ProviderUnavailable(_) => "provider_unavailable",
            CoreError::ProviderBadMedia(_) => "provider_bad_media",
            CoreError::Timeout(_) => "timeout",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether a worker should retry the operation that produced this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderUnavailable(_)
                | CoreError::Timeout(_)
                | CoreError::RateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_word(text: &str, start_ms: u64, end_ms: u64) -> Word {
        Word::new(text, start_ms, end_ms, 0.9)
    }

    #[test]
    fn test_overlaps() {
        let w = make_word("hi", 100, 300);
        assert!(w.overlaps(0, 200));
        assert!(w.overlaps(250, 1000));
        assert!(!w.overlaps(300, 400));
        assert!(!w.overlaps(0, 100));
    }

    #[test]
    fn test_sort_and_dedup_keeps_first_collision() {
        let words = vec![
            make_word("b", 200, 400),
            make_word("a", 0, 200),
            make_word("b2", 200, 380),
        ];
        let out = sort_and_dedup(words);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "a");
        assert_eq!(out[1].text, "b");
    }

    #[test]
    fn test_join_and_duration() {
        let words = vec![make_word("the", 0, 200), make_word("cat", 200, 400)];
        assert_eq!(join_words(&words), "the cat");
        assert_eq!(duration_ms(&words), 400);
        assert_eq!(duration_ms(&[]), 0);
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(CoreError::NotFound("job".into()).code(), "not_found");
        assert!(CoreError::Timeout("stt".into()).is_retryable());
        assert!(!CoreError::InvalidInput("idx".into()).is_retryable());
    }
}
