//! HTTP provider speaking the whisper-style transcription API.

use serde::Deserialize;

use crate::{Result, SttError, SttProvider, TranscribeRequest, Transcription};
use murmur_transcript::Word;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-1";

/// Fallback confidence for providers that do not report one.
const DEFAULT_CONFIDENCE: f32 = 0.95;

pub struct HttpSttProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireWord {
    word: String,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<WireWord>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: String,
}

impl HttpSttProvider {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            name: name.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn parse_error_message(status: u16, body: &str) -> String {
        serde_json::from_str::<WireError>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| format!("HTTP {status}"))
    }
}

#[async_trait::async_trait]
impl SttProvider for HttpSttProvider {
    async fn transcribe(&self, request: &TranscribeRequest) -> Result<Transcription> {
        let part = reqwest::multipart::Part::bytes(request.audio.to_vec())
            .file_name(request.filename.clone())
            .mime_str(&request.content_type)
            .map_err(|e| SttError::InvalidMedia(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SttError::Timeout(request.timeout)
                } else {
                    SttError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_s = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(SttError::RateLimited { retry_after_s });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SttError::Unavailable(e.to_string()))?;

        if status.as_u16() == 400 {
            return Err(SttError::InvalidMedia(Self::parse_error_message(400, &body)));
        }
        if !status.is_success() {
            return Err(SttError::Unavailable(Self::parse_error_message(
                status.as_u16(),
                &body,
            )));
        }

        let wire: WireResponse =
            serde_json::from_str(&body).map_err(|e| SttError::Unavailable(e.to_string()))?;

        let words: Vec<Word> = wire
            .words
            .iter()
            .map(|w| {
                let start_ms = (w.start.max(0.0) * 1000.0).round() as u64;
                let mut end_ms = (w.end.max(0.0) * 1000.0).round() as u64;
                if end_ms <= start_ms {
                    end_ms = start_ms + 1;
                }
                Word::new(w.word.trim(), start_ms, end_ms, DEFAULT_CONFIDENCE)
            })
            .collect();

        tracing::debug!(
            provider = %self.name,
            chunk_idx = ?request.chunk_idx,
            text_len = wire.text.len(),
            word_count = words.len(),
            "provider transcription succeeded"
        );

        Ok(Transcription {
            text: wire.text,
            words,
            confidence: DEFAULT_CONFIDENCE,
            language: wire.language.unwrap_or_else(|| "en".to_string()),
            duration_s: wire.duration.unwrap_or(0.0),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_response_parses_verbose_json() {
        let json = r#"{
            "text": "the cat",
            "language": "english",
            "duration": 1.8,
            "words": [
                {"word": "the", "start": 0.0, "end": 0.4},
                {"word": "cat", "start": 0.4, "end": 0.9}
            ]
        }"#;
        let wire: WireResponse = serde_json::from_str(json).unwrap();
        assert_eq!(wire.text, "the cat");
        assert_eq!(wire.words.len(), 2);
        assert_eq!(wire.duration, Some(1.8));
    }

    #[test]
    fn test_wire_response_without_words() {
        let wire: WireResponse = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert!(wire.words.is_empty());
        assert_eq!(wire.language, None);
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error": {"message": "Invalid file format."}}"#;
        assert_eq!(
            HttpSttProvider::parse_error_message(400, body),
            "Invalid file format."
        );
        assert_eq!(HttpSttProvider::parse_error_message(502, "gateway"), "HTTP 502");
    }
}
