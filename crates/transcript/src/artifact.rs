//! Rendering of the four derivative artifacts from a final word list.
//!
//! All four derive deterministically from the same words: rendering twice
//! with the same `created_at` yields byte-identical output.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::{duration_ms, join_words, render_srt, Word};
use crate::srt::{format_vtt_timestamp, group_cues};

/// The four output formats produced for every finished transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Txt,
    Json,
    Srt,
    Vtt,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Txt,
        ArtifactKind::Json,
        ArtifactKind::Srt,
        ArtifactKind::Vtt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Txt => "txt",
            ArtifactKind::Json => "json",
            ArtifactKind::Srt => "srt",
            ArtifactKind::Vtt => "vtt",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Txt => "text/plain",
            ArtifactKind::Json => "application/json",
            ArtifactKind::Srt => "application/x-subrip",
            ArtifactKind::Vtt => "text/vtt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "txt" => Some(ArtifactKind::Txt),
            "json" => Some(ArtifactKind::Json),
            "srt" => Some(ArtifactKind::Srt),
            "vtt" => Some(ArtifactKind::Vtt),
            _ => None,
        }
    }

    /// Render this artifact from a sorted word list.
    pub fn render(&self, id: &str, words: &[Word], created_at: DateTime<Utc>) -> String {
        match self {
            ArtifactKind::Txt => render_txt(words),
            ArtifactKind::Json => render_json(id, words, created_at),
            ArtifactKind::Srt => render_srt(words),
            ArtifactKind::Vtt => render_vtt(words),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain text: word texts joined by single spaces.
pub fn render_txt(words: &[Word]) -> String {
    join_words(words)
}

/// JSON document with the transcript, per-word timings, and metadata.
pub fn render_json(id: &str, words: &[Word], created_at: DateTime<Utc>) -> String {
    let doc = json!({
        "id": id,
        "transcript": join_words(words),
        "words": words,
        "metadata": {
            "total_words": words.len(),
            "duration_ms": duration_ms(words),
            "created_at": created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        },
    });
    serde_json::to_string_pretty(&doc).unwrap_or_default()
}

/// WebVTT with the same cue grouping as SRT.
pub fn render_vtt(words: &[Word]) -> String {
    let mut lines = vec!["WEBVTT".to_string(), String::new()];
    for cue in group_cues(words) {
        lines.push(format!(
            "{} --> {}",
            format_vtt_timestamp(cue.start_ms),
            format_vtt_timestamp(cue.end_ms)
        ));
        lines.push(cue.text);
        lines.push(String::new());
    }
    lines.join("\n")
}
