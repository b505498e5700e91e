//! Subtitle cue grouping and SRT/VTT rendering.

use crate::{join_words, Word};

/// A cue closes once it holds this many words.
const MAX_CUE_WORDS: usize = 10;

/// A cue closes once its span reaches this many milliseconds.
const MAX_CUE_SPAN_MS: u64 = 5000;

/// One subtitle cue: a contiguous run of words rendered as a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Group a sorted word list into cues.
///
/// A cue closes when it has accumulated [`MAX_CUE_WORDS`] words or the
/// elapsed span from its first word reaches [`MAX_CUE_SPAN_MS`].
pub fn group_cues(words: &[Word]) -> Vec<Cue> {
    let mut cues = Vec::new();
    let mut current: Vec<&Word> = Vec::new();

    for word in words {
        current.push(word);
        let span = word.end_ms.saturating_sub(current[0].start_ms);
        if current.len() >= MAX_CUE_WORDS || span >= MAX_CUE_SPAN_MS {
            cues.push(close_cue(&current, cues.len() + 1));
            current.clear();
        }
    }
    if !current.is_empty() {
        cues.push(close_cue(&current, cues.len() + 1));
    }
    cues
}

fn close_cue(words: &[&Word], index: usize) -> Cue {
    let owned: Vec<Word> = words.iter().map(|w| (*w).clone()).collect();
    Cue {
        index,
        start_ms: words[0].start_ms,
        end_ms: words[words.len() - 1].end_ms,
        text: join_words(&owned),
    }
}

/// `HH:MM:SS,mmm`
pub fn format_srt_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// `HH:MM:SS.mmm`
pub fn format_vtt_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

pub fn render_srt(words: &[Word]) -> String {
    let mut lines = Vec::new();
    for cue in group_cues(words) {
        lines.push(cue.index.to_string());
        lines.push(format!(
            "{} --> {}",
            format_srt_timestamp(cue.start_ms),
            format_srt_timestamp(cue.end_ms)
        ));
        lines.push(cue.text);
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Parse SRT back into cues. Used to check the serialize/parse
/// round-trip; tolerant of trailing whitespace and blank-line runs.
pub fn parse_srt(content: &str) -> Vec<Cue> {
    let mut cues = Vec::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(index) = line.parse::<usize>() else {
            continue;
        };
        let Some(timing) = lines.next() else { break };
        let Some((start, end)) = timing.split_once(" --> ") else {
            continue;
        };
        let (Some(start_ms), Some(end_ms)) = (parse_timestamp(start), parse_timestamp(end)) else {
            continue;
        };

        let mut text_lines = Vec::new();
        while let Some(text) = lines.peek() {
            if text.trim().is_empty() {
                break;
            }
            text_lines.push(lines.next().unwrap_or_default().trim().to_string());
        }
        cues.push(Cue {
            index,
            start_ms,
            end_ms,
            text: text_lines.join(" "),
        });
    }
    cues
}

fn parse_timestamp(s: &str) -> Option<u64> {
    let s = s.trim().replace('.', ",");
    let (clock, millis) = s.split_once(',')?;
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let seconds: u64 = parts[2].parse().ok()?;
    let millis: u64 = millis.parse().ok()?;
    Some(hours * 3_600_000 + minutes * 60_000 + seconds * 1000 + millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_word(text: &str, start_ms: u64, end_ms: u64) -> Word {
        Word::new(text, start_ms, end_ms, 1.0)
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(format_srt_timestamp(3_723_456), "01:02:03,456");
        assert_eq!(format_vtt_timestamp(3_723_456), "01:02:03.456");
        assert_eq!(format_srt_timestamp(0), "00:00:00,000");
    }

    #[test]
    fn test_cue_closes_at_word_limit() {
        let words: Vec<Word> = (0..25)
            .map(|i| make_word("w", i * 100, i * 100 + 80))
            .collect();
        let cues = group_cues(&words);
        assert_eq!(cues.len(), 3);
        assert_eq!(cues[0].index, 1);
        assert_eq!(cues[1].index, 2);
        assert_eq!(cues[0].text.split(' ').count(), 10);
        assert_eq!(cues[2].text.split(' ').count(), 5);
    }

    #[test]
    fn test_cue_closes_at_span_limit() {
        let words = vec![
            make_word("slow", 0, 3000),
            make_word("speech", 3000, 6000),
            make_word("here", 6000, 6500),
        ];
        let cues = group_cues(&words);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].end_ms, 6000);
        assert_eq!(cues[1].text, "here");
    }

    #[test]
    fn test_srt_round_trip() {
        let words: Vec<Word> = (0..23)
            .map(|i| make_word(&format!("w{i}"), i * 400, i * 400 + 350))
            .collect();
        let srt = render_srt(&words);
        let parsed = parse_srt(&srt);
        let expected = group_cues(&words);
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_empty_words_render_empty() {
        assert_eq!(render_srt(&[]), "");
        assert!(group_cues(&[]).is_empty());
    }
}
