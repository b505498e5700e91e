//! Speaker annotation for the optional diarizing stage.

use murmur_transcript::Word;
use serde::{Deserialize, Serialize};

/// A word with its assigned speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokenWord {
    #[serde(flatten)]
    pub word: Word,
    pub speaker_id: i32,
}

pub trait Diarizer: Send + Sync {
    /// Assign a speaker id to every word, in order.
    fn assign(&self, words: &[Word]) -> Vec<i32>;
}

/// Labels everything as one speaker. The default when no diarization
/// model is wired in.
pub struct SingleSpeakerDiarizer;

impl Diarizer for SingleSpeakerDiarizer {
    fn assign(&self, words: &[Word]) -> Vec<i32> {
        vec![0; words.len()]
    }
}

/// Heuristic two-party diarizer: a silence gap at least `turn_gap_ms`
/// long flips the active speaker. Good enough for call-style audio.
pub struct TurnTakingDiarizer {
    pub turn_gap_ms: u64,
}

impl Default for TurnTakingDiarizer {
    fn default() -> Self {
        Self { turn_gap_ms: 1200 }
    }
}

impl Diarizer for TurnTakingDiarizer {
    fn assign(&self, words: &[Word]) -> Vec<i32> {
        let mut speaker = 0;
        let mut previous_end = None;
        words
            .iter()
            .map(|word| {
                if let Some(prev) = previous_end {
                    if word.start_ms.saturating_sub(prev) >= self.turn_gap_ms {
                        speaker = 1 - speaker;
                    }
                }
                previous_end = Some(word.end_ms);
                speaker
            })
            .collect()
    }
}

pub fn annotate(words: &[Word], diarizer: &dyn Diarizer) -> Vec<SpokenWord> {
    let speakers = diarizer.assign(words);
    words
        .iter()
        .zip(speakers)
        .map(|(word, speaker_id)| SpokenWord {
            word: word.clone(),
            speaker_id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_word(start_ms: u64, end_ms: u64) -> Word {
        Word::new("w", start_ms, end_ms, 0.9)
    }

    #[test]
    fn test_single_speaker() {
        let words = vec![make_word(0, 100), make_word(100, 200)];
        let annotated = annotate(&words, &SingleSpeakerDiarizer);
        assert!(annotated.iter().all(|w| w.speaker_id == 0));
    }

    #[test]
    fn test_turn_taking_flips_on_gap() {
        let words = vec![
            make_word(0, 500),
            make_word(600, 1000),
            // 2 s of silence: a turn.
            make_word(3000, 3400),
            make_word(3500, 4000),
            // Another turn back.
            make_word(6000, 6300),
        ];
        let speakers = TurnTakingDiarizer::default().assign(&words);
        assert_eq!(speakers, vec![0, 0, 1, 1, 0]);
    }

    #[test]
    fn test_spoken_word_serializes_flat() {
        let spoken = SpokenWord {
            word: Word::new("hi", 0, 100, 0.5),
            speaker_id: 1,
        };
        let value = serde_json::to_value(&spoken).unwrap();
        assert_eq!(value["text"], "hi");
        assert_eq!(value["speaker_id"], 1);
    }
}
