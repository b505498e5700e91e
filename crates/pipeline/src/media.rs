//! Media probing, decoding, resampling, and segmenting.
//!
//! Uploaded containers are decoded with symphonia, downmixed to mono,
//! resampled to 16 kHz, and re-encoded as the 16-bit PCM WAV the
//! providers prefer. Segmenting slices the normalized WAV under the
//! provider upload ceiling with a short overlap at each boundary.

use std::io::Cursor;

use murmur_transcript::CoreError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::Result;

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

const WAV_HEADER_BYTES: u64 = 44;
const BYTES_PER_SAMPLE: u64 = 2;

/// Mono samples plus their rate.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Container facts gathered without a full decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaProbe {
    pub duration_s: f64,
    pub container: String,
    pub streams: usize,
}

fn bad_media(msg: impl std::fmt::Display) -> CoreError {
    CoreError::InvalidInput(format!("unplayable media: {msg}"))
}

fn probe_format(
    data: Vec<u8>,
    filename_hint: &str,
) -> Result<symphonia::core::probe::ProbeResult> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = filename_hint.rsplit('.').next() {
        hint.with_extension(ext);
    }
    symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(bad_media)
}

/// Identify the container and estimate duration from track headers.
pub fn probe(data: Vec<u8>, filename_hint: &str) -> Result<MediaProbe> {
    let probed = probe_format(data, filename_hint)?;
    let format = probed.format;
    let streams = format.tracks().len();
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| bad_media("no audio track found"))?;

    let duration_s = match (track.codec_params.n_frames, track.codec_params.sample_rate) {
        (Some(frames), Some(rate)) if rate > 0 => frames as f64 / rate as f64,
        _ => 0.0,
    };

    Ok(MediaProbe {
        duration_s,
        container: filename_hint
            .rsplit('.')
            .next()
            .unwrap_or("unknown")
            .to_lowercase(),
        streams,
    })
}

/// Decode any supported container to mono f32 samples.
pub fn decode_to_mono(data: Vec<u8>, filename_hint: &str) -> Result<DecodedAudio> {
    let probed = probe_format(data, filename_hint)?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| bad_media("no audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| bad_media("unknown sample rate"))?;
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(bad_media)?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(symphonia::core::errors::Error::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "packet read error, stopping decode");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                tracing::warn!(error = %e, "recoverable decode error, skipping packet");
                continue;
            }
            Err(e) => return Err(bad_media(e)),
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    if samples.is_empty() {
        return Err(bad_media("no audio samples decoded"));
    }

    let mono = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        samples
    };

    tracing::debug!(
        sample_rate,
        channels,
        samples = mono.len(),
        "decoded media to mono"
    );
    Ok(DecodedAudio {
        samples: mono,
        sample_rate,
    })
}

/// Sinc-resample mono audio to the provider rate.
pub fn resample_to_target(audio: DecodedAudio) -> Result<Vec<f32>> {
    if audio.sample_rate == TARGET_SAMPLE_RATE {
        return Ok(audio.samples);
    }
    if audio.samples.is_empty() {
        return Ok(Vec::new());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = TARGET_SAMPLE_RATE as f64 / audio.sample_rate as f64;
    let chunk_size = 1024;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| CoreError::Internal(format!("resampler init: {e}")))?;

    let mut output = Vec::with_capacity((audio.samples.len() as f64 * ratio).ceil() as usize);
    let mut position = 0;
    while position < audio.samples.len() {
        let end = (position + chunk_size).min(audio.samples.len());
        let mut chunk = audio.samples[position..end].to_vec();
        if chunk.len() < chunk_size {
            chunk.resize(chunk_size, 0.0);
        }
        let processed = resampler
            .process(&[chunk], None)
            .map_err(|e| CoreError::Internal(format!("resample: {e}")))?;
        if let Some(channel) = processed.into_iter().next() {
            output.extend(channel);
        }
        position += chunk_size;
    }

    let expected = (audio.samples.len() as f64 * ratio).ceil() as usize;
    output.truncate(expected);
    tracing::debug!(
        from_rate = audio.sample_rate,
        to_rate = TARGET_SAMPLE_RATE,
        in_samples = audio.samples.len(),
        out_samples = output.len(),
        "resampled audio"
    );
    Ok(output)
}

/// Encode mono f32 samples as 16-bit PCM WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| CoreError::Internal(format!("wav writer: {e}")))?;
        for sample in samples {
            let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(clamped)
                .map_err(|e| CoreError::Internal(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| CoreError::Internal(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Decode a mono 16-bit WAV produced by [`encode_wav`].
pub fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| bad_media(format!("wav: {e}")))?;
    let spec = reader.spec();
    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| bad_media(format!("wav samples: {e}")))?;
    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// One planned segment of the normalized audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub idx: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Sample range within the normalized buffer, overlap included.
    pub start_sample: usize,
    pub end_sample: usize,
}

/// Slice `total_samples` into segments whose encoded WAV size stays under
/// `max_segment_bytes`, each (except the first) starting `overlap_ms`
/// early so boundary words appear in both neighbors.
pub fn plan_segments(
    total_samples: usize,
    sample_rate: u32,
    max_segment_bytes: u64,
    overlap_ms: u64,
) -> Vec<SegmentPlan> {
    if total_samples == 0 {
        return Vec::new();
    }
    let payload_budget = max_segment_bytes.saturating_sub(WAV_HEADER_BYTES);
    let max_samples = (payload_budget / BYTES_PER_SAMPLE).max(1) as usize;
    let overlap_samples = (overlap_ms * sample_rate as u64 / 1000) as usize;
    let overlap_samples = overlap_samples.min(max_samples / 2);

    let ms_per_sample = 1000.0 / sample_rate as f64;
    let mut segments = Vec::new();
    let mut cursor = 0usize;
    let mut idx = 0u32;
    while cursor < total_samples {
        let start_sample = cursor.saturating_sub(if idx == 0 { 0 } else { overlap_samples });
        let end_sample = (start_sample + max_samples).min(total_samples);
        segments.push(SegmentPlan {
            idx,
            start_ms: (start_sample as f64 * ms_per_sample) as u64,
            end_ms: (end_sample as f64 * ms_per_sample) as u64,
            start_sample,
            end_sample,
        });
        if end_sample == total_samples {
            break;
        }
        cursor = end_sample;
        idx += 1;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, seconds: f64) -> Vec<f32> {
        let count = (rate as f64 * seconds) as usize;
        (0..count)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_wav_round_trip() {
        let samples = sine(TARGET_SAMPLE_RATE, 0.25);
        let encoded = encode_wav(&samples, TARGET_SAMPLE_RATE).unwrap();
        let decoded = decode_wav(&encoded).unwrap();
        assert_eq!(decoded.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(decoded.samples.len(), samples.len());
        // 16-bit quantization keeps values close.
        for (a, b) in samples.iter().zip(decoded.samples.iter()) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_decode_via_symphonia() {
        let samples = sine(TARGET_SAMPLE_RATE, 0.1);
        let wav = encode_wav(&samples, TARGET_SAMPLE_RATE).unwrap();
        let decoded = decode_to_mono(wav, "test.wav").unwrap();
        assert_eq!(decoded.sample_rate, TARGET_SAMPLE_RATE);
        assert!((decoded.duration_s() - 0.1).abs() < 0.01);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode_to_mono(b"definitely not audio".to_vec(), "x.wav");
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_probe_reports_duration() {
        let samples = sine(TARGET_SAMPLE_RATE, 2.0);
        let wav = encode_wav(&samples, TARGET_SAMPLE_RATE).unwrap();
        let info = probe(wav, "clip.wav").unwrap();
        assert_eq!(info.container, "wav");
        assert_eq!(info.streams, 1);
        assert!((info.duration_s - 2.0).abs() < 0.05);
    }

    #[test]
    fn test_resample_noop_at_target_rate() {
        let samples = sine(TARGET_SAMPLE_RATE, 0.1);
        let out = resample_to_target(DecodedAudio {
            samples: samples.clone(),
            sample_rate: TARGET_SAMPLE_RATE,
        })
        .unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn test_resample_44100_to_16000() {
        let samples = sine(44_100, 0.5);
        let expected_len = (samples.len() as f64 * 16_000.0 / 44_100.0).ceil() as usize;
        let out = resample_to_target(DecodedAudio {
            samples,
            sample_rate: 44_100,
        })
        .unwrap();
        assert!((out.len() as i64 - expected_len as i64).abs() < 200);
    }

    #[test]
    fn test_segment_plan_covers_everything_with_overlap() {
        let rate = TARGET_SAMPLE_RATE;
        let total = rate as usize * 10; // 10 s
        // Budget of ~2 s per segment.
        let max_bytes = WAV_HEADER_BYTES + 2 * rate as u64 * BYTES_PER_SAMPLE;
        let plans = plan_segments(total, rate, max_bytes, 750);

        assert!(plans.len() > 4);
        assert_eq!(plans[0].start_sample, 0);
        assert_eq!(plans.last().unwrap().end_sample, total);
        for pair in plans.windows(2) {
            // Every later segment reaches back into its predecessor.
            assert!(pair[1].start_sample < pair[0].end_sample);
            assert_eq!(pair[1].idx, pair[0].idx + 1);
        }
        for plan in &plans {
            let bytes =
                (plan.end_sample - plan.start_sample) as u64 * BYTES_PER_SAMPLE + WAV_HEADER_BYTES;
            assert!(bytes <= max_bytes);
        }
    }

    #[test]
    fn test_single_segment_when_small() {
        let plans = plan_segments(1000, TARGET_SAMPLE_RATE, 24 * 1024 * 1024, 750);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].start_sample, 0);
        assert_eq!(plans[0].end_sample, 1000);
    }

    #[test]
    fn test_empty_audio_has_no_segments() {
        assert!(plan_segments(0, TARGET_SAMPLE_RATE, 1024, 750).is_empty());
    }
}
