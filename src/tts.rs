/// Text-to-speech pipeline: reply text → chunks → synthesis → per-chunk
/// polish → cross-faded PCM ready for the wire.
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::audio::{
    self, CROSSFADE_MS, EDGE_FADE_MS, SAMPLE_RATE, TRIM_TOP_DB, TTS_MAX_GAIN_DB, TTS_PEAK_CEILING,
    TTS_TARGET_DBFS,
};

// ═══════════════════════════════════════════════════════════════════════
//  Chunking
// ═══════════════════════════════════════════════════════════════════════

/// Replies at or below this length are synthesized in one piece.
pub const SINGLE_CHUNK_MAX_CHARS: usize = 44;
/// Up to this length we aim for two chunks, beyond it three.
pub const TWO_CHUNK_MAX_CHARS: usize = 92;
/// Chunks shorter than this merge into their neighbour.
pub const MIN_CHUNK_CHARS: usize = 6;
/// How far a cut may drift from the equal-length target.
const SPLIT_WINDOW: usize = 12;

const SPLIT_PUNCT: &[char] = &['.', '?', '!', ',', ';', ':', '。', '！', '？'];

/// Split reply text into TTS-sized chunks.
///
/// Cut positions are picked greedily right-to-left inside a ± window
/// around each equal-length target, preferring sentence punctuation,
/// then whitespace, then the bare target.  Chunks below
/// [`MIN_CHUNK_CHARS`] are merged into their predecessor.
pub fn split_for_tts(text: &str, max_chunks: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let n = chars.len();
    if n <= SINGLE_CHUNK_MAX_CHARS || max_chunks <= 1 {
        return vec![trimmed.to_string()];
    }

    let natural_count = if n <= TWO_CHUNK_MAX_CHARS { 2 } else { 3 };
    let target_count = natural_count.min(max_chunks);
    if target_count <= 1 {
        return vec![trimmed.to_string()];
    }

    let mut cuts: Vec<usize> = Vec::new();
    let mut upper = n;
    for i in (1..target_count).rev() {
        let target = i * n / target_count;
        let lo = target.saturating_sub(SPLIT_WINDOW).max(1);
        let hi = (target + SPLIT_WINDOW).min(upper.saturating_sub(1));
        if lo > hi {
            continue;
        }
        let cut = pick_cut(&chars, lo, hi).unwrap_or_else(|| target.clamp(lo, hi));
        cuts.push(cut);
        upper = cut;
    }
    cuts.reverse();
    cuts.dedup();

    let mut chunks = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0usize;
    for &cut in &cuts {
        if cut > start {
            chunks.push(slice_to_string(&chars, start, cut));
            start = cut;
        }
    }
    chunks.push(slice_to_string(&chars, start, n));
    chunks.retain(|c| !c.is_empty());

    merge_short_chunks(chunks)
}

fn slice_to_string(chars: &[char], start: usize, end: usize) -> String {
    chars[start..end].iter().collect::<String>().trim().to_string()
}

/// Scan `hi → lo` for the rightmost cut that lands just after sentence
/// punctuation, falling back to whitespace.
fn pick_cut(chars: &[char], lo: usize, hi: usize) -> Option<usize> {
    for idx in (lo..=hi).rev() {
        if SPLIT_PUNCT.contains(&chars[idx - 1]) {
            return Some(idx);
        }
    }
    for idx in (lo..=hi).rev() {
        if chars[idx - 1].is_whitespace() {
            return Some(idx);
        }
    }
    None
}

fn merge_short_chunks(chunks: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for chunk in chunks {
        if chunk.chars().count() < MIN_CHUNK_CHARS {
            if let Some(prev) = out.last_mut() {
                prev.push(' ');
                prev.push_str(&chunk);
                continue;
            }
        }
        out.push(chunk);
    }
    if out.len() >= 2 && out[0].chars().count() < MIN_CHUNK_CHARS {
        let first = out.remove(0);
        out[0] = format!("{first} {}", out[0]);
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Per-chunk post-processing
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPosition {
    Only,
    First,
    Middle,
    Last,
}

pub fn position_of(index: usize, total: usize) -> ChunkPosition {
    if total <= 1 {
        ChunkPosition::Only
    } else if index == 0 {
        ChunkPosition::First
    } else if index + 1 == total {
        ChunkPosition::Last
    } else {
        ChunkPosition::Middle
    }
}

/// Trim padding per chunk position: interior boundaries are tightened
/// because the cross-fade supplies the transition.
fn trim_pad_ms(position: ChunkPosition) -> usize {
    match position {
        ChunkPosition::Only => 140,
        ChunkPosition::First | ChunkPosition::Last => 80,
        ChunkPosition::Middle => 40,
    }
}

/// Polish one synthesized chunk: DC removal, positional energy trim,
/// loudness normalization, peak limiting, edge fades.
pub fn polish_chunk(samples: Vec<f32>, position: ChunkPosition) -> Vec<f32> {
    if samples.is_empty() {
        return samples;
    }
    let mut pcm = samples;
    audio::remove_dc_offset(&mut pcm);
    let mut pcm = audio::trim_energy(&pcm, SAMPLE_RATE, TRIM_TOP_DB, trim_pad_ms(position));
    audio::normalize_to_dbfs(&mut pcm, TTS_TARGET_DBFS, TTS_MAX_GAIN_DB);
    audio::limit_peak(&mut pcm, TTS_PEAK_CEILING);
    audio::apply_edge_fades(&mut pcm, SAMPLE_RATE, EDGE_FADE_MS);
    pcm
}

// ═══════════════════════════════════════════════════════════════════════
//  Synthesizer seam + HTTP implementation
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("synthesis request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("synthesis endpoint rejected the request ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("synthesis produced unusable audio: {0}")]
    InvalidAudio(String),
    #[error("synthesis produced no audio")]
    EmptyAudio,
}

/// Text-to-speech seam: text in, mono 16 kHz float samples out.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, TtsError>;
}

/// Client for a local speech-synthesis endpoint.
///
/// The endpoint answers with either a WAV container or raw PCM16LE; both
/// are decoded (and resampled if needed) to 16 kHz mono float.
pub struct HttpSynthesizer {
    http: reqwest::Client,
    url: String,
    voice: String,
}

impl HttpSynthesizer {
    pub fn new(base_url: &str, voice: &str) -> Self {
        HttpSynthesizer {
            http: reqwest::Client::new(),
            url: format!("{}/v1/audio/speech", base_url.trim_end_matches('/')),
            voice: voice.to_string(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, TtsError> {
        let body = json!({
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
            "sample_rate": SAMPLE_RATE,
        });

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TtsError::Rejected {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let payload = response.bytes().await?;
        let samples = decode_audio_payload(&payload)?;
        debug!(chars = text.chars().count(), samples = samples.len(), "chunk synthesized");
        Ok(samples)
    }
}

/// Decode an audio payload: WAV container when the RIFF magic is
/// present, raw PCM16LE mono otherwise.
pub fn decode_audio_payload(payload: &[u8]) -> Result<Vec<f32>, TtsError> {
    if payload.is_empty() {
        return Err(TtsError::EmptyAudio);
    }
    if payload.len() >= 12 && &payload[0..4] == b"RIFF" && &payload[8..12] == b"WAVE" {
        decode_wav(payload)
    } else {
        Ok(audio::pcm16le_to_f32(payload))
    }
}

fn decode_wav(wav: &[u8]) -> Result<Vec<f32>, TtsError> {
    let mut offset = 12usize;
    let mut sample_rate = SAMPLE_RATE as u32;
    let mut channels = 1u16;
    let mut bits = 16u16;
    let mut data: Option<&[u8]> = None;

    while offset + 8 <= wav.len() {
        let id = &wav[offset..offset + 4];
        let size = u32::from_le_bytes([
            wav[offset + 4],
            wav[offset + 5],
            wav[offset + 6],
            wav[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = (body_start + size).min(wav.len());
        match id {
            b"fmt " if size >= 16 && body_start + 16 <= wav.len() => {
                channels = u16::from_le_bytes([wav[body_start + 2], wav[body_start + 3]]);
                sample_rate = u32::from_le_bytes([
                    wav[body_start + 4],
                    wav[body_start + 5],
                    wav[body_start + 6],
                    wav[body_start + 7],
                ]);
                bits = u16::from_le_bytes([wav[body_start + 14], wav[body_start + 15]]);
            }
            b"data" => data = Some(&wav[body_start..body_end]),
            _ => {}
        }
        // chunks are word-aligned
        offset = body_start + size + (size % 2);
    }

    let data = data.ok_or_else(|| TtsError::InvalidAudio("no data chunk".into()))?;
    if bits != 16 {
        return Err(TtsError::InvalidAudio(format!("unsupported bit depth {bits}")));
    }
    if channels == 0 {
        return Err(TtsError::InvalidAudio("zero channels".into()));
    }

    let interleaved = audio::pcm16le_to_f32(data);
    let mono: Vec<f32> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    if sample_rate == SAMPLE_RATE as u32 {
        Ok(mono)
    } else {
        Ok(resample_linear(&mono, sample_rate, SAMPLE_RATE as u32))
    }
}

/// Linear-interpolation resampler, good enough for voice.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let n_in = samples.len();
    if n_in == 0 || from_rate == to_rate {
        return samples.to_vec();
    }

    let n_out = ((n_in as u64 * to_rate as u64) / from_rate as u64) as usize;
    if n_out <= 1 {
        return vec![samples[0]];
    }

    let mut out = Vec::with_capacity(n_out);
    for j in 0..n_out {
        let pos = (j as f64) * ((n_in - 1) as f64) / ((n_out - 1) as f64);
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let s = if idx + 1 < n_in {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples[n_in - 1]
        };
        out.push(s);
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Reply pipeline
// ═══════════════════════════════════════════════════════════════════════

/// Synthesize a full reply: chunk the text, synthesize and polish each
/// chunk, cross-fade the boundaries.
pub async fn synthesize_reply(
    synth: &dyn Synthesizer,
    text: &str,
    max_chunks: usize,
) -> Result<Vec<f32>, TtsError> {
    let chunks = split_for_tts(text, max_chunks);
    if chunks.is_empty() {
        return Err(TtsError::EmptyAudio);
    }

    let total = chunks.len();
    let mut polished = Vec::with_capacity(total);
    for (i, chunk_text) in chunks.iter().enumerate() {
        let samples = synth.synthesize(chunk_text).await?;
        let processed = polish_chunk(samples, position_of(i, total));
        if !processed.is_empty() {
            polished.push(processed);
        }
    }
    if polished.is_empty() {
        return Err(TtsError::EmptyAudio);
    }

    let overlap = audio::crossfade_samples(SAMPLE_RATE, CROSSFADE_MS);
    Ok(audio::merge_with_crossfade(&polished, overlap))
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_stays_single_chunk() {
        let chunks = split_for_tts("안녕하세요!", 3);
        assert_eq!(chunks, vec!["안녕하세요!"]);
    }

    #[test]
    fn test_max_chunks_one_forces_single() {
        let long: String = "가".repeat(120);
        assert_eq!(split_for_tts(&long, 1).len(), 1);
    }

    #[test]
    fn test_medium_text_splits_into_two() {
        // > 44 and ≤ 92 chars → two chunks
        let text = "오늘 일정을 확인해 보니 오후 세 시에 회의가 있고, 저녁 여섯 시에는 운동 약속이 있어요.";
        let n = text.chars().count();
        assert!(n > SINGLE_CHUNK_MAX_CHARS && n <= TWO_CHUNK_MAX_CHARS);
        let chunks = split_for_tts(text, 3);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_long_text_splits_into_three() {
        let text = "오늘 일정을 확인해 보니 오후 세 시에 회의가 있고, 저녁 여섯 시에는 운동 약속이 있어요. \
                    준비할 게 있으면 미리 알려드릴게요. 내일은 아침 일찍 병원 예약도 잡혀 있으니 잊지 마세요.";
        assert!(text.chars().count() > TWO_CHUNK_MAX_CHARS);
        let chunks = split_for_tts(text, 3);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_split_preserves_content() {
        let text = "오늘 일정을 확인해 보니 오후 세 시에 회의가 있고, 저녁 여섯 시에는 운동 약속이 있어요.";
        let chunks = split_for_tts(text, 3);
        let rejoined: String = chunks.join("").chars().filter(|c| !c.is_whitespace()).collect();
        let original: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(rejoined, original);
    }

    #[test]
    fn test_split_prefers_punctuation_boundary() {
        let text = "첫 번째 문장은 여기서 끝나요, 그리고 두 번째 문장이 바로 이어서 계속 말을 해요";
        let chunks = split_for_tts(text, 3);
        assert!(chunks.len() >= 2);
        assert!(
            chunks[0].ends_with(','),
            "expected cut after punctuation, got {:?}",
            chunks[0]
        );
    }

    #[test]
    fn test_tiny_chunks_are_merged() {
        let merged = merge_short_chunks(vec![
            "네".to_string(),
            "오늘은 날씨가 정말 좋아요".to_string(),
            "네!".to_string(),
        ]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].contains("날씨"));
    }

    #[test]
    fn test_position_of() {
        assert_eq!(position_of(0, 1), ChunkPosition::Only);
        assert_eq!(position_of(0, 3), ChunkPosition::First);
        assert_eq!(position_of(1, 3), ChunkPosition::Middle);
        assert_eq!(position_of(2, 3), ChunkPosition::Last);
    }

    #[test]
    fn test_polish_limits_peak_and_fades_edges() {
        let samples: Vec<f32> = (0..SAMPLE_RATE / 2)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                0.95 * (t * 220.0 * 2.0 * std::f32::consts::PI).sin() + 0.05
            })
            .collect();
        let polished = polish_chunk(samples, ChunkPosition::Only);
        assert!(!polished.is_empty());
        let peak = polished.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(peak <= TTS_PEAK_CEILING + 1e-4, "peak={peak}");
        assert!(polished[0].abs() < 0.05, "fade-in missing");
        assert!(polished[polished.len() - 1].abs() < 0.05, "fade-out missing");
    }

    #[test]
    fn test_decode_wav_payload() {
        let pcm: Vec<u8> = (0..640u32).flat_map(|i| ((i as i16) * 10).to_le_bytes()).collect();
        let wav = crate::stt::wav_bytes(&pcm, 16_000);
        let samples = decode_audio_payload(&wav).unwrap();
        assert_eq!(samples.len(), 640);
        assert!((samples[1] - 10.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_raw_pcm_payload() {
        let pcm: Vec<u8> = vec![0x00, 0x40, 0x00, 0xc0]; // +16384, -16384
        let samples = decode_audio_payload(&pcm).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert!((samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_wav_resamples_to_16k() {
        // 24 kHz source: 2400 samples → 1600 at 16 kHz
        let pcm: Vec<u8> = std::iter::repeat([0u8, 16u8]).take(2400).flatten().collect();
        let wav = crate::stt::wav_bytes(&pcm, 24_000);
        let samples = decode_audio_payload(&wav).unwrap();
        assert_eq!(samples.len(), 1600);
    }

    #[test]
    fn test_decode_empty_payload_fails() {
        assert!(matches!(decode_audio_payload(&[]), Err(TtsError::EmptyAudio)));
    }

    #[test]
    fn test_resample_ratio() {
        let samples = vec![0.1f32; 700];
        assert_eq!(resample_linear(&samples, 16_000, 24_000).len(), 1050);
        assert_eq!(resample_linear(&samples, 16_000, 16_000).len(), 700);
    }

    struct FixedSynth {
        samples: Vec<f32>,
    }

    #[async_trait]
    impl Synthesizer for FixedSynth {
        async fn synthesize(&self, _text: &str) -> Result<Vec<f32>, TtsError> {
            Ok(self.samples.clone())
        }
    }

    #[tokio::test]
    async fn test_synthesize_reply_produces_merged_audio() {
        let tone: Vec<f32> = (0..SAMPLE_RATE)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                0.4 * (t * 330.0 * 2.0 * std::f32::consts::PI).sin()
            })
            .collect();
        let synth = FixedSynth { samples: tone };

        let text = "오늘 일정을 확인해 보니 오후 세 시에 회의가 있고, 저녁 여섯 시에는 운동 약속이 있어요.";
        let merged = synthesize_reply(&synth, text, 3).await.unwrap();
        assert!(!merged.is_empty());
        let peak = merged.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(peak <= TTS_PEAK_CEILING + 1e-4);
    }

    struct FailingSynth;

    #[async_trait]
    impl Synthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str) -> Result<Vec<f32>, TtsError> {
            Err(TtsError::EmptyAudio)
        }
    }

    #[tokio::test]
    async fn test_synthesize_reply_propagates_failure() {
        let result = synthesize_reply(&FailingSynth, "안녕하세요", 3).await;
        assert!(result.is_err());
    }
}
