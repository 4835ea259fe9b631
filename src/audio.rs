/// Audio DSP primitives for the voice pipeline.
///
/// Everything operates on mono float32 samples in `[-1.0, 1.0]` at
/// 16 kHz; the wire carries 16-bit LE PCM at the same rate.
// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Sample rate used end to end (device mic, STT input, TTS output).
pub const SAMPLE_RATE: usize = 16_000;

/// Utterances quieter than this RMS level are treated as silence.
pub const SILENCE_FLOOR_DB: f32 = -45.0;

/// Energy-trim threshold relative to the loudest frame, in dB.
pub const TRIM_TOP_DB: f32 = 35.0;

/// Padding kept around trimmed inbound speech.
pub const INBOUND_TRIM_PAD_MS: usize = 140;

/// Inbound normalization target (analysis headroom for STT).
pub const INBOUND_TARGET_DBFS: f32 = -22.0;

/// TTS output normalization target and gain ceiling.
pub const TTS_TARGET_DBFS: f32 = -18.0;
pub const TTS_MAX_GAIN_DB: f32 = 18.0;

/// Hard ceiling applied to TTS output after normalization.
pub const TTS_PEAK_CEILING: f32 = 0.90;

/// Linear fade applied to both edges of every TTS chunk.
pub const EDGE_FADE_MS: usize = 8;

/// Cross-fade window between adjacent TTS chunks.
pub const CROSSFADE_MS: usize = 12;

const EPS: f64 = 1e-12;

// ═══════════════════════════════════════════════════════════════════════
//  Quality metrics
// ═══════════════════════════════════════════════════════════════════════

/// Signal quality snapshot of one utterance.
#[derive(Debug, Clone, Copy)]
pub struct QualityReport {
    /// Peak absolute amplitude.
    pub peak: f32,
    /// RMS level in dBFS.
    pub rms_db: f32,
    /// Percentage of samples at or beyond the clipping point.
    pub clip_ratio: f32,
}

impl QualityReport {
    pub fn is_silence(&self) -> bool {
        self.rms_db < SILENCE_FLOOR_DB
    }
}

/// Compute peak / RMS-dBFS / clip ratio for a buffer.
pub fn quality(pcm: &[f32]) -> QualityReport {
    if pcm.is_empty() {
        return QualityReport {
            peak: 0.0,
            rms_db: 20.0 * (EPS as f32).log10(),
            clip_ratio: 0.0,
        };
    }

    let mut peak = 0.0f32;
    let mut sum_sq = 0.0f64;
    let mut clipped = 0usize;
    for &x in pcm {
        let a = x.abs();
        if a > peak {
            peak = a;
        }
        if a >= 0.999 {
            clipped += 1;
        }
        sum_sq += (x as f64) * (x as f64);
    }
    let rms = (sum_sq / pcm.len() as f64 + EPS).sqrt();
    QualityReport {
        peak,
        rms_db: (20.0 * (rms + EPS).log10()) as f32,
        clip_ratio: (clipped as f32) / (pcm.len() as f32) * 100.0,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Trim / normalize / shape
// ═══════════════════════════════════════════════════════════════════════

/// Energy-based trim over 20 ms non-overlapping frames.
///
/// Keeps the inclusive range of frames whose RMS exceeds
/// `max_frame_rms · 10^(−top_db/20)`, expanded by `pad_ms` on each side
/// and clamped to the buffer.  Returns the input unchanged when no frame
/// passes the threshold.
pub fn trim_energy(pcm: &[f32], sr: usize, top_db: f32, pad_ms: usize) -> Vec<f32> {
    let frame = sr / 50; // 20 ms
    let n = pcm.len();
    if n < frame || frame == 0 {
        return pcm.to_vec();
    }

    let mut frame_rms = Vec::with_capacity(n / frame + 1);
    let mut i = 0usize;
    while i + frame <= n {
        let window = &pcm[i..i + frame];
        let sum_sq: f64 = window.iter().map(|&x| (x as f64) * (x as f64)).sum();
        frame_rms.push((sum_sq / frame as f64 + EPS).sqrt());
        i += frame;
    }

    let max_rms = frame_rms.iter().cloned().fold(0.0f64, f64::max);
    let threshold = max_rms * 10f64.powf(-(top_db as f64) / 20.0);

    let first = frame_rms.iter().position(|&r| r > threshold);
    let last = frame_rms.iter().rposition(|&r| r > threshold);
    let (first, last) = match (first, last) {
        (Some(f), Some(l)) => (f, l),
        _ => return pcm.to_vec(),
    };

    let pad = sr * pad_ms / 1000;
    let start = (first * frame).saturating_sub(pad);
    let end = (last * frame + frame + pad).min(n);
    pcm[start..end].to_vec()
}

/// Normalize RMS to `target_dbfs`, with the gain clamped to
/// `[-6 dB, max_gain_db]`, then hard-clip to `[-1, 1]`.
pub fn normalize_to_dbfs(pcm: &mut [f32], target_dbfs: f32, max_gain_db: f32) {
    if pcm.is_empty() {
        return;
    }
    let sum_sq: f64 = pcm.iter().map(|&x| (x as f64) * (x as f64)).sum();
    let rms = (sum_sq / pcm.len() as f64 + EPS).sqrt();
    let rms_db = 20.0 * (rms + EPS).log10();
    let gain_db = ((target_dbfs as f64) - rms_db).clamp(-6.0, max_gain_db as f64);
    let gain = 10f64.powf(gain_db / 20.0) as f32;
    for x in pcm.iter_mut() {
        *x = (*x * gain).clamp(-1.0, 1.0);
    }
}

/// Subtract the mean so TTS output has no DC offset.
pub fn remove_dc_offset(pcm: &mut [f32]) {
    if pcm.is_empty() {
        return;
    }
    let mean = (pcm.iter().map(|&x| x as f64).sum::<f64>() / pcm.len() as f64) as f32;
    for x in pcm.iter_mut() {
        *x -= mean;
    }
}

/// Scale down uniformly when the peak exceeds `ceiling`.
pub fn limit_peak(pcm: &mut [f32], ceiling: f32) {
    let peak = pcm.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
    if peak > ceiling && peak > 0.0 {
        let scale = ceiling / peak;
        for x in pcm.iter_mut() {
            *x *= scale;
        }
    }
}

/// Linear fade-in and fade-out over `fade_ms` at each edge.
pub fn apply_edge_fades(pcm: &mut [f32], sr: usize, fade_ms: usize) {
    let fade = (sr * fade_ms / 1000).min(pcm.len() / 2);
    if fade == 0 {
        return;
    }
    let n = pcm.len();
    for i in 0..fade {
        let ramp = (i + 1) as f32 / (fade + 1) as f32;
        pcm[i] *= ramp;
        pcm[n - 1 - i] *= ramp;
    }
}

/// Number of samples in a cross-fade window.
pub fn crossfade_samples(sr: usize, crossfade_ms: usize) -> usize {
    sr * crossfade_ms / 1000
}

/// Concatenate chunks with linearly complementary cross-fades on each
/// boundary.  The merged length is exactly `Σ len − (k−1)·overlap`
/// (boundaries shrink when either neighbour is shorter than `overlap`).
pub fn merge_with_crossfade(chunks: &[Vec<f32>], overlap: usize) -> Vec<f32> {
    let mut merged: Vec<f32> = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks {
        if merged.is_empty() {
            merged.extend_from_slice(chunk);
            continue;
        }
        let o = overlap.min(merged.len()).min(chunk.len());
        let tail_start = merged.len() - o;
        for i in 0..o {
            let t = (i + 1) as f32 / (o + 1) as f32;
            merged[tail_start + i] = merged[tail_start + i] * (1.0 - t) + chunk[i] * t;
        }
        merged.extend_from_slice(&chunk[o..]);
    }
    merged
}

// ═══════════════════════════════════════════════════════════════════════
//  PCM16 ↔ float32
// ═══════════════════════════════════════════════════════════════════════

/// Decode 16-bit LE PCM to float samples in `[-1, 1]`.
pub fn pcm16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode float samples to 16-bit LE PCM, clamping and rounding.
pub fn f32_to_pcm16le(pcm: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for &x in pcm {
        let s = (x.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Duration of a PCM16LE byte buffer at the pipeline sample rate.
pub fn pcm16_duration_secs(byte_len: usize) -> f32 {
    byte_len as f32 / 2.0 / SAMPLE_RATE as f32
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
