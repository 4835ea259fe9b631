use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::audio;

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("speech endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("speech endpoint rejected the request ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("speech endpoint returned invalid JSON: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("empty audio buffer")]
    EmptyAudio,
}

/// Speech-to-text seam: mono 16 kHz float samples in, transcript out.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: &[f32]) -> Result<String, SttError>;

    /// Whether the backing model has answered at least once (surfaced in
    /// the session status log).
    fn is_loaded(&self) -> bool;
}

/// Client for a local whisper-server style speech endpoint.
///
/// Utterances are wrapped into an in-memory WAV and posted as multipart
/// form data; the endpoint answers `{"text": "..."}`.
pub struct HttpTranscriber {
    http: reqwest::Client,
    url: String,
    model: String,
    language: String,
    loaded: AtomicBool,
}

impl HttpTranscriber {
    pub fn new(base_url: &str, model: &str, language: &str) -> Self {
        HttpTranscriber {
            http: reqwest::Client::new(),
            url: format!(
                "{}/v1/audio/transcriptions",
                base_url.trim_end_matches('/')
            ),
            model: model.to_string(),
            language: language.to_string(),
            loaded: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, pcm: &[f32]) -> Result<String, SttError> {
        if pcm.is_empty() {
            return Err(SttError::EmptyAudio);
        }

        let wav = wav_bytes(&audio::f32_to_pcm16le(pcm), audio::SAMPLE_RATE as u32);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let response = self.http.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SttError::Rejected {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        let raw = value.get("text").and_then(|v| v.as_str()).unwrap_or("");

        self.loaded.store(true, Ordering::Relaxed);
        Ok(strip_transcript_artifacts(raw))
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }
}

/// Remove engine artifacts the model emits on silence.
fn strip_transcript_artifacts(text: &str) -> String {
    text.replace("[BLANK_AUDIO]", "").trim().to_string()
}

/// Wrap PCM16LE data in a minimal 44-byte WAV container (16 kHz, 16-bit,
/// mono).
pub fn wav_bytes(pcm_data: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm_data.len() as u32;
    let bits_per_sample: u16 = 16;
    let channels: u16 = 1;
    let byte_rate = sample_rate * u32::from(bits_per_sample / 8) * u32::from(channels);
    let block_align = channels * (bits_per_sample / 8);

    let mut wav = Vec::with_capacity(44 + pcm_data.len());
    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    // fmt sub-chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    // data sub-chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm_data);
    wav
}
