use std::time::Duration;

use clap::Parser;

use crate::dispatch::Mode;

/// Streaming voice-assistant server for ESP32-class edge devices:
/// framed TCP audio in, STT → robot/agent dispatch, JSON commands or
/// synthesized speech back out.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port the device connects to
    #[arg(long, env = "SERVER_PORT", default_value_t = 5001)]
    pub port: u16,

    // ── STT ────────────────────────────────────────────────────────────

    /// Base URL of the local speech-to-text server
    #[arg(long, default_value = "http://127.0.0.1:2022")]
    pub stt_base_url: String,

    /// STT model identifier passed to the speech endpoint
    #[arg(long, default_value = "small")]
    pub stt_model: String,

    /// Inference device hint forwarded to the STT server
    #[arg(long, env = "DEVICE", default_value = "cpu")]
    pub stt_device: String,

    /// Transcription language
    #[arg(long, default_value = "ko")]
    pub stt_language: String,

    // ── LLM ────────────────────────────────────────────────────────────

    /// Base URL of the Ollama-compatible LLM endpoint
    #[arg(long, default_value = "http://127.0.0.1:11434")]
    pub llm_base_url: String,

    /// Chat model name
    #[arg(long, default_value = "qwen3:4b")]
    pub llm_model: String,

    /// Allow the model to emit thinking traces on chat calls
    #[arg(long, default_value_t = false)]
    pub llm_think: bool,

    /// Start the LLM server when the base URL does not answer
    #[arg(long, default_value_t = false)]
    pub llm_auto_start: bool,

    /// Command used to start the LLM server (with --llm-auto-start)
    #[arg(long, default_value = "ollama serve")]
    pub llm_start_command: String,

    /// How long to wait for an auto-started LLM server
    #[arg(long, default_value_t = 30)]
    pub llm_startup_timeout_secs: u64,

    // ── TTS ────────────────────────────────────────────────────────────

    /// Base URL of the speech-synthesis endpoint
    #[arg(long, default_value = "http://127.0.0.1:8880")]
    pub tts_base_url: String,

    /// Synthesis voice
    #[arg(long, default_value = "ko-KR-SunHiNeural")]
    pub tts_voice: String,

    /// Maximum TTS chunks per reply
    #[arg(long, default_value_t = 3)]
    pub max_chunks: usize,

    // ── Session ────────────────────────────────────────────────────────

    /// Utterance job queue capacity (drop-oldest beyond this)
    #[arg(long, default_value_t = 4)]
    pub stt_queue_size: usize,

    /// Socket read timeout in milliseconds (keepalive tick)
    #[arg(long, default_value_t = 500)]
    pub socket_timeout_ms: u64,

    /// Hard cap on one utterance; longer streams are force-ended
    #[arg(long, default_value_t = 12)]
    pub max_audio_seconds: u64,

    /// Mode every connection starts in
    #[arg(long, value_enum, default_value_t = Mode::Agent)]
    pub default_mode: Mode,

    // ── Assistant persona / collaborators ──────────────────────────────

    /// Assistant name used in prompts and self-intro stripping
    #[arg(long, env = "ASSISTANT_NAME", default_value = "아이")]
    pub assistant_name: String,

    /// Persona: cheerful, calm, playful, serious
    #[arg(long, default_value = "cheerful")]
    pub personality: String,

    /// OpenWeatherMap-compatible API key for the info services
    #[arg(long, env = "WEATHER_API_KEY", default_value = "")]
    pub weather_api_key: String,

    /// Location used for weather lookups
    #[arg(long, default_value = "Seoul")]
    pub weather_location: String,

    /// YAML catalog of named robot commands
    #[arg(long, default_value = "commands.yaml")]
    pub commands_file: String,

    /// Directory for best-effort conversation context snapshots
    #[arg(long, default_value = "context_snapshots")]
    pub snapshot_dir: String,

    /// Interval stats logging in seconds (0 = disabled)
    #[arg(long, default_value_t = 30)]
    pub stats_interval_secs: u64,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Utterance byte cap: `max_seconds · 16 kHz · 2 bytes`.
    pub fn max_audio_bytes(&self) -> usize {
        self.max_audio_seconds as usize * crate::audio::SAMPLE_RATE * 2
    }

    pub fn llm_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_startup_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["esp-voice-bridge"]);
        assert_eq!(config.port, 5001);
        assert_eq!(config.stt_queue_size, 4);
        assert_eq!(config.default_mode, Mode::Agent);
        assert_eq!(config.max_audio_bytes(), 12 * 16_000 * 2);
        assert_eq!(config.socket_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_mode_override() {
        let config = Config::parse_from(["esp-voice-bridge", "--default-mode", "robot"]);
        assert_eq!(config.default_mode, Mode::Robot);
    }
}
