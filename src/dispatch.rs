/// Mode state machine and per-utterance routing.
///
/// Holds the session's current mode and is the only place it changes.
/// Robot turns end in one `CMD`; agent turns end in an audio stream.
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tracing::{info, warn};

use crate::agent::{AgentAdapter, Intent};
use crate::audio;
use crate::command::ActionCommand;
use crate::protocol::FrameSink;
use crate::robot::{RobotAdapter, RobotDecision};
use crate::session::SessionShared;
use crate::stats::Stats;
use crate::tts::{self, Synthesizer};

/// Behavioral mode of a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Text → servo action commands.
    Robot,
    /// Text → conversational reply → synthesized speech.
    Agent,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Robot => write!(f, "robot"),
            Mode::Agent => write!(f, "agent"),
        }
    }
}

pub struct Dispatcher {
    mode: Arc<Mutex<Mode>>,
    robot: RobotAdapter,
    agent: AgentAdapter,
    synthesizer: Arc<dyn Synthesizer>,
    stats: Arc<Stats>,
    max_chunks: usize,
}

impl Dispatcher {
    pub fn new(
        mode: Arc<Mutex<Mode>>,
        robot: RobotAdapter,
        agent: AgentAdapter,
        synthesizer: Arc<dyn Synthesizer>,
        stats: Arc<Stats>,
        max_chunks: usize,
    ) -> Self {
        Dispatcher {
            mode,
            robot,
            agent,
            synthesizer,
            stats,
            max_chunks,
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// The single mode mutation point.  Idempotent; on a real transition
    /// it notifies the device with either speech (→ agent) or a wiggle
    /// (→ robot), never both.
    pub async fn switch_mode<W: AsyncWrite + Unpin + Send>(
        &mut self,
        target: Mode,
        sid: u64,
        sink: &FrameSink<W>,
    ) {
        let current = self.mode();
        if current == target {
            return;
        }
        self.set_mode(target);
        info!("==================================================");
        info!(from = %current, to = %target, "mode switched");
        info!("==================================================");

        match target {
            Mode::Agent => {
                let notice = format!("{target} 모드로 변경되었습니다.");
                self.speak(&notice, sink).await;
            }
            Mode::Robot => {
                if sink.send_action(&ActionCommand::Wiggle { sid }).await {
                    self.stats.record_command_sent();
                }
            }
        }
    }

    /// Unsure policy for too-short or silent utterances.
    pub async fn handle_unsure<W: AsyncWrite + Unpin + Send>(
        &self,
        sid: u64,
        sink: &FrameSink<W>,
    ) {
        if self.mode() == Mode::Robot {
            if sink.send_action(&ActionCommand::unsure(sid)).await {
                self.stats.record_command_sent();
            }
        }
    }

    /// Route one recognized utterance through the current mode.
    pub async fn handle_utterance<W: AsyncWrite + Unpin + Send>(
        &mut self,
        sid: u64,
        text: &str,
        shared: &SessionShared,
        sink: &FrameSink<W>,
    ) {
        // Named mode-switch commands work from either mode.
        let (catalog_decision, catalog_meaningful) =
            self.robot.match_catalog(text, shared.servo_angle());
        if catalog_meaningful {
            if let RobotDecision::SwitchMode(target) = catalog_decision {
                self.switch_mode(target, sid, sink).await;
                return;
            }
        }

        match self.mode() {
            Mode::Robot => self.robot_turn(sid, text, shared, sink).await,
            Mode::Agent => self.agent_turn(sid, text, sink).await,
        }
    }

    async fn robot_turn<W: AsyncWrite + Unpin + Send>(
        &mut self,
        sid: u64,
        text: &str,
        shared: &SessionShared,
        sink: &FrameSink<W>,
    ) {
        if text.is_empty() {
            self.handle_unsure(sid, sink).await;
            return;
        }

        let llm_start = Instant::now();
        let (refined, decision) = self.robot.decide(text, shared.servo_angle()).await;
        self.stats.record_llm(llm_start.elapsed());
        if refined != text {
            info!(original = text, refined = %refined, "transcript refined");
        }

        let recognized = true;
        let meaningful = !decision.is_noop();
        let command = match decision {
            RobotDecision::SwitchMode(target) => {
                self.switch_mode(target, sid, sink).await;
                return;
            }
            RobotDecision::ServoSet { servo, angle } => {
                shared.set_servo_angle(angle);
                ActionCommand::ServoSet {
                    servo,
                    angle,
                    sid,
                    meaningful,
                    recognized,
                }
            }
            RobotDecision::Stop { servo } => ActionCommand::Stop { servo },
            RobotDecision::Wiggle => ActionCommand::Wiggle { sid },
            RobotDecision::Noop => ActionCommand::Noop {
                sid,
                meaningful: false,
                recognized,
            },
        };

        if sink.send_action(&command).await {
            self.stats.record_command_sent();
        }
    }

    async fn agent_turn<W: AsyncWrite + Unpin + Send>(
        &mut self,
        sid: u64,
        text: &str,
        sink: &FrameSink<W>,
    ) {
        if text.is_empty() {
            return;
        }

        let llm_start = Instant::now();
        let reply = self.agent.reply(text).await;
        self.stats.record_llm(llm_start.elapsed());
        info!(reply = %reply.text, "agent reply");

        match reply.intent {
            Intent::ModeRobot => {
                self.switch_mode(Mode::Robot, sid, sink).await;
                return;
            }
            Intent::ModeAgent => {}
            Intent::Sleep => info!("sleep intent acknowledged"),
            Intent::None => {}
        }

        // Emotion directives pass through as CMD frames.
        if let Some(emotion_cmd) = reply.emotion_update {
            if sink.send_action(&emotion_cmd).await {
                self.stats.record_command_sent();
            }
        }

        self.speak(&reply.text, sink).await;
    }

    /// Synthesize and stream one reply as AUDIO_OUT* + AUDIO_OUT_END.
    async fn speak<W: AsyncWrite + Unpin + Send>(&self, text: &str, sink: &FrameSink<W>) {
        let tts_start = Instant::now();
        match tts::synthesize_reply(self.synthesizer.as_ref(), text, self.max_chunks).await {
            Ok(samples) => {
                self.stats.record_tts(tts_start.elapsed());
                let pcm = audio::f32_to_pcm16le(&samples);
                if sink.send_audio(&pcm).await {
                    self.stats.record_audio_reply();
                } else {
                    warn!("audio reply aborted mid-stream");
                }
            }
            Err(e) => {
                warn!(error = %e, "tts failed - reply skipped");
                self.stats.record_error();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{AgentBrain, InfoServices, Personality};
    use crate::llm::LlmClient;
    use crate::protocol::{FrameReader, PacketType, RawFrame};
    use crate::tts::TtsError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ToneSynth;

    #[async_trait]
    impl Synthesizer for ToneSynth {
        async fn synthesize(&self, _text: &str) -> Result<Vec<f32>, TtsError> {
            Ok((0..crate::audio::SAMPLE_RATE / 2)
                .map(|i| {
                    let t = i as f32 / crate::audio::SAMPLE_RATE as f32;
                    0.4 * (t * 440.0 * 2.0 * std::f32::consts::PI).sin()
                })
                .collect())
        }
    }

    fn dispatcher(initial: Mode) -> (Dispatcher, tempfile::TempDir) {
        let snapshots = tempfile::tempdir().unwrap();
        let llm = Arc::new(LlmClient::new("http://127.0.0.1:1", "test", false));
        let brain = Arc::new(Mutex::new(AgentBrain::new(
            "아이",
            Personality::Cheerful,
            snapshots.path().to_str().unwrap(),
        )));
        let info = Arc::new(InfoServices::new("", "Seoul"));
        let catalog = Arc::new(crate::robot::load_catalog("/nonexistent-commands.yaml"));

        let dispatcher = Dispatcher::new(
            Arc::new(Mutex::new(initial)),
            RobotAdapter::new(catalog, None),
            AgentAdapter::new(llm, brain, info),
            Arc::new(ToneSynth),
            Stats::new(),
            3,
        );
        (dispatcher, snapshots)
    }

    async fn drain_frames(server: impl tokio::io::AsyncRead + Unpin) -> Vec<RawFrame> {
        let mut reader = FrameReader::new(server, Duration::from_millis(20));
        let mut frames = Vec::new();
        while let Ok(frame) = reader.read_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_unsure_in_robot_mode_sends_noop() {
        let (dispatcher, _dir) = dispatcher(Mode::Robot);
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);

        dispatcher.handle_unsure(3, &sink).await;
        drop(sink);

        let frames = drain_frames(server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type(), Some(PacketType::Cmd));
        let json: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(json["action"], "NOOP");
        assert_eq!(json["sid"], 3);
        assert_eq!(json["meaningful"], false);
        assert_eq!(json["recognized"], false);
    }

    #[tokio::test]
    async fn test_unsure_in_agent_mode_is_silent() {
        let (dispatcher, _dir) = dispatcher(Mode::Agent);
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);

        dispatcher.handle_unsure(3, &sink).await;
        drop(sink);

        assert!(drain_frames(server).await.is_empty());
    }

    #[tokio::test]
    async fn test_robot_servo_command_updates_state() {
        let (mut dispatcher, _dir) = dispatcher(Mode::Robot);
        let shared = SessionShared::new();
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);

        dispatcher.handle_utterance(1, "가운데로", &shared, &sink).await;
        drop(sink);

        let frames = drain_frames(server).await;
        assert_eq!(frames.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(json["action"], "SERVO_SET");
        assert_eq!(json["servo"], 0);
        assert_eq!(json["angle"], 90);
        assert_eq!(json["sid"], 1);
        assert_eq!(json["meaningful"], true);
        assert_eq!(json["recognized"], true);
        assert_eq!(shared.servo_angle(), 90);
    }

    #[tokio::test]
    async fn test_switch_to_robot_sends_wiggle_not_audio() {
        let (mut dispatcher, _dir) = dispatcher(Mode::Agent);
        let shared = SessionShared::new();
        let (client, server) = tokio::io::duplex(1 << 20);
        let sink = FrameSink::new(client);

        dispatcher.handle_utterance(2, "로봇 모드로 바꿔", &shared, &sink).await;
        drop(sink);

        let frames = drain_frames(server).await;
        assert_eq!(frames.len(), 1, "exactly one notification");
        assert_eq!(frames[0].packet_type(), Some(PacketType::Cmd));
        let json: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(json["action"], "WIGGLE");
        assert_eq!(dispatcher.mode(), Mode::Robot);
    }

    #[tokio::test]
    async fn test_switch_to_agent_sends_audio_notification() {
        let (mut dispatcher, _dir) = dispatcher(Mode::Robot);
        let shared = SessionShared::new();
        let (client, server) = tokio::io::duplex(1 << 22);
        let sink = FrameSink::new(client);

        dispatcher.handle_utterance(2, "대화 모드로 돌아가", &shared, &sink).await;
        drop(sink);

        let frames = drain_frames(server).await;
        let audio_count = frames
            .iter()
            .filter(|f| f.packet_type() == Some(PacketType::AudioOut))
            .count();
        let end_count = frames
            .iter()
            .filter(|f| f.packet_type() == Some(PacketType::AudioOutEnd))
            .count();
        assert!(audio_count >= 1, "speech notification expected");
        assert_eq!(end_count, 1);
        assert!(frames
            .iter()
            .all(|f| f.packet_type() != Some(PacketType::Cmd)));
        assert_eq!(dispatcher.mode(), Mode::Agent);
    }

    #[tokio::test]
    async fn test_switch_mode_is_idempotent() {
        let (mut dispatcher, _dir) = dispatcher(Mode::Robot);
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);

        dispatcher.switch_mode(Mode::Robot, 1, &sink).await;
        drop(sink);

        assert!(drain_frames(server).await.is_empty());
        assert_eq!(dispatcher.mode(), Mode::Robot);
    }

    #[tokio::test]
    async fn test_agent_turn_streams_audio_with_single_end() {
        // Dead LLM → canned apology, still spoken through the TTS path.
        let (mut dispatcher, _dir) = dispatcher(Mode::Agent);
        let shared = SessionShared::new();
        let (client, server) = tokio::io::duplex(1 << 22);
        let sink = FrameSink::new(client);

        dispatcher.handle_utterance(1, "안녕", &shared, &sink).await;
        drop(sink);

        let frames = drain_frames(server).await;
        let audio: Vec<_> = frames
            .iter()
            .filter(|f| f.packet_type() == Some(PacketType::AudioOut))
            .collect();
        assert!(!audio.is_empty());
        for frame in &audio {
            assert_eq!(frame.payload.len() % 2, 0);
        }
        let ends = frames
            .iter()
            .filter(|f| f.packet_type() == Some(PacketType::AudioOutEnd))
            .count();
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn test_agent_turn_with_empty_text_is_silent() {
        let (mut dispatcher, _dir) = dispatcher(Mode::Agent);
        let shared = SessionShared::new();
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);

        dispatcher.handle_utterance(1, "", &shared, &sink).await;
        drop(sink);

        assert!(drain_frames(server).await.is_empty());
    }

    #[tokio::test]
    async fn test_robot_turn_with_empty_text_sends_noop() {
        let (mut dispatcher, _dir) = dispatcher(Mode::Robot);
        let shared = SessionShared::new();
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);

        dispatcher.handle_utterance(4, "", &shared, &sink).await;
        drop(sink);

        let frames = drain_frames(server).await;
        assert_eq!(frames.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(json["action"], "NOOP");
    }
}
