/// Robot mode: recognized text → servo control decision.
///
/// Two layers, mirroring how the device is actually driven: a named
/// command catalog (keywords / regex with captured angles, loaded from
/// YAML) answers fast and deterministically, and the LLM refines noisy
/// transcripts and interprets free-form commands.  Every failure path
/// collapses to NOOP; robot mode never propagates an error.
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::command::SERVO_CENTER;
use crate::dispatch::Mode;
use crate::llm::{ChatMessage, LlmClient};
use crate::text::clamp_angle;

/// Default step for relative movements (degrees).
const DEFAULT_STEP: i32 = 20;

/// Upper bound of catalog entries listed in the LLM prompt.
const PROMPT_COMMAND_LIMIT: usize = 10;

// ═══════════════════════════════════════════════════════════════════════
//  Decision
// ═══════════════════════════════════════════════════════════════════════

/// Closed decision set for one robot-mode turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotDecision {
    ServoSet { servo: u8, angle: i32 },
    Stop { servo: u8 },
    Wiggle,
    SwitchMode(Mode),
    Noop,
}

impl RobotDecision {
    pub fn is_noop(&self) -> bool {
        matches!(self, RobotDecision::Noop)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Catalog
// ═══════════════════════════════════════════════════════════════════════

/// Action kinds a catalog entry can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogAction {
    ServoSet,
    ServoInc,
    ServoDec,
    Stop,
    Wiggle,
    SwitchMode,
}

/// One named command from the YAML catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Optional regex; group 1 may capture an angle when `use_captured`.
    #[serde(default)]
    pub pattern: Option<String>,
    pub action: CatalogAction,
    #[serde(default)]
    pub servo: u8,
    #[serde(default)]
    pub angle: Option<i32>,
    #[serde(default)]
    pub value: Option<i32>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub use_captured: bool,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    commands: Vec<CommandSpec>,
}

/// A catalog entry with its pattern compiled.
pub struct CompiledCommand {
    spec: CommandSpec,
    regex: Option<Regex>,
}

/// Load the command catalog from YAML, falling back to the built-in set
/// when the file is missing or malformed.
pub fn load_catalog(path: &str) -> Vec<CompiledCommand> {
    let specs = match std::fs::read_to_string(path) {
        Ok(raw) => match serde_yaml::from_str::<CatalogFile>(&raw) {
            Ok(file) => {
                debug!(path, count = file.commands.len(), "command catalog loaded");
                file.commands
            }
            Err(e) => {
                warn!(path, error = %e, "bad command catalog - using built-in defaults");
                default_catalog()
            }
        },
        Err(_) => {
            debug!(path, "no command catalog file - using built-in defaults");
            default_catalog()
        }
    };
    compile_catalog(specs)
}

fn compile_catalog(specs: Vec<CommandSpec>) -> Vec<CompiledCommand> {
    specs
        .into_iter()
        .map(|spec| {
            let regex = spec.pattern.as_deref().and_then(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(command = %spec.name, error = %e, "bad pattern in catalog entry");
                    None
                }
            });
            CompiledCommand { spec, regex }
        })
        .collect()
}

fn default_catalog() -> Vec<CommandSpec> {
    fn entry(name: &str, keywords: &[&str], action: CatalogAction) -> CommandSpec {
        CommandSpec {
            name: name.to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            pattern: None,
            action,
            servo: 0,
            angle: None,
            value: None,
            mode: None,
            use_captured: false,
        }
    }

    let mut commands = vec![
        CommandSpec {
            angle: Some(SERVO_CENTER),
            ..entry("가운데", &["가운데", "중앙", "센터"], CatalogAction::ServoSet)
        },
        CommandSpec {
            value: Some(DEFAULT_STEP),
            ..entry("오른쪽", &["오른쪽", "우측"], CatalogAction::ServoInc)
        },
        CommandSpec {
            value: Some(DEFAULT_STEP),
            ..entry("왼쪽", &["왼쪽", "좌측"], CatalogAction::ServoDec)
        },
        CommandSpec {
            pattern: Some(r"(\d+)\s*도".to_string()),
            use_captured: true,
            ..entry("각도 지정", &[], CatalogAction::ServoSet)
        },
        entry("정지", &["멈춰", "정지", "그만"], CatalogAction::Stop),
        entry("흔들기", &["흔들어", "인사해"], CatalogAction::Wiggle),
    ];
    commands.push(CommandSpec {
        mode: Some(Mode::Robot),
        ..entry("로봇 모드", &["로봇 모드", "로봇모드"], CatalogAction::SwitchMode)
    });
    commands.push(CommandSpec {
        mode: Some(Mode::Agent),
        ..entry(
            "에이전트 모드",
            &["에이전트 모드", "대화 모드", "대화모드"],
            CatalogAction::SwitchMode,
        )
    });
    commands
}

// ═══════════════════════════════════════════════════════════════════════
//  Adapter
// ═══════════════════════════════════════════════════════════════════════

pub struct RobotAdapter {
    catalog: Arc<Vec<CompiledCommand>>,
    llm: Option<Arc<LlmClient>>,
}

impl RobotAdapter {
    pub fn new(catalog: Arc<Vec<CompiledCommand>>, llm: Option<Arc<LlmClient>>) -> Self {
        RobotAdapter { catalog, llm }
    }

    /// Deterministic catalog matching.  Returns the decision and whether
    /// any entry matched (`meaningful`).
    pub fn match_catalog(&self, text: &str, current_angle: i32) -> (RobotDecision, bool) {
        let text = text.trim();
        if text.is_empty() {
            return (RobotDecision::Noop, false);
        }

        for cmd in self.catalog.iter() {
            let mut captured: Option<i32> = None;
            let mut matched = cmd.spec.keywords.iter().any(|kw| text.contains(kw.as_str()));
            if !matched {
                if let Some(re) = &cmd.regex {
                    if let Some(caps) = re.captures(text) {
                        matched = true;
                        if cmd.spec.use_captured {
                            captured = caps.get(1).and_then(|m| m.as_str().parse().ok());
                        }
                    }
                }
            }
            if !matched {
                continue;
            }

            let decision = match cmd.spec.action {
                CatalogAction::ServoSet => {
                    let angle = if cmd.spec.use_captured {
                        captured.or(cmd.spec.angle).unwrap_or(SERVO_CENTER)
                    } else {
                        cmd.spec.angle.unwrap_or(SERVO_CENTER)
                    };
                    RobotDecision::ServoSet {
                        servo: cmd.spec.servo,
                        angle: clamp_angle(angle),
                    }
                }
                CatalogAction::ServoInc => RobotDecision::ServoSet {
                    servo: cmd.spec.servo,
                    angle: clamp_angle(current_angle + cmd.spec.value.unwrap_or(DEFAULT_STEP)),
                },
                CatalogAction::ServoDec => RobotDecision::ServoSet {
                    servo: cmd.spec.servo,
                    angle: clamp_angle(current_angle - cmd.spec.value.unwrap_or(DEFAULT_STEP)),
                },
                CatalogAction::Stop => RobotDecision::Stop {
                    servo: cmd.spec.servo,
                },
                CatalogAction::Wiggle => RobotDecision::Wiggle,
                CatalogAction::SwitchMode => {
                    RobotDecision::SwitchMode(cmd.spec.mode.unwrap_or(Mode::Robot))
                }
            };
            return (decision, true);
        }

        (RobotDecision::Noop, false)
    }

    /// Full decision path: refine the transcript through the LLM, then
    /// interpret it; every failure falls back to catalog matching.
    pub async fn decide(&self, text: &str, current_angle: i32) -> (String, RobotDecision) {
        let llm = match &self.llm {
            Some(llm) => llm,
            None => return (text.to_string(), self.match_catalog(text, current_angle).0),
        };

        let refined = self.refine_transcript(llm, text).await;
        match self.interpret(llm, &refined, current_angle).await {
            Some(decision) => (refined, decision),
            None => {
                let (decision, _) = self.match_catalog(text, current_angle);
                (text.to_string(), decision)
            }
        }
    }

    /// Clean up STT noise ("가운대로" → "가운데로").  A refinement that
    /// balloons past 3× the original or comes back empty is discarded.
    async fn refine_transcript(&self, llm: &LlmClient, text: &str) -> String {
        if text.chars().count() < 2 {
            return text.to_string();
        }

        let messages = [
            ChatMessage::system(
                "당신은 음성인식 결과를 정제하는 전문가입니다.\n\
                 사용자의 음성인식 결과에 오타나 불명확한 부분이 있으면 올바른 한국어로 수정하세요.\n\
                 로봇 제어 명령어 맥락을 고려하여 정제하세요.\n\
                 정제된 텍스트만 출력하세요. 설명이나 추가 문장 없이 결과만 반환하세요.",
            ),
            ChatMessage::user(format!("다음 음성인식 결과를 정제하세요: {text}")),
        ];

        match llm.chat(&messages, 0.1, 64, Some(false)).await {
            Ok(refined) => {
                let refined = refined.trim().to_string();
                if refined.is_empty() || refined.chars().count() > text.chars().count() * 3 {
                    text.to_string()
                } else {
                    refined
                }
            }
            Err(e) => {
                debug!(error = %e, "transcript refinement unavailable");
                text.to_string()
            }
        }
    }

    /// Ask the LLM for a JSON action over the closed command set.
    /// `None` means the LLM path failed entirely.
    async fn interpret(
        &self,
        llm: &LlmClient,
        text: &str,
        current_angle: i32,
    ) -> Option<RobotDecision> {
        let mut commands_desc = Vec::new();
        for cmd in self.catalog.iter().take(PROMPT_COMMAND_LIMIT) {
            if cmd.spec.action == CatalogAction::SwitchMode || cmd.spec.keywords.is_empty() {
                continue;
            }
            let keywords = cmd
                .spec
                .keywords
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            commands_desc.push(format!("- {}: {} -> {:?}", cmd.spec.name, keywords, cmd.spec.action));
        }

        let system = format!(
            "당신은 로봇 제어 명령을 해석하는 AI입니다.\n\
             사용자의 음성 명령을 분석하여 적절한 로봇 동작을 JSON 형식으로 반환하세요.\n\n\
             현재 서보 각도: {current_angle}도\n\
             서보 각도 범위: 0-180도\n\n\
             사용 가능한 명령:\n{commands}\n\n\
             응답 형식 (JSON만 출력):\n\
             {{\"action\": \"SERVO_SET\", \"servo\": 0, \"angle\": 90}}\n\
             또는 {{\"action\": \"STOP\", \"servo\": 0}}\n\
             또는 {{\"action\": \"SWITCH_MODE\", \"mode\": \"agent\"}}\n\
             또는 {{\"action\": \"NOOP\"}}\n\n\
             규칙:\n\
             1. 각도 지정 명령은 SERVO_SET 사용\n\
             2. 상대 이동(올려/내려)은 현재 각도 기준으로 계산\n\
             3. 불명확한 명령은 NOOP 반환\n\
             4. JSON 형식만 출력, 설명 금지",
            commands = commands_desc.join("\n"),
        );

        let messages = [
            ChatMessage::system(system),
            ChatMessage::user(format!("명령: {text}")),
        ];

        match llm.chat(&messages, 0.1, 128, Some(false)).await {
            Ok(response) => Some(parse_llm_decision(&response)),
            Err(e) => {
                debug!(error = %e, "llm interpretation unavailable");
                None
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  LLM response parsing
// ═══════════════════════════════════════════════════════════════════════

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

#[derive(Debug, Deserialize)]
struct RawLlmAction {
    #[serde(default)]
    action: String,
    #[serde(default)]
    servo: Option<u8>,
    #[serde(default)]
    angle: Option<i64>,
    #[serde(default)]
    mode: Option<String>,
}

/// Extract the first `{...}` object from an LLM reply and map it onto
/// the closed decision set.  Anything unparsable is NOOP.
pub fn parse_llm_decision(response: &str) -> RobotDecision {
    let object = match JSON_OBJECT.find(response) {
        Some(m) => m.as_str(),
        None => return RobotDecision::Noop,
    };
    let raw: RawLlmAction = match serde_json::from_str(object) {
        Ok(raw) => raw,
        Err(_) => return RobotDecision::Noop,
    };

    match raw.action.as_str() {
        "SERVO_SET" => RobotDecision::ServoSet {
            servo: raw.servo.unwrap_or(0),
            angle: clamp_angle(raw.angle.unwrap_or(SERVO_CENTER as i64).clamp(-1, 181) as i32),
        },
        "STOP" => RobotDecision::Stop {
            servo: raw.servo.unwrap_or(0),
        },
        "SWITCH_MODE" => match raw.mode.as_deref() {
            Some("robot") => RobotDecision::SwitchMode(Mode::Robot),
            Some("agent") => RobotDecision::SwitchMode(Mode::Agent),
            _ => RobotDecision::Noop,
        },
        _ => RobotDecision::Noop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RobotAdapter {
        RobotAdapter::new(Arc::new(compile_catalog(default_catalog())), None)
    }

    #[test]
    fn test_catalog_center_keyword() {
        let (decision, meaningful) = adapter().match_catalog("가운데로 가줘", 150);
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 90 });
        assert!(meaningful);
    }

    #[test]
    fn test_catalog_relative_steps_clamp() {
        let robot = adapter();
        let (right, _) = robot.match_catalog("오른쪽으로 돌아", 170);
        assert_eq!(right, RobotDecision::ServoSet { servo: 0, angle: 180 });
        let (left, _) = robot.match_catalog("왼쪽으로", 10);
        assert_eq!(left, RobotDecision::ServoSet { servo: 0, angle: 0 });
    }

    #[test]
    fn test_catalog_captured_angle() {
        let (decision, meaningful) = adapter().match_catalog("45도로 맞춰", 90);
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 45 });
        assert!(meaningful);
    }

    #[test]
    fn test_catalog_captured_angle_is_clamped() {
        let (decision, _) = adapter().match_catalog("700도로 돌려", 90);
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 180 });
    }

    #[test]
    fn test_catalog_stop_and_switch() {
        let robot = adapter();
        let (stop, _) = robot.match_catalog("이제 그만", 90);
        assert_eq!(stop, RobotDecision::Stop { servo: 0 });

        let (switch, meaningful) = robot.match_catalog("로봇 모드로 바꿔", 90);
        assert_eq!(switch, RobotDecision::SwitchMode(Mode::Robot));
        assert!(meaningful);

        let (switch, _) = robot.match_catalog("대화 모드로 돌아가", 90);
        assert_eq!(switch, RobotDecision::SwitchMode(Mode::Agent));
    }

    #[test]
    fn test_catalog_unmatched_is_noop() {
        let (decision, meaningful) = adapter().match_catalog("무슨 말인지 모르겠어", 90);
        assert_eq!(decision, RobotDecision::Noop);
        assert!(!meaningful);
    }

    #[test]
    fn test_catalog_empty_text_is_noop() {
        let (decision, meaningful) = adapter().match_catalog("  ", 90);
        assert_eq!(decision, RobotDecision::Noop);
        assert!(!meaningful);
    }

    #[test]
    fn test_parse_llm_decision_servo_set() {
        let decision = parse_llm_decision(r#"{"action": "SERVO_SET", "servo": 0, "angle": 45}"#);
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 45 });
    }

    #[test]
    fn test_parse_llm_decision_clamps_angle() {
        let decision = parse_llm_decision(r#"{"action": "SERVO_SET", "angle": 999}"#);
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 180 });
        let decision = parse_llm_decision(r#"{"action": "SERVO_SET", "angle": -30}"#);
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 0 });
    }

    #[test]
    fn test_parse_llm_decision_extracts_embedded_object() {
        let decision =
            parse_llm_decision("알겠습니다: {\"action\": \"STOP\", \"servo\": 1} 입니다");
        assert_eq!(decision, RobotDecision::Stop { servo: 1 });
    }

    #[test]
    fn test_parse_llm_decision_garbage_is_noop() {
        assert_eq!(parse_llm_decision("모르겠어요"), RobotDecision::Noop);
        assert_eq!(parse_llm_decision("{broken json"), RobotDecision::Noop);
        assert_eq!(
            parse_llm_decision(r#"{"action": "DANCE"}"#),
            RobotDecision::Noop
        );
        assert_eq!(
            parse_llm_decision(r#"{"action": "SWITCH_MODE", "mode": "turbo"}"#),
            RobotDecision::Noop
        );
    }

    #[tokio::test]
    async fn test_decide_without_llm_uses_catalog() {
        let robot = adapter();
        let (refined, decision) = robot.decide("가운데로", 10).await;
        assert_eq!(refined, "가운데로");
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 90 });
    }

    #[tokio::test]
    async fn test_decide_with_dead_llm_falls_back_to_catalog() {
        let llm = Arc::new(LlmClient::new("http://127.0.0.1:1", "test", false));
        let robot = RobotAdapter::new(Arc::new(compile_catalog(default_catalog())), Some(llm));
        let (_, decision) = robot.decide("가운데로", 10).await;
        assert_eq!(decision, RobotDecision::ServoSet { servo: 0, angle: 90 });
    }
}
