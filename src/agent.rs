/// Agent mode: recognized text → conversational reply + intent.
///
/// The adapter is per-session (it owns the running conversation); the
/// brain behind it is shared process-wide.
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::brain::{AgentBrain, InfoServices};
use crate::command::ActionCommand;
use crate::llm::{ChatMessage, LlmClient};
use crate::text::{collapse_whitespace, self_intro_regex, strip_emoji};

/// Conversation turns kept in the rolling prompt window.
pub const MAX_HISTORY: usize = 20;

/// Canned reply when the LLM path fails outright.
pub const FALLBACK_APOLOGY: &str = "죄송해요, 오류가 발생했어요.";
/// Canned reply when sanitation leaves nothing to say.
pub const FALLBACK_CLARIFY: &str = "죄송해요, 잘 못 알아들었어요. 다시 한 번 말씀해 주시겠어요?";

// ═══════════════════════════════════════════════════════════════════════
//  Intent
// ═══════════════════════════════════════════════════════════════════════

/// Closed intent set extracted from `[INTENT:x]` reply tags.  Unknown
/// tags map to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    None,
    Sleep,
    ModeRobot,
    ModeAgent,
}

static INTENT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[INTENT:(\w+)\]").unwrap());

/// Extract and strip the intent tag from an LLM reply.
pub fn parse_intent(text: &str) -> (Intent, String) {
    let m = match INTENT_TAG.captures(text) {
        Some(caps) => caps,
        None => return (Intent::None, text.trim().to_string()),
    };
    let intent = match m.get(1).map(|g| g.as_str().to_ascii_lowercase()).as_deref() {
        Some("sleep") => Intent::Sleep,
        Some("mode_robot") => Intent::ModeRobot,
        Some("mode_agent") => Intent::ModeAgent,
        _ => Intent::None,
    };
    let whole = m.get(0).unwrap();
    let mut stripped = String::with_capacity(text.len());
    stripped.push_str(&text[..whole.start()]);
    stripped.push_str(&text[whole.end()..]);
    (intent, stripped.trim().to_string())
}

// ═══════════════════════════════════════════════════════════════════════
//  Adapter
// ═══════════════════════════════════════════════════════════════════════

/// One agent-mode turn's outcome.
#[derive(Debug)]
pub struct AgentReply {
    pub text: String,
    pub intent: Intent,
    /// Emotion directive to pass through to the device, when the
    /// detected emotion changed on this turn.
    pub emotion_update: Option<ActionCommand>,
}

pub struct AgentAdapter {
    llm: Arc<LlmClient>,
    brain: Arc<Mutex<AgentBrain>>,
    info: Arc<InfoServices>,
    history: Vec<ChatMessage>,
    intro_re: Regex,
}

impl AgentAdapter {
    pub fn new(
        llm: Arc<LlmClient>,
        brain: Arc<Mutex<AgentBrain>>,
        info: Arc<InfoServices>,
    ) -> Self {
        let (intro_re, history) = {
            let mut b = brain.lock().unwrap_or_else(|e| e.into_inner());
            (self_intro_regex(b.assistant_name()), b.take_restored_history())
        };
        let mut adapter = AgentAdapter {
            llm,
            brain,
            info,
            history,
            intro_re,
        };
        adapter.trim_history();
        adapter
    }

    /// Run one conversational turn.
    pub async fn reply(&mut self, text: &str) -> AgentReply {
        let (mut system, emotion_update) = {
            let mut brain = self.brain.lock().unwrap_or_else(|e| e.into_inner());
            (brain.system_prompt(), brain.observe_user(text))
        };

        if let Some(reference) = self.info.reference_data(text).await {
            system.push_str("\n\n[참고 자료]\n");
            system.push_str(&reference);
            system.push_str("\n위 참고 자료를 바탕으로 답하세요.");
        }

        self.history.push(ChatMessage::user(text));
        self.trim_history();

        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(self.history.iter().cloned());

        let (reply_text, intent) = match self.llm.chat(&messages, 0.8, 256, None).await {
            Ok(raw) => {
                let (intent, body) = parse_intent(&raw);
                let clean = self.sanitize(&body);
                if clean.is_empty() {
                    (FALLBACK_CLARIFY.to_string(), intent)
                } else {
                    (clean, intent)
                }
            }
            Err(e) => {
                warn!(error = %e, "agent reply failed");
                (FALLBACK_APOLOGY.to_string(), Intent::None)
            }
        };

        self.history.push(ChatMessage::assistant(reply_text.clone()));
        {
            let mut brain = self.brain.lock().unwrap_or_else(|e| e.into_inner());
            brain.observe_exchange(text, &reply_text, &self.history);
        }

        AgentReply {
            text: reply_text,
            intent,
            emotion_update,
        }
    }

    /// Strip self-introductions and emoji, collapse whitespace.
    fn sanitize(&self, text: &str) -> String {
        let without_intro = self.intro_re.replace(text, "");
        collapse_whitespace(&strip_emoji(&without_intro))
    }

    fn trim_history(&mut self) {
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::Personality;

    fn adapter() -> (AgentAdapter, tempfile::TempDir) {
        let snapshots = tempfile::tempdir().unwrap();
        let llm = Arc::new(LlmClient::new("http://127.0.0.1:1", "test", false));
        let brain = Arc::new(Mutex::new(AgentBrain::new(
            "콜리",
            Personality::Cheerful,
            snapshots.path().to_str().unwrap(),
        )));
        let info = Arc::new(InfoServices::new("", "Seoul"));
        (AgentAdapter::new(llm, brain, info), snapshots)
    }

    #[test]
    fn test_parse_intent_valid_tags() {
        let (intent, body) = parse_intent("로봇 모드로 바꿀게요! [INTENT:mode_robot]");
        assert_eq!(intent, Intent::ModeRobot);
        assert_eq!(body, "로봇 모드로 바꿀게요!");

        let (intent, _) = parse_intent("[INTENT:sleep] 조용히 쉴게요");
        assert_eq!(intent, Intent::Sleep);

        let (intent, _) = parse_intent("대화 모드예요 [INTENT:mode_agent]");
        assert_eq!(intent, Intent::ModeAgent);
    }

    #[test]
    fn test_parse_intent_unknown_tag_maps_to_none() {
        let (intent, body) = parse_intent("네 [INTENT:dance]");
        assert_eq!(intent, Intent::None);
        assert_eq!(body, "네");
    }

    #[test]
    fn test_parse_intent_absent() {
        let (intent, body) = parse_intent("그냥 평범한 대답이에요");
        assert_eq!(intent, Intent::None);
        assert_eq!(body, "그냥 평범한 대답이에요");
    }

    #[test]
    fn test_sanitize_removes_intro_and_emoji() {
        let (agent, _dir) = adapter();
        assert_eq!(
            agent.sanitize("안녕하세요! 저는 콜리입니다! 반가워요 😊"),
            "반가워요"
        );
    }

    #[test]
    fn test_sanitize_keeps_normal_reply() {
        let (agent, _dir) = adapter();
        assert_eq!(
            agent.sanitize("오늘은 맑고 따뜻해요."),
            "오늘은 맑고 따뜻해요."
        );
    }

    #[tokio::test]
    async fn test_reply_with_dead_llm_is_canned_apology() {
        let (mut agent, _dir) = adapter();
        let reply = agent.reply("안녕").await;
        assert_eq!(reply.text, FALLBACK_APOLOGY);
        assert_eq!(reply.intent, Intent::None);
    }

    #[tokio::test]
    async fn test_history_stays_bounded() {
        let (mut agent, _dir) = adapter();
        for i in 0..30 {
            let _ = agent.reply(&format!("말 {i}")).await;
        }
        assert!(agent.history.len() <= MAX_HISTORY + 1);
    }
}
