/// Assistant brain: persona, emotion state, important memories, context
/// snapshots, and the info services that feed reference data into the
/// prompt.  Shared process-wide behind a mutex; the per-session agent
/// adapter owns the conversation itself.
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::{ActionCommand, LedColor, LedCommand};
use crate::llm::ChatMessage;

// ═══════════════════════════════════════════════════════════════════════
//  Persona
// ═══════════════════════════════════════════════════════════════════════

/// Assistant personality, folded into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Personality {
    Cheerful,
    Calm,
    Playful,
    Serious,
}

impl Personality {
    /// Parse a config string; unknown values fall back to cheerful.
    pub fn parse(value: &str) -> Self {
        match value {
            "calm" => Personality::Calm,
            "playful" => Personality::Playful,
            "serious" => Personality::Serious,
            _ => Personality::Cheerful,
        }
    }

    fn trait_description(self) -> &'static str {
        match self {
            Personality::Cheerful => "밝고 활발하며 긍정적입니다. 대화에서 즐거움과 에너지를 전달합니다.",
            Personality::Calm => "차분하고 안정적이며 신중합니다. 편안하고 믿을 수 있는 분위기를 만듭니다.",
            Personality::Playful => "장난기 있고 유쾌하며 창의적입니다. 재미있는 표현을 자주 사용합니다.",
            Personality::Serious => "진지하고 전문적이며 효율적입니다. 정확한 정보와 실용적인 조언을 제공합니다.",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Emotion engine
// ═══════════════════════════════════════════════════════════════════════

/// Closed emotion set; anything unrecognized maps to neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Excited,
    Sleepy,
    Angry,
    Neutral,
}

/// Servo gesture paired with each emotion on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServoGesture {
    Nod,
    ShakeSlow,
    WiggleFast,
    Drift,
    ShakeSharp,
    Center,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Excited,
        Emotion::Sleepy,
        Emotion::Angry,
        Emotion::Neutral,
    ];

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Emotion::Happy => &["행복", "기쁘", "좋아", "웃", "즐거", "신나", "재밌", "최고", "좋다"],
            Emotion::Sad => &["슬프", "우울", "힘들", "아프", "외로", "쓸쓸", "안타깝", "아쉽"],
            Emotion::Excited => &["대박", "짱", "신난다", "흥분", "놀라", "멋지", "환상", "완전"],
            Emotion::Sleepy => &["피곤", "졸려", "자고", "쉬고", "휴식", "지쳐"],
            Emotion::Angry => &["화나", "짜증", "싫", "귀찮", "답답", "속상", "열받"],
            Emotion::Neutral => &[],
        }
    }

    fn led_color(self) -> LedColor {
        match self {
            Emotion::Happy => LedColor { r: 255, g: 200, b: 0 },
            Emotion::Sad => LedColor { r: 0, g: 100, b: 255 },
            Emotion::Excited => LedColor { r: 255, g: 50, b: 200 },
            Emotion::Sleepy => LedColor { r: 100, g: 100, b: 150 },
            Emotion::Angry => LedColor { r: 255, g: 0, b: 0 },
            Emotion::Neutral => LedColor { r: 100, g: 255, b: 100 },
        }
    }

    fn led_pattern(self) -> (&'static str, &'static str) {
        match self {
            Emotion::Happy => ("pulse", "medium"),
            Emotion::Sad => ("slow_fade", "slow"),
            Emotion::Excited => ("rainbow", "fast"),
            Emotion::Sleepy => ("breathing", "slow"),
            Emotion::Angry => ("blink", "fast"),
            Emotion::Neutral => ("solid", "none"),
        }
    }

    fn gesture(self) -> ServoGesture {
        match self {
            Emotion::Happy => ServoGesture::Nod,
            Emotion::Sad => ServoGesture::ShakeSlow,
            Emotion::Excited => ServoGesture::WiggleFast,
            Emotion::Sleepy => ServoGesture::Drift,
            Emotion::Angry => ServoGesture::ShakeSharp,
            Emotion::Neutral => ServoGesture::Center,
        }
    }
}

/// Keyword-scoring emotion tracker.
#[derive(Debug)]
pub struct EmotionEngine {
    current: Emotion,
}

impl EmotionEngine {
    pub fn new() -> Self {
        EmotionEngine {
            current: Emotion::Neutral,
        }
    }

    pub fn current(&self) -> Emotion {
        self.current
    }

    /// Score the text against each emotion's keywords; the current
    /// emotion is kept when nothing matches.
    pub fn analyze(&mut self, text: &str) -> Emotion {
        if text.is_empty() {
            return self.current;
        }
        let mut best = None;
        let mut best_score = 0usize;
        for emotion in Emotion::ALL {
            let score = emotion
                .keywords()
                .iter()
                .filter(|kw| text.contains(*kw))
                .count();
            if score > best_score {
                best_score = score;
                best = Some(emotion);
            }
        }
        if let Some(detected) = best {
            self.current = detected;
        }
        self.current
    }

    /// Device-facing emotion directive for the current state.
    pub fn command(&self) -> ActionCommand {
        let (pattern, speed) = self.current.led_pattern();
        ActionCommand::Emotion {
            emotion: self.current,
            led: LedCommand {
                pattern: pattern.to_string(),
                speed: speed.to_string(),
                color: self.current.led_color(),
            },
            servo_action: self.current.gesture(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Brain
// ═══════════════════════════════════════════════════════════════════════

const MAX_MEMORIES: usize = 50;
const MEMORIES_IN_PROMPT: usize = 10;
const SNAPSHOT_EVERY: u64 = 10;

/// Keywords that flag a user utterance as worth remembering.
const MEMORY_KEYWORDS: &[&str] = &[
    "이름", "생일", "좋아", "싫어", "알레르기", "약속", "일정", "가족", "친구", "전화번호",
    "주소", "기억", "잊지마",
];

#[derive(Debug, Serialize, Deserialize)]
struct ContextSnapshot {
    timestamp: String,
    conversation_count: u64,
    conversation_history: Vec<ChatMessage>,
    important_memories: Vec<String>,
}

pub struct AgentBrain {
    assistant_name: String,
    personality: Personality,
    emotion: EmotionEngine,
    important_memories: Vec<String>,
    conversation_count: u64,
    snapshot_dir: PathBuf,
    restored_history: Vec<ChatMessage>,
}

impl AgentBrain {
    pub fn new(assistant_name: &str, personality: Personality, snapshot_dir: &str) -> Self {
        let mut brain = AgentBrain {
            assistant_name: assistant_name.to_string(),
            personality,
            emotion: EmotionEngine::new(),
            important_memories: Vec::new(),
            conversation_count: 0,
            snapshot_dir: PathBuf::from(snapshot_dir),
            restored_history: Vec::new(),
        };
        brain.restore_context();
        brain
    }

    pub fn assistant_name(&self) -> &str {
        &self.assistant_name
    }

    /// Conversation history restored from the latest snapshot, handed to
    /// the first session's agent adapter.
    pub fn take_restored_history(&mut self) -> Vec<ChatMessage> {
        std::mem::take(&mut self.restored_history)
    }

    /// Home-assistant system prompt: persona, behavioural rules, intent
    /// tag instructions, and the memory tail.
    pub fn system_prompt(&self) -> String {
        let mut memories_text = String::new();
        if !self.important_memories.is_empty() {
            memories_text.push_str("\n\n중요한 기억:\n");
            for mem in self
                .important_memories
                .iter()
                .rev()
                .take(MEMORIES_IN_PROMPT)
                .rev()
            {
                memories_text.push_str(&format!("- {mem}\n"));
            }
        }

        format!(
            "당신은 가정용 AI 홈 어시스턴트입니다. 이름은 '{name}'입니다.\n\n\
             성격: {persona}\n\n\
             핵심 역할:\n\
             1. 가족 구성원들과 자연스럽고 친근한 대화\n\
             2. 일상적인 질문에 대한 도움 제공\n\
             3. 가족의 일정, 선호사항, 중요한 정보 기억\n\
             4. 따뜻하고 공감적인 응답\n\n\
             응답 스타일:\n\
             - 한국어로 자연스럽게 대화\n\
             - 2-3문장 이내로 간결하게 답변\n\
             - 불확실한 정보는 솔직히 모른다고 말하기\n\n\
             특수 태그 (응답 끝에만 붙이세요):\n\
             - 사용자가 로봇(서보) 제어 모드를 원하면 [INTENT:mode_robot]\n\
             - 사용자가 대화 모드로 돌아오길 원하면 [INTENT:mode_agent]\n\
             - 사용자가 조용히 쉬고 싶어 하면 [INTENT:sleep]\
             {memories}",
            name = self.assistant_name,
            persona = self.personality.trait_description(),
            memories = memories_text,
        )
    }

    /// Track the user utterance: emotion scoring, returning a device
    /// directive when the detected emotion changed.
    pub fn observe_user(&mut self, text: &str) -> Option<ActionCommand> {
        let before = self.emotion.current();
        let after = self.emotion.analyze(text);
        if after != before {
            info!(emotion = ?after, "emotion changed");
            Some(self.emotion.command())
        } else {
            None
        }
    }

    /// Record a completed exchange: memory extraction plus periodic
    /// snapshotting of the caller's history tail.
    pub fn observe_exchange(&mut self, user_text: &str, reply: &str, history: &[ChatMessage]) {
        self.emotion.analyze(reply);
        self.extract_important_info(user_text, reply);
        self.conversation_count += 1;
        if self.conversation_count % SNAPSHOT_EVERY == 0 {
            self.snapshot_context(history);
        }
    }

    fn extract_important_info(&mut self, user_text: &str, reply: &str) {
        let combined = format!("{user_text} {reply}");
        if !MEMORY_KEYWORDS.iter().any(|kw| combined.contains(kw)) {
            return;
        }
        let stamp = Local::now().format("%Y-%m-%d");
        let excerpt: String = user_text.chars().take(50).collect();
        let entry = format!("[{stamp}] {excerpt}");
        if !self.important_memories.contains(&entry) {
            info!(memory = %entry, "important memory saved");
            self.important_memories.push(entry);
        }
        if self.important_memories.len() > MAX_MEMORIES {
            let excess = self.important_memories.len() - MAX_MEMORIES;
            self.important_memories.drain(..excess);
        }
    }

    /// Best-effort context snapshot; never fatal.
    pub fn snapshot_context(&self, history: &[ChatMessage]) {
        let snapshot = ContextSnapshot {
            timestamp: Local::now().to_rfc3339(),
            conversation_count: self.conversation_count,
            conversation_history: history.to_vec(),
            important_memories: self.important_memories.clone(),
        };

        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.snapshot_dir)?;
            let json = serde_json::to_vec_pretty(&snapshot).unwrap_or_default();
            std::fs::write(self.snapshot_dir.join("latest_context.json"), &json)?;
            Ok(())
        };
        match write() {
            Ok(()) => info!(count = self.conversation_count, "context snapshot written"),
            Err(e) => warn!(error = %e, "context snapshot failed"),
        }
    }

    fn restore_context(&mut self) {
        let path = self.snapshot_dir.join("latest_context.json");
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(_) => return,
        };
        match serde_json::from_slice::<ContextSnapshot>(&data) {
            Ok(snapshot) => {
                info!(
                    conversations = snapshot.conversation_count,
                    memories = snapshot.important_memories.len(),
                    "restored context snapshot"
                );
                self.important_memories = snapshot.important_memories;
                self.conversation_count = snapshot.conversation_count;
                self.restored_history = snapshot.conversation_history;
            }
            Err(e) => warn!(error = %e, "ignoring unreadable context snapshot"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Info services
// ═══════════════════════════════════════════════════════════════════════

const WEATHER_CACHE_TTL: Duration = Duration::from_secs(300);

const WEEKDAYS_KO: [&str; 7] = [
    "월요일", "화요일", "수요일", "목요일", "금요일", "토요일", "일요일",
];

/// Structured lookups appended to the prompt as reference data: current
/// time/date and cached weather.
pub struct InfoServices {
    http: reqwest::Client,
    api_key: String,
    location: String,
    weather_cache: tokio::sync::Mutex<Option<(Instant, String)>>,
}

impl InfoServices {
    pub fn new(api_key: &str, location: &str) -> Self {
        InfoServices {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            location: location.to_string(),
            weather_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Reference data for the utterance, if it asks for something the
    /// services can answer.
    pub async fn reference_data(&self, text: &str) -> Option<String> {
        if contains_any(text, &["몇 시", "몇시", "시간", "시각"]) {
            return Some(self.current_time());
        }
        if contains_any(text, &["날짜", "며칠", "요일"]) {
            return Some(self.current_date());
        }
        if contains_any(text, &["날씨", "기온", "온도", "우산"]) {
            return self.weather().await;
        }
        None
    }

    fn current_time(&self) -> String {
        let now = Local::now();
        let weekday = WEEKDAYS_KO[now.weekday().num_days_from_monday() as usize];
        format!(
            "현재 시각은 {} {}입니다.",
            now.format("%Y년 %m월 %d일 %H시 %M분"),
            weekday
        )
    }

    fn current_date(&self) -> String {
        let now = Local::now();
        let weekday = WEEKDAYS_KO[now.weekday().num_days_from_monday() as usize];
        format!("오늘은 {} {}입니다.", now.format("%Y년 %m월 %d일"), weekday)
    }

    async fn weather(&self) -> Option<String> {
        if self.api_key.is_empty() {
            return None;
        }

        {
            let cache = self.weather_cache.lock().await;
            if let Some((fetched_at, cached)) = cache.as_ref() {
                if fetched_at.elapsed() < WEATHER_CACHE_TTL {
                    return Some(cached.clone());
                }
            }
        }

        let result = self
            .http
            .get("https://api.openweathermap.org/data/2.5/weather")
            .query(&[
                ("q", self.location.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
                ("lang", "kr"),
            ])
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        let value: serde_json::Value = match result {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok()?,
            Ok(resp) => {
                warn!(status = %resp.status(), "weather lookup rejected");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "weather lookup failed");
                return None;
            }
        };

        let temp = value["main"]["temp"].as_f64()?;
        let feels_like = value["main"]["feels_like"].as_f64().unwrap_or(temp);
        let humidity = value["main"]["humidity"].as_u64().unwrap_or(0);
        let description = value["weather"][0]["description"].as_str().unwrap_or("알 수 없음");

        let report = format!(
            "{}의 현재 날씨는 {}입니다. 기온은 {:.1}도, 체감온도는 {:.1}도이며, 습도는 {}%입니다.",
            self.location, description, temp, feels_like, humidity
        );
        *self.weather_cache.lock().await = Some((Instant::now(), report.clone()));
        Some(report)
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_personality_parse_falls_back_to_cheerful() {
        assert_eq!(Personality::parse("calm"), Personality::Calm);
        assert_eq!(Personality::parse("grumpy"), Personality::Cheerful);
    }

    #[test]
    fn test_emotion_analysis_scores_keywords() {
        let mut engine = EmotionEngine::new();
        assert_eq!(engine.analyze("오늘 정말 신나고 즐거워"), Emotion::Happy);
        assert_eq!(engine.analyze("너무 피곤하고 졸려"), Emotion::Sleepy);
        // No keywords → previous emotion is kept
        assert_eq!(engine.analyze("음"), Emotion::Sleepy);
    }

    #[test]
    fn test_emotion_command_shape() {
        let mut engine = EmotionEngine::new();
        engine.analyze("짜증나고 속상해");
        let json: serde_json::Value =
            serde_json::from_slice(&engine.command().to_wire()).unwrap();
        assert_eq!(json["action"], "EMOTION");
        assert_eq!(json["emotion"], "angry");
        assert_eq!(json["led"]["color"]["r"], 255);
        assert_eq!(json["servo_action"], "SHAKE_SHARP");
    }

    #[test]
    fn test_observe_user_reports_changes_only() {
        let mut brain = AgentBrain::new("아이", Personality::Cheerful, "/nonexistent-snapshots");
        assert!(brain.observe_user("기분 최고야, 정말 좋아").is_some());
        assert!(brain.observe_user("여전히 즐거워 좋아").is_none());
    }

    #[test]
    fn test_memory_extraction_and_cap() {
        let mut brain = AgentBrain::new("아이", Personality::Cheerful, "/nonexistent-snapshots");
        brain.extract_important_info("내 생일은 3월 5일이야", "알겠어요");
        assert_eq!(brain.important_memories.len(), 1);
        // Duplicate entries are not stored twice
        brain.extract_important_info("내 생일은 3월 5일이야", "알겠어요");
        assert_eq!(brain.important_memories.len(), 1);
        // Non-keyword chatter is ignored
        brain.extract_important_info("오늘 뭐 먹지", "글쎄요");
        assert_eq!(brain.important_memories.len(), 1);
    }

    #[test]
    fn test_system_prompt_mentions_name_and_memories() {
        let mut brain = AgentBrain::new("콜리", Personality::Serious, "/nonexistent-snapshots");
        brain.extract_important_info("내 이름은 민수야", "반가워요");
        let prompt = brain.system_prompt();
        assert!(prompt.contains("콜리"));
        assert!(prompt.contains("진지하고"));
        assert!(prompt.contains("중요한 기억"));
        assert!(prompt.contains("민수"));
        assert!(prompt.contains("INTENT:mode_robot"));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();

        let mut brain = AgentBrain::new("아이", Personality::Cheerful, dir_str);
        brain.extract_important_info("내 생일 기억해줘", "네!");
        let history = vec![
            ChatMessage::user("내 생일 기억해줘"),
            ChatMessage::assistant("네!"),
        ];
        brain.snapshot_context(&history);

        let restored = AgentBrain::new("아이", Personality::Cheerful, dir_str);
        assert_eq!(restored.important_memories.len(), 1);
        assert_eq!(restored.restored_history.len(), 2);
    }

    #[tokio::test]
    async fn test_reference_data_time_and_date() {
        let info = InfoServices::new("", "Seoul");
        let time = info.reference_data("지금 몇 시야?").await.unwrap();
        assert!(time.contains("현재 시각"));
        let date = info.reference_data("오늘 무슨 요일이야?").await.unwrap();
        assert!(date.contains("오늘은"));
    }

    #[tokio::test]
    async fn test_weather_without_api_key_is_none() {
        let info = InfoServices::new("", "Seoul");
        assert!(info.reference_data("오늘 날씨 어때?").await.is_none());
    }

    #[tokio::test]
    async fn test_unrelated_text_has_no_reference_data() {
        let info = InfoServices::new("", "Seoul");
        assert!(info.reference_data("심심해").await.is_none());
    }
}
