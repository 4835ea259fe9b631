use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::{SERVO_MAX, SERVO_MIN};

/// Punctuation the STT engine tends to hallucinate on noisy input.
const STT_PUNCT: &[char] = &[',', '，', '。', '.', '!', '?'];
/// Set used for the garbage-ratio check (includes ellipsis).
const RATIO_PUNCT: &[char] = &[',', '，', '。', '.', '!', '?', '…'];

static COMMA_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,，]{3,}").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_COMMAS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,，\s]+$").unwrap());

/// Clamp a servo angle into the legal range.
pub fn clamp_angle(angle: i32) -> i32 {
    angle.clamp(SERVO_MIN, SERVO_MAX)
}

/// Sanitize raw STT output before it reaches a mode handler.
///
/// Collapses comma runs and doubled punctuation, normalizes whitespace,
/// empties out transcripts that are mostly punctuation (length ≥ 8 with
/// more than 35% punctuation characters), and strips trailing commas.
/// Idempotent: `clean_text(clean_text(x)) == clean_text(x)`.
pub fn clean_text(text: &str) -> String {
    let t = COMMA_RUN.replace_all(text.trim(), ",");
    let t = collapse_repeated_punct(&t);
    let t = WHITESPACE.replace_all(&t, " ").trim().to_string();

    if t.chars().count() >= 8 {
        let total = t.chars().count();
        let punct = t.chars().filter(|c| RATIO_PUNCT.contains(c)).count();
        if punct as f32 / total.max(1) as f32 > 0.35 {
            return String::new();
        }
    }

    TRAILING_COMMAS.replace(&t, "").trim().to_string()
}

/// Collapse immediately repeated punctuation ("안녕!!" → "안녕!").
fn collapse_repeated_punct(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if STT_PUNCT.contains(&c) && prev == Some(c) {
            continue;
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Collapse whitespace runs and trim.
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").trim().to_string()
}

/// Build the leading self-introduction matcher for the configured
/// assistant name, e.g. "안녕하세요! 저는 콜리입니다!".
pub fn self_intro_regex(assistant_name: &str) -> Regex {
    let pattern = format!(
        r"^(안녕하세요)?[!.~\s]*(저는|제\s*이름은)\s*{}\s*(입니다|이에요|예요)?[!.~\s]*",
        regex::escape(assistant_name)
    );
    Regex::new(&pattern).expect("self-intro pattern is static apart from the escaped name")
}

/// Remove emoji, pictographs, and zero-width joiners so the TTS engine
/// never tries to read them out.
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|&c| !is_emoji_component(c)).collect()
}

fn is_emoji_component(c: char) -> bool {
    matches!(u32::from(c),
        0x1f000..=0x1f02f   // mahjong / domino tiles
        | 0x1f300..=0x1f5ff // symbols & pictographs
        | 0x1f600..=0x1f64f // emoticons
        | 0x1f680..=0x1f6ff // transport
        | 0x1f900..=0x1f9ff // supplemental symbols
        | 0x1fa70..=0x1faff // extended pictographs
        | 0x2600..=0x27bf   // misc symbols / dingbats
        | 0x2b00..=0x2bff   // arrows & stars used as emoji
        | 0xfe00..=0xfe0f   // variation selectors
        | 0x200d            // zero-width joiner
        | 0x20e3            // combining keycap
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_collapses_comma_runs() {
        assert_eq!(clean_text("하나,,,,둘"), "하나,둘");
        assert_eq!(clean_text("하나,，,둘"), "하나,둘");
    }

    #[test]
    fn test_clean_collapses_doubled_punctuation() {
        assert_eq!(clean_text("좋아!!"), "좋아!");
        assert_eq!(clean_text("정말?? 그래.."), "정말? 그래.");
    }

    #[test]
    fn test_clean_collapses_whitespace() {
        assert_eq!(clean_text("  안녕   하세요  "), "안녕 하세요");
    }

    #[test]
    fn test_clean_filters_punctuation_garbage() {
        // ≥ 8 chars and > 35% punctuation → empty
        assert_eq!(clean_text("., ., ., ., ., "), "");
        assert_eq!(clean_text("…!…!…!…!"), "");
        // Short strings are exempt from the ratio check
        assert_eq!(clean_text("네!"), "네!");
    }

    #[test]
    fn test_clean_strips_trailing_commas() {
        assert_eq!(clean_text("가운데로,,"), "가운데로");
        assert_eq!(clean_text("가운데로, "), "가운데로");
    }

    #[test]
    fn test_clean_is_idempotent() {
        for raw in [
            "하나,,,,둘!!  셋??",
            "., ., ., ., ., ",
            "  안녕   하세요,, ",
            "가운데로",
            "",
        ] {
            let once = clean_text(raw);
            assert_eq!(clean_text(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_clamp_angle() {
        assert_eq!(clamp_angle(-20), 0);
        assert_eq!(clamp_angle(90), 90);
        assert_eq!(clamp_angle(400), 180);
    }

    #[test]
    fn test_self_intro_removed() {
        let re = self_intro_regex("콜리");
        let cleaned = collapse_whitespace(&re.replace("안녕하세요! 저는 콜리입니다! 반가워요", ""));
        assert_eq!(cleaned, "반가워요");

        let cleaned = collapse_whitespace(&re.replace("제 이름은 콜리예요. 뭐든 물어보세요", ""));
        assert_eq!(cleaned, "뭐든 물어보세요");
    }

    #[test]
    fn test_self_intro_keeps_plain_reply() {
        let re = self_intro_regex("콜리");
        let text = "오늘 날씨가 좋아요";
        assert_eq!(re.replace(text, "").to_string(), text);
    }

    #[test]
    fn test_strip_emoji() {
        assert_eq!(strip_emoji("반가워요 😊"), "반가워요 ");
        assert_eq!(strip_emoji("좋아요 👍🏻!"), "좋아요 !");
        assert_eq!(strip_emoji("날씨 ☀️ 맑음"), "날씨  맑음");
        assert_eq!(strip_emoji("평범한 문장"), "평범한 문장");
    }
}
