/// Ollama-style HTTP chat client, shared by both modes.
///
/// Primary path is the streaming `/api/chat` endpoint (JSON lines,
/// content and thinking deltas merged client-side).  Truncated or
/// thinking-swallowed replies are retried once with a larger budget and
/// thinking disabled; as a last resort the non-chat `/api/generate`
/// endpoint is used.
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Message roles accepted by the chat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm returned no content")]
    Empty,
    #[error("llm server not reachable at {0}")]
    Unavailable(String),
}

// ═══════════════════════════════════════════════════════════════════════
//  Stream accumulation
// ═══════════════════════════════════════════════════════════════════════

/// One JSON line of a streaming chat response.
#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<StreamDelta>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

/// Merges streamed chat deltas into the final content / thinking /
/// done-reason triple.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    thinking: String,
    done_reason: String,
}

impl StreamAccumulator {
    fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let parsed: StreamLine = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream line");
                return;
            }
        };
        if let Some(delta) = parsed.message {
            if let Some(content) = delta.content {
                self.content.push_str(&content);
            }
            if let Some(thinking) = delta.thinking {
                self.thinking.push_str(&thinking);
            }
        }
        if parsed.done {
            if let Some(reason) = parsed.done_reason {
                self.done_reason = reason;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Client
// ═══════════════════════════════════════════════════════════════════════

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    chat_url: String,
    generate_url: String,
    model: String,
    default_think: bool,
}

impl LlmClient {
    pub fn new(base_url: &str, model: &str, default_think: bool) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        LlmClient {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            chat_url: format!("{base}/api/chat"),
            generate_url: format!("{base}/api/generate"),
            base_url: base,
            model: model.to_string(),
            default_think,
        }
    }

    /// Chat with the retry ladder:
    /// 1. stream `/api/chat`;
    /// 2. `done_reason == "length"` → one retry at 2× budget, no thinking;
    /// 3. empty content with a thinking trace → one retry at 1.5× budget,
    ///    no thinking;
    /// 4. still empty → `/api/generate` fallback.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        think: Option<bool>,
    ) -> Result<String, LlmError> {
        let effective_think = think.unwrap_or(self.default_think);
        let (mut content, done_reason, thinking) = self
            .chat_once(messages, temperature, max_tokens, effective_think)
            .await?;

        if done_reason == "length" && !content.trim().is_empty() {
            debug!(max_tokens, "chat reply truncated - retrying with larger budget");
            match self
                .chat_once(messages, temperature, max_tokens * 2, false)
                .await
            {
                Ok((retry, _, _)) if !retry.trim().is_empty() => content = retry,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "truncation retry failed"),
            }
        }

        if content.trim().is_empty() && !thinking.trim().is_empty() {
            debug!("chat reply was all thinking - retrying with think disabled");
            match self
                .chat_once(messages, temperature, max_tokens * 3 / 2, false)
                .await
            {
                Ok((retry, _, _)) => content = retry,
                Err(e) => warn!(error = %e, "thinking retry failed"),
            }
        }

        if content.trim().is_empty() {
            warn!("chat stream returned empty content - trying generate fallback");
            match self.generate(messages, temperature, max_tokens).await {
                Ok(fallback) if !fallback.trim().is_empty() => {
                    info!(len = fallback.trim().len(), "generate fallback succeeded");
                    content = fallback;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "generate fallback failed"),
            }
        }

        let trimmed = content.trim().to_string();
        if trimmed.is_empty() {
            Err(LlmError::Empty)
        } else {
            Ok(trimmed)
        }
    }

    /// One streaming chat call; returns `(content, done_reason, thinking)`.
    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        think: bool,
    ) -> Result<(String, String, String), LlmError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "think": think,
            "options": { "temperature": temperature, "num_predict": max_tokens },
        });

        let response = self
            .http
            .post(&self.chat_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let mut acc = StreamAccumulator::default();
        let mut pending = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                acc.push_line(&line);
            }
        }
        acc.push_line(&pending);

        Ok((acc.content, acc.done_reason, acc.thinking))
    }

    /// Non-chat fallback: flatten the conversation into a single prompt.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "prompt": messages_to_prompt(messages),
            "stream": false,
            "options": { "temperature": temperature, "num_predict": max_tokens },
        });

        #[derive(Deserialize)]
        struct GenerateResponse {
            #[serde(default)]
            response: String,
        }

        let parsed: GenerateResponse = self
            .http
            .post(&self.generate_url)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parsed.response)
    }

    /// Probe the server; optionally start it and wait until it answers.
    pub async fn ensure_available(
        &self,
        auto_start: bool,
        start_command: &str,
        startup_timeout: Duration,
    ) -> Result<(), LlmError> {
        if self.probe().await {
            return Ok(());
        }
        if !auto_start {
            return Err(LlmError::Unavailable(self.base_url.clone()));
        }

        info!(command = start_command, "LLM server not answering - starting it");
        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(start_command)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn LLM server");
            return Err(LlmError::Unavailable(self.base_url.clone()));
        }

        let deadline = tokio::time::Instant::now() + startup_timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.probe().await {
                info!("LLM server is up");
                return Ok(());
            }
        }
        Err(LlmError::Unavailable(self.base_url.clone()))
    }

    async fn probe(&self) -> bool {
        matches!(
            self.http
                .get(&self.base_url)
                .timeout(Duration::from_secs(2))
                .send()
                .await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

/// Simple chat-to-prompt converter for `/api/generate`.
fn messages_to_prompt(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::with_capacity(messages.len() + 1);
    for msg in messages {
        let prefix = match msg.role {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        };
        lines.push(format!("{prefix}: {}", msg.content));
    }
    lines.push("ASSISTANT:".to_string());
    lines.join("\n")
}
