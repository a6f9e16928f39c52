use async_trait::async_trait;
use atelier_core::{AtelierError, AtelierResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

/// Completion-service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible chat-completions endpoint.
    pub api_base_url: String,
    /// Model identifier sent with every request.
    pub model_id: String,
    /// Bearer token.
    pub api_key: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token cap per request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

/// The external completion service.
///
/// `complete` is the free-text "generate" operation; the structured
/// "think" operation is [`think`], built on top of it with tolerant
/// parsing.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Submit a system role and prompt, returning the raw completion.
    async fn complete(&self, system: &str, prompt: &str) -> AtelierResult<String>;
}

/// `reqwest`-backed client for OpenAI-style chat-completions APIs.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    config: ModelConfig,
}

impl HttpCompletionClient {
    /// Build a client from connection settings.
    pub fn new(config: ModelConfig) -> AtelierResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AtelierError::Http(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, system: &str, prompt: &str) -> AtelierResult<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.api_base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model_id,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AtelierError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AtelierError::Http(format!(
                "completion service returned {status}: {text}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AtelierError::Http(e.to_string()))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                AtelierError::Http("completion response missing message content".into())
            })
    }
}

/// Structured agent reasoning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThought {
    /// Free-text reasoning.
    #[serde(default)]
    pub thought: String,
    /// Requested action tag.
    #[serde(default)]
    pub action: String,
    /// Structured action input.
    #[serde(default)]
    pub action_input: Value,
    /// Whether the agent considers the task finished.
    #[serde(default)]
    pub finished: bool,
    /// Final result when finished.
    #[serde(default)]
    pub result: Option<Value>,
}

impl AgentThought {
    /// The finished-with-error shape used whenever the completion
    /// service response cannot be parsed or transported.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            thought: message.clone(),
            action: "error".into(),
            action_input: Value::Null,
            finished: true,
            result: Some(json!({"error": message})),
        }
    }

    /// Whether this thought is the degraded error shape.
    pub fn is_error(&self) -> bool {
        self.action == "error"
    }
}

/// Parse a completion into an [`AgentThought`], degrading gracefully.
///
/// Accepts raw JSON, fenced JSON, or JSON embedded in prose. Anything
/// unparseable becomes the finished-with-error shape rather than an
/// `Err` — transport and format problems must surface as failed tasks,
/// never as crashes.
pub fn parse_thought(raw: &str) -> AgentThought {
    let candidate = strip_fences(raw);
    if let Ok(thought) = serde_json::from_str::<AgentThought>(candidate) {
        return thought;
    }
    // Look for an embedded object.
    if let (Some(start), Some(end)) = (candidate.find('{'), candidate.rfind('}')) {
        if start < end {
            if let Ok(thought) = serde_json::from_str::<AgentThought>(&candidate[start..=end]) {
                return thought;
            }
        }
    }
    warn!(len = raw.len(), "Unparseable completion response; degrading");
    AgentThought::error("completion response was not valid structured JSON")
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag after the opening fence.
    let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Extract a JSON value from a completion, tolerating code fences and
/// surrounding prose. Returns `None` when no parseable object exists.
pub fn extract_json(raw: &str) -> Option<Value> {
    let candidate = strip_fences(raw);
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }
    let (start, end) = (candidate.find('{')?, candidate.rfind('}')?);
    if start >= end {
        return None;
    }
    serde_json::from_str(&candidate[start..=end]).ok()
}

/// The structured "think" operation: complete, then parse tolerantly.
/// A transport error is converted into the finished-with-error shape.
pub async fn think(client: &dyn CompletionClient, system: &str, prompt: &str) -> AgentThought {
    match client.complete(system, prompt).await {
        Ok(raw) => parse_thought(&raw),
        Err(e) => {
            warn!(error = %e, "Completion transport failure; degrading");
            AgentThought::error(format!("completion service unavailable: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let thought = parse_thought(r#"{"thought": "done", "finished": true, "result": {"ok": 1}}"#);
        assert!(thought.finished);
        assert!(!thought.is_error());
        assert_eq!(thought.result, Some(json!({"ok": 1})));
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "```json\n{\"thought\": \"x\", \"action\": \"search\"}\n```";
        let thought = parse_thought(raw);
        assert_eq!(thought.action, "search");
    }

    #[test]
    fn test_parse_embedded_json() {
        let raw = "Sure, here is the plan:\n{\"thought\": \"embedded\", \"finished\": false}\nHope that helps!";
        let thought = parse_thought(raw);
        assert_eq!(thought.thought, "embedded");
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(
            extract_json("{\"a\": 1}"),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```"),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            extract_json("Here you go: {\"a\": 1} enjoy"),
            Some(json!({"a": 1}))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_parse_garbage_degrades() {
        let thought = parse_thought("I cannot help with that.");
        assert!(thought.finished);
        assert!(thought.is_error());
        assert!(thought.result.is_some());
    }

    struct FailingClient;

    #[async_trait]
    impl CompletionClient for FailingClient {
        async fn complete(&self, _system: &str, _prompt: &str) -> AtelierResult<String> {
            Err(AtelierError::Http("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_think_degrades_on_transport_error() {
        let thought = think(&FailingClient, "system", "prompt").await;
        assert!(thought.finished);
        assert!(thought.is_error());
    }
}
