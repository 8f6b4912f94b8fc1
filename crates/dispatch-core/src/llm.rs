//! Text-completion collaborator used by [`crate::executor::LlmExecutor`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DispatchError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Anything that turns a prompt into text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for OpenAI and compatible endpoints.
pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, model: Option<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            temperature: 0.2,
        };

        let mut request = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::tool("openai", format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DispatchError::tool("openai", format!("HTTP {status}: {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Parse(format!("chat completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| DispatchError::Parse("chat completion had no content".to_string()))?;
        debug!(model = %self.model, chars = content.len(), "completion received");
        Ok(content)
    }
}

/// Parse a JSON object out of a model reply.
///
/// Accepts a ```json fenced block, a bare fence, or the outermost `{...}`
/// span of free text.
pub fn parse_json_response<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let candidate = extract_fenced(reply)
        .or_else(|| extract_object(reply))
        .ok_or_else(|| DispatchError::Parse("no JSON object in model reply".to_string()))?;
    serde_json::from_str(candidate)
        .map_err(|e| DispatchError::Parse(format!("model reply is not valid JSON: {e}")))
}

fn extract_fenced(reply: &str) -> Option<&str> {
    let start = reply.find("```")?;
    let after = &reply[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn extract_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_parse_fenced_json() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        let v: Value = parse_json_response(reply).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_parse_bare_object_in_prose() {
        let reply = "Result: {\"files\": [\"x.rs\"]} done";
        let v: Value = parse_json_response(reply).unwrap();
        assert_eq!(v["files"][0], "x.rs");
    }

    #[test]
    fn test_parse_rejects_missing_object() {
        let result: Result<Value> = parse_json_response("no json here");
        assert!(matches!(result, Err(DispatchError::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_broken_object() {
        let result: Result<Value> = parse_json_response("{ not: json }");
        assert!(matches!(result, Err(DispatchError::Parse(_))));
    }

    #[test]
    fn test_request_body_shape() {
        let body = ChatRequest {
            model: "gpt-test",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 256,
            temperature: 0.2,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-test");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let client = OpenAiClient::new(Some("http://localhost:8080/v1/".into()), None, None);
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(client.model(), DEFAULT_MODEL);
    }
}
