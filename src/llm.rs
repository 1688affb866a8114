//! Chat-completion client.
//!
//! [`ChatModel`] is the seam the conversational chain talks to.
//! [`OpenAiChat`] speaks the OpenAI `/chat/completions` protocol, which
//! Ollama also serves under `/v1`:
//!
//! | `llm.provider` | default `base_url` | API key |
//! |----------------|--------------------|---------|
//! | `openai` | `https://api.openai.com/v1` | `OPENAI_API_KEY` (required) |
//! | `ollama` | `http://localhost:11434/v1` | none |

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::http_retry::send_with_retry;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// One completion for `messages`; returns the assistant's text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

pub struct OpenAiChat {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenAiChat {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let (default_base, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                (OPENAI_BASE_URL, Some(key))
            }
            "ollama" => (OLLAMA_BASE_URL, std::env::var("OPENAI_API_KEY").ok()),
            other => bail!("Unknown LLM provider: {}. Use openai or ollama.", other),
        };
        let base = config.base_url.as_deref().unwrap_or(default_base);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let response = send_with_retry("chat completion", self.max_retries, || {
            let mut request = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            async move { Ok(request.send().await?) }
        })
        .await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("invalid chat completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("chat completion returned no content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = LlmConfig {
            provider: "bard".into(),
            ..LlmConfig::default()
        };
        assert!(OpenAiChat::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn completes_against_compatible_endpoint() {
        let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::default();
        let captured = seen.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(body);
                    Json(serde_json::json!({
                        "choices": [{"message": {"role": "assistant", "content": "Twenty days."}}]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = LlmConfig {
            provider: "ollama".into(),
            model: "llama3".into(),
            base_url: Some(format!("http://{}/v1/", addr)),
            temperature: 0.2,
            ..LlmConfig::default()
        };
        let model = OpenAiChat::from_config(&config).unwrap();
        let answer = model
            .complete(&[ChatMessage::system("be brief"), ChatMessage::user("how much leave?")])
            .await
            .unwrap();
        assert_eq!(answer, "Twenty days.");

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["messages"][1]["role"], "user");
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }
}
