// src/llm/ollama.rs
// Chat model client for Ollama's /api/chat endpoint

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{ChatMessage, ChatModel};
use crate::config::LlmConfig;

/// Request timeout sized for local model inference
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Non-streaming chat client for an Ollama-compatible server
pub struct OllamaChat {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    fn build_body(&self, messages: &[ChatMessage]) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_body(messages);

        debug!(model = %self.model, messages = messages.len(), "sending chat request");

        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama API error {}: {}", status, text));
        }

        let raw: Value = response.json().await?;
        let text = raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("no message content in Ollama response"))?
            .to_string();

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> OllamaChat {
        OllamaChat::new(&LlmConfig {
            model: "mistral:7b".into(),
            base_url: "http://localhost:11434/".into(),
        })
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = test_client();
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn chat_body_shape() {
        let client = test_client();
        let body = client.build_body(&[
            ChatMessage::system("Be brief."),
            ChatMessage::user("hello"),
        ]);

        assert_eq!(body["model"], "mistral:7b");
        assert_eq!(body["stream"], false);
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello");
    }
}
