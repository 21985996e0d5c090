use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::ports::CompletionPort;

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Completion port over Ollama's /api/chat endpoint. One user message
/// in, one assistant message out. Transport and status failures map to
/// the transient kind; an undecodable response body is the malformed
/// kind.
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn with_config(base_url: String, model: String) -> Self {
        OllamaClient {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn get_model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, prompt: &str) -> AgentResult<String> {
        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::transient(format!("ollama request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::transient(format!(
                "ollama API error: {}",
                response.status()
            )));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::CompletionMalformed(format!("ollama response unreadable: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl CompletionPort for OllamaClient {
    async fn complete(&self, prompt: &str) -> AgentResult<String> {
        self.chat(prompt).await
    }
}
