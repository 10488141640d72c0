use crate::error::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Speaker in a chat history exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of conversation history passed to the answering agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

/// Black-box question-answering capability under evaluation.
///
/// The agent may perform retrieval and generation internally; the engine
/// only sees the question/answer contract.
#[async_trait]
pub trait AnsweringAgent: Send + Sync {
    async fn answer(&self, question: &str, history: &[ChatMessage]) -> Result<String, AgentError>;
}

/// HTTP adapter for agents exposed as a chat endpoint.
///
/// POSTs `{"question": .., "history": [..]}` and expects `{"answer": ..}`.
pub struct HttpAgent {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct AgentRequest<'a> {
    question: &'a str,
    history: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct AgentResponse {
    answer: String,
}

impl HttpAgent {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl AnsweringAgent for HttpAgent {
    async fn answer(&self, question: &str, history: &[ChatMessage]) -> Result<String, AgentError> {
        let body = AgentRequest { question, history };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentError(format!(
                "agent returned status {}",
                response.status()
            )));
        }
        let parsed: AgentResponse = response
            .json()
            .await
            .map_err(|e| AgentError(format!("invalid agent response: {}", e)))?;
        Ok(parsed.answer)
    }
}
