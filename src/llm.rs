use crate::error::LlmError;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Capability interface for text completion.
///
/// Both the testset generator and the judge consume this; concrete backends
/// are selected at construction time via explicit configuration, never
/// through global state.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// Retry policy for transient model failures (rate limits, timeouts).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

/// Call `complete` with exponential backoff on transient errors.
///
/// Non-transient errors (auth, malformed output) are returned immediately;
/// transient ones escalate after `max_attempts`.
pub async fn complete_with_retry(
    model: &dyn LanguageModel,
    policy: RetryPolicy,
    system: &str,
    user: &str,
) -> Result<String, LlmError> {
    let mut attempt = 0u32;
    loop {
        match model.complete(system, user).await {
            Ok(text) => return Ok(text),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = Duration::from_millis(policy.backoff_base_ms << attempt);
                warn!(attempt, %err, "transient model error, backing off");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// OpenAI-compatible chat completion backend.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_secs: u64,
}

impl OpenAiModel {
    pub fn new(
        api_endpoint: &str,
        api_key: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
        timeout_secs: u64,
    ) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_endpoint);
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature,
            max_tokens,
            timeout_secs,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content(system.to_string())
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?
            .into();
        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(user.to_string())
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?
            .into();
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([system_message, user_message])
            .temperature(self.temperature)
            .max_tokens(self.max_tokens as u16)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let response = timeout(
            Duration::from_secs(self.timeout_secs),
            self.client.chat().create(request),
        )
        .await
        .map_err(|_| LlmError::Timeout(self.timeout_secs))?
        .map_err(classify)?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::MalformedOutput(
                "empty completion content".to_string(),
            ));
        }
        Ok(content)
    }
}

/// Map provider errors onto the engine taxonomy so callers can decide
/// between retry, item failure, and aborting the run.
fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let label = format!(
                "{} {}",
                api.r#type.as_deref().unwrap_or(""),
                api.message
            )
            .to_lowercase();
            if label.contains("authentication")
                || label.contains("invalid_api_key")
                || label.contains("invalid api key")
                || label.contains("401")
            {
                LlmError::Auth(api.message)
            } else if label.contains("rate limit") || label.contains("rate_limit") {
                LlmError::RateLimit(api.message)
            } else {
                LlmError::Api(api.message)
            }
        }
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout(0),
        OpenAIError::Reqwest(e) if e.is_connect() => LlmError::Unreachable(e.to_string()),
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) if status.as_u16() == 401 => LlmError::Auth(e.to_string()),
            Some(status) if status.as_u16() == 429 => LlmError::RateLimit(e.to_string()),
            // No status and not a connect/timeout error: the transport
            // dropped mid-request. Treat as unreachable so a dead endpoint
            // aborts the run instead of burning every item's retries.
            None => LlmError::Unreachable(e.to_string()),
            _ => LlmError::Api(e.to_string()),
        },
        OpenAIError::JSONDeserialize(e) => LlmError::MalformedOutput(e.to_string()),
        other => LlmError::Api(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with a fixed error a number of times before succeeding.
    struct FlakyModel {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> LlmError,
    }

    #[async_trait]
    impl LanguageModel for FlakyModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let model = FlakyModel {
            calls: AtomicUsize::new(0),
            failures: 2,
            error: || LlmError::RateLimit("429".into()),
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1,
        };
        let out = complete_with_retry(&model, policy, "s", "u").await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_terminal() {
        let model = FlakyModel {
            calls: AtomicUsize::new(0),
            failures: 10,
            error: || LlmError::Timeout(1),
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1,
        };
        let result = complete_with_retry(&model, policy, "s", "u").await;
        assert!(matches!(result, Err(LlmError::Timeout(_))));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let model = FlakyModel {
            calls: AtomicUsize::new(0),
            failures: 10,
            error: || LlmError::Auth("bad key".into()),
        };
        let policy = RetryPolicy::default();
        let result = complete_with_retry(&model, policy, "s", "u").await;
        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
