use crate::error::{GenieError, Result, ServiceFailure};
use crate::llm::{CompletionModel, CompletionRequest};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant for a sports recruiting coach. \
Answer general questions concisely and clearly. If the coach wants to search their athletes, \
suggest phrasing the question with /sql.";

/// Direct model replies for chat-intent utterances. No SQL is involved.
pub struct ChatAssistant {
    model: Arc<dyn CompletionModel>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ChatAssistant {
    pub fn new(model: Arc<dyn CompletionModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            retry: RetryPolicy::translation(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn reply(&self, message: &str) -> Result<String> {
        let request = CompletionRequest::new(CHAT_SYSTEM_PROMPT, message.trim()).with_temperature(0.7);
        let request = &request;
        let timeout = self.timeout;
        let model = self.model.as_ref();
        self.retry
            .retry_with_backoff(
                move || async move {
                    tokio::time::timeout(timeout, model.complete(request))
                        .await
                        .unwrap_or_else(|_| {
                            Err(GenieError::service(
                                ServiceFailure::Timeout,
                                format!("no chat reply within {:?}", timeout),
                            ))
                        })
                },
                GenieError::is_retryable,
            )
            .await
    }
}
