//! Timeout-bounded inference with retry on transient failures.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{ChatRequest, ChatResponse, LlmProvider};

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry policy for one logical inference call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Timeout of each attempt.
    pub timeout: Duration,
    /// Attempts after the first one.
    pub retries: u32,
}

/// Exponential backoff with jitter; honours a provider-supplied delay.
fn backoff(attempt: u32, err: &LlmError) -> Duration {
    if let LlmError::RateLimited {
        retry_after: Some(delay),
        ..
    } = err
    {
        return (*delay).min(MAX_BACKOFF);
    }
    let exp = BASE_BACKOFF.saturating_mul(2u32.saturating_pow(attempt));
    let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    (exp + Duration::from_millis(jitter)).min(MAX_BACKOFF)
}

/// Call `provider.chat`, bounding every attempt by `policy.timeout` and
/// retrying transient errors up to `policy.retries` times.
pub async fn chat_with_retry(
    provider: &dyn LlmProvider,
    request: ChatRequest,
    policy: RetryPolicy,
) -> Result<ChatResponse, LlmError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, provider.chat(request.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                provider: provider.name().to_string(),
                timeout: policy.timeout,
            }),
        };

        match result {
            Ok(response) => return Ok(response),
            Err(err) if err.is_transient() && attempt < policy.retries => {
                let delay = backoff(attempt, &err);
                warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient LLM failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
