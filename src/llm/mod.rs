//! LLM integration.
//!
//! Runners talk to an [`LlmProvider`]; the only network implementation is the
//! Anthropic Messages API over `reqwest`.

mod anthropic;
pub mod provider;
pub mod retry;

pub use anthropic::AnthropicProvider;
pub use provider::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, LlmProvider, ModelTier, Role,
    TokenUsage, ToolCall, ToolChoice, ToolDefinition,
};
pub use retry::{RetryPolicy, chat_with_retry};

use std::sync::Arc;

use crate::config::LlmConfig;

/// Create the configured LLM provider.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    tracing::info!(
        model = config.model(ModelTier::Standard),
        base_url = %config.base_url,
        "Using Anthropic"
    );
    Arc::new(AnthropicProvider::new(config.clone()))
}
