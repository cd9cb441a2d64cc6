//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, LlmProvider, ModelTier, Role,
    TokenUsage, ToolCall, ToolChoice,
};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Anthropic API provider.
pub struct AnthropicProvider {
    client: Client,
    config: LlmConfig,
}

impl AnthropicProvider {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Block types we don't consume (thinking, etc.).
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    choice_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

/// Split out the system prompt and fold the transcript into Anthropic turns.
///
/// Consecutive tool results become one user turn of `tool_result` blocks,
/// directly after the assistant turn that requested them.
fn build_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system: Vec<&str> = Vec::new();
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system.push(&msg.content),
            Role::User => out.push(AnthropicMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut content = Vec::new();
                if !msg.content.is_empty() {
                    content.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                content.extend(msg.tool_calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                }));
                out.push(AnthropicMessage {
                    role: "assistant",
                    content,
                });
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone(),
                };
                match out.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => out.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, out)
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

fn into_chat_response(response: AnthropicResponse) -> ChatResponse {
    let mut text = Vec::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text: t } => text.push(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input,
            }),
            ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    ChatResponse {
        content: (!text.is_empty()).then(|| text.join("\n")),
        tool_calls,
        usage: TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
        finish_reason: parse_finish_reason(response.stop_reason.as_deref()),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        self.config.model(tier)
    }

    fn cost_per_token(&self, tier: ModelTier) -> (Decimal, Decimal) {
        // Per 1M tokens, converted to per token.
        match self.model_for(tier) {
            m if m.contains("opus") => (dec!(0.000015), dec!(0.000075)),
            m if m.contains("haiku") => (dec!(0.0000008), dec!(0.000004)),
            _ => (dec!(0.000003), dec!(0.000015)),
        }
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let (system, messages) = build_messages(&request.messages);

        let tools = request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.parameters,
            })
            .collect::<Vec<_>>();
        let tool_choice = (!tools.is_empty()).then(|| AnthropicToolChoice {
            choice_type: match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::Required => "any",
                ToolChoice::None => "none",
            },
        });

        let body = AnthropicRequest {
            model: self.model_for(request.tier),
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            system,
            tools,
            tool_choice,
        };

        let response = self
            .client
            .post(format!("{}/messages", self.config.base_url))
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let reason = match response.json::<AnthropicError>().await {
                Ok(err) => err.error.message,
                Err(_) => status.to_string(),
            };
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                },
                s if s.is_server_error() => LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason,
                },
                _ => LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason,
                },
            });
        }

        let parsed: AnthropicResponse = response.json().await?;
        Ok(into_chat_response(parsed))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn tool_results_are_grouped_after_tool_use() {
        let call = |id: &str| ToolCall {
            id: id.to_string(),
            name: "exec".to_string(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        let messages = vec![
            ChatMessage::system("You are a worker."),
            ChatMessage::user("List files"),
            ChatMessage::assistant_with_tool_calls(
                Some("Looking".to_string()),
                vec![call("a"), call("b")],
            ),
            ChatMessage::tool_result("a", "Cargo.toml"),
            ChatMessage::tool_result("b", "src"),
        ];

        let (system, out) = build_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are a worker."));
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].role, "assistant");
        assert_eq!(out[1].content.len(), 3);
        assert_eq!(out[2].role, "user");
        assert_eq!(out[2].content.len(), 2);
        assert!(matches!(
            &out[2].content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "a"
        ));
    }

    #[test]
    fn parses_tool_use_response() {
        let json = serde_json::json!({
            "content": [
                {"type": "text", "text": "Running it"},
                {"type": "tool_use", "id": "toolu_1", "name": "exec", "input": {"command": "pwd"}},
                {"type": "thinking", "thinking": "..."}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let parsed: AnthropicResponse = serde_json::from_value(json).unwrap();
        let response = into_chat_response(parsed);

        assert_eq!(response.content.as_deref(), Some("Running it"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "exec");
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.usage.total(), 19);
    }

    #[test]
    fn request_serializes_tool_choice() {
        let params = serde_json::json!({"type": "object"});
        let body = AnthropicRequest {
            model: "claude",
            messages: Vec::new(),
            max_tokens: 10,
            system: None,
            tools: vec![AnthropicTool {
                name: "task_done",
                description: "finish",
                input_schema: &params,
            }],
            tool_choice: Some(AnthropicToolChoice { choice_type: "any" }),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["tool_choice"]["type"], "any");
        assert_eq!(value["tools"][0]["name"], "task_done");
        assert!(value.get("system").is_none());
    }

    #[test]
    fn tier_pricing_follows_model() {
        let provider = AnthropicProvider::new(LlmConfig::new(SecretString::from("sk")));
        let (fast_in, _) = provider.cost_per_token(ModelTier::Fast);
        let (strong_in, _) = provider.cost_per_token(ModelTier::Strong);
        assert!(fast_in < strong_in);
        assert_eq!(provider.name(), "anthropic");
    }
}
