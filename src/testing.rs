//! Test doubles shared by unit and integration tests.
//!
//! Compiled for `cfg(test)` and behind the `test-support` feature.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::LlmError;
use crate::llm::{
    ChatRequest, ChatResponse, FinishReason, LlmProvider, ModelTier, TokenUsage, ToolCall,
};
use crate::store::LibSqlBackend;

/// One scripted answer of [`ScriptedLlm`].
#[derive(Debug)]
pub enum ScriptedReply {
    Response(ChatResponse),
    Error(LlmError),
    /// Never answers.
    Hang,
    /// Panics inside `chat`.
    Panic,
}

impl ScriptedReply {
    /// Plain text, no tool calls.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Response(ChatResponse {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            usage: usage(),
            finish_reason: FinishReason::Stop,
        })
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let id = format!("call_{}", uuid::Uuid::new_v4().simple());
        Self::Response(ChatResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id,
                name: name.into(),
                arguments,
            }],
            usage: usage(),
            finish_reason: FinishReason::ToolUse,
        })
    }

    /// `task_done` with `summary`.
    pub fn done(summary: impl Into<String>) -> Self {
        Self::tool_call("task_done", serde_json::json!({ "summary": summary.into() }))
    }
}

fn usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 100,
        output_tokens: 10,
    }
}

type Responder = Box<dyn Fn(&ChatRequest) -> ScriptedReply + Send + Sync>;

/// LLM provider that replays a script, then falls back to a responder.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(script: Vec<ScriptedReply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers every call with `responder`.
    pub fn always(responder: impl Fn(&ChatRequest) -> ScriptedReply + Send + Sync + 'static) -> Self {
        Self::new(Vec::new()).with_fallback(responder)
    }

    /// Used once the script runs out.
    pub fn with_fallback(
        mut self,
        responder: impl Fn(&ChatRequest) -> ScriptedReply + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(responder));
        self
    }

    pub fn into_arc(self) -> Arc<dyn LlmProvider> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next(&self, request: &ChatRequest) -> Option<ScriptedReply> {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.or_else(|| self.fallback.as_ref().map(|f| f(request)))
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_for(&self, _tier: ModelTier) -> &str {
        "scripted-model"
    }

    fn cost_per_token(&self, _tier: ModelTier) -> (Decimal, Decimal) {
        (dec!(0.000001), dec!(0.000002))
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.next(&request);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        match reply {
            Some(ScriptedReply::Response(response)) => Ok(response),
            Some(ScriptedReply::Error(err)) => Err(err),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            Some(ScriptedReply::Panic) => panic!("scripted provider panic"),
            None => Err(LlmError::InvalidResponse {
                provider: "scripted".to_string(),
                reason: "script exhausted".to_string(),
            }),
        }
    }
}

/// Fresh in-memory store with the schema applied.
pub async fn memory_store() -> Arc<LibSqlBackend> {
    match LibSqlBackend::new_memory().await {
        Ok(db) => Arc::new(db),
        Err(e) => panic!("in-memory database: {e}"),
    }
}
