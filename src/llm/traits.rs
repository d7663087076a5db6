//! LLM 客户端抽象
//!
//! 编排器只依赖 LlmClient::send：请求携带交互 id、用途、system prompt、已水合的消息与工具定义，
//! 响应返回内容片段、工具调用与 Token 用量。具体后端的线协议不在本 crate 内。

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interaction::{ContentPart, Message};
use crate::stats::TokenUsage;
use crate::tools::ToolDefinition;

/// 请求用途：主回合（首个请求 / 工具反馈）或辅助合成（标题 / 目标）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    Statement,
    ToolFeedback,
    Title,
    ConversationObjective,
    StatementObjective,
}

impl RequestPurpose {
    /// 是否为回合循环的主请求
    pub fn is_turn(&self) -> bool {
        matches!(self, Self::Statement | Self::ToolFeedback)
    }
}

impl fmt::Display for RequestPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Statement => "statement",
            Self::ToolFeedback => "tool_feedback",
            Self::Title => "title",
            Self::ConversationObjective => "conversation_objective",
            Self::StatementObjective => "statement_objective",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmRequest {
    pub interaction_id: String,
    pub purpose: RequestPurpose,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl LlmRequest {
    /// 最后一条用户消息的文本
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(Message::text)
    }
}

/// LLM 请求的工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            input,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentPart>,
    pub tool_invocations: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::text(text)],
            ..Self::default()
        }
    }

    pub fn with_tool(mut self, invocation: ToolInvocation) -> Self {
        self.tool_invocations.push(invocation);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// 顶层文本片段拼接
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 写入历史的助手消息内容：文本片段 + 工具调用片段
    pub fn to_message_content(&self) -> Vec<ContentPart> {
        let mut parts = self.content.clone();
        parts.extend(self.tool_invocations.iter().map(|t| ContentPart::ToolUse {
            id: t.id.clone(),
            name: t.name.clone(),
            input: t.input.clone(),
        }));
        parts
    }
}

/// LLM 后端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out")]
    Timeout,
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout)
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }
}

/// 重试配置：仅对限流与超时重试，指数退避
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// 带重试的包装客户端；回合循环本身不做重试，由它承担后端层的退避
pub struct RetryingLlmClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: LlmClient> RetryingLlmClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for RetryingLlmClient<C> {
    async fn send(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;
        loop {
            match self.inner.send(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let wait = match &e {
                        LlmError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms).max(backoff)
                        }
                        _ => backoff,
                    };
                    tracing::warn!(
                        client = self.inner.name(),
                        attempt,
                        error = %e,
                        wait_ms = wait.as_millis() as u64,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
