//! 测试与本地运行用的 LLM 客户端（无需 API）
//!
//! - ScriptedLlmClient：按脚本依次返回响应或错误，记录所有请求，供测试断言
//! - MockLlmClient：回显客户端，"echo <text>" 触发 echo 工具，便于本地跑通回合循环

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::{LlmClient, LlmError, LlmRequest, LlmResponse, RequestPurpose, ToolInvocation};
use crate::stats::TokenUsage;

/// 脚本化客户端
///
/// 主回合请求（Statement / ToolFeedback）依次消费脚本；脚本耗尽后返回 fallback
/// （默认为纯文本 "Done."）。标题与目标请求不消费脚本，返回确定性的文本。
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    fallback: LlmResponse,
    usage: TokenUsage,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: LlmResponse::from_text("Done."),
            usage: TokenUsage::new(10, 5),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 脚本耗尽后重复返回的响应（例如一直调用工具）
    pub fn with_fallback(mut self, response: LlmResponse) -> Self {
        self.fallback = response;
        self
    }

    /// 未显式设置用量的响应使用的默认用量
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub async fn push_response(&self, response: LlmResponse) {
        self.script.lock().await.push_back(Ok(response));
    }

    pub async fn push_text(&self, text: &str) {
        self.push_response(LlmResponse::from_text(text)).await;
    }

    pub async fn push_tool_call(&self, name: &str, input: serde_json::Value) {
        self.push_response(
            LlmResponse::from_text(format!("Calling {}", name))
                .with_tool(ToolInvocation::new(name, input)),
        )
        .await;
    }

    pub async fn push_error(&self, error: LlmError) {
        self.script.lock().await.push_back(Err(error));
    }

    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().await.clone()
    }

    /// 仅主回合请求
    pub async fn turn_requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.purpose.is_turn())
            .cloned()
            .collect()
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }

    fn with_default_usage(&self, mut response: LlmResponse) -> LlmResponse {
        if response.usage.is_empty() {
            response.usage = self.usage.clone();
        }
        response
    }
}

impl Default for ScriptedLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn send(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().await.push(request.clone());
        let prompt = request.last_user_text().unwrap_or_default();
        let statement = subject(&prompt);
        let reply = match request.purpose {
            RequestPurpose::Title => LlmResponse::from_text(synthetic_title(statement)),
            RequestPurpose::ConversationObjective => {
                LlmResponse::from_text(format!("Help the user with: {}", first_line(statement)))
            }
            RequestPurpose::StatementObjective => {
                LlmResponse::from_text(format!("Address: {}", first_line(statement)))
            }
            RequestPurpose::Statement | RequestPurpose::ToolFeedback => {
                match self.script.lock().await.pop_front() {
                    Some(Ok(resp)) => resp,
                    Some(Err(e)) => return Err(e),
                    None => self.fallback.clone(),
                }
            }
        };
        Ok(self.with_default_usage(reply))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 回显客户端
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn send(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let last_user = request
            .last_user_text()
            .unwrap_or_else(|| "(no input)".to_string());
        let usage = TokenUsage::new(
            (request.system.len() + last_user.len()) as u64 / 4,
            last_user.len() as u64 / 4 + 1,
        );
        let resp = match request.purpose {
            RequestPurpose::Title => LlmResponse::from_text(synthetic_title(subject(&last_user))),
            RequestPurpose::ConversationObjective | RequestPurpose::StatementObjective => {
                LlmResponse::from_text(format!("Respond to: {}", first_line(subject(&last_user))))
            }
            RequestPurpose::Statement => match last_user.trim().strip_prefix("echo ") {
                Some(text) if !request.tools.is_empty() => {
                    LlmResponse::from_text("<thinking>The user wants an echo.</thinking>")
                        .with_tool(ToolInvocation::new("echo", serde_json::json!({ "text": text })))
                }
                _ => LlmResponse::from_text(format!("Echo from Mock: {}", last_user.trim())),
            },
            RequestPurpose::ToolFeedback => {
                LlmResponse::from_text(format!("Tool results received:\n{}", last_user.trim()))
            }
        };
        Ok(resp.with_usage(usage))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 辅助请求把用户语句放在提示的最后一段
fn subject(prompt: &str) -> &str {
    prompt.rsplit("\n\n").next().unwrap_or(prompt)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn synthetic_title(statement: &str) -> String {
    let words: Vec<&str> = statement.split_whitespace().take(6).collect();
    if words.is_empty() {
        "Untitled conversation".to_string()
    } else {
        words.join(" ")
    }
}
