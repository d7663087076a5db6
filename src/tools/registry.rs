//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / run），由 ToolRegistry 按名注册与查找；
//! ToolExecutor 负责串行执行、失败转文本与审计日志。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::interaction::{ContentPart, Interaction, ResourceAttachment};
use crate::llm::ToolInvocation;
use crate::tools::AgentDelegator;

/// 发给 LLM 的工具定义
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 工具执行上下文
#[derive(Clone)]
pub struct ToolContext {
    pub interaction_id: String,
    /// 当前语句内的回合序号（首个响应触发的工具为第 1 回合）
    pub turn: u32,
    pub cancel: CancellationToken,
    /// 代理委派入口；无编排器时为 None
    pub delegator: Option<Arc<dyn AgentDelegator>>,
}

impl ToolContext {
    pub fn new(interaction_id: impl Into<String>, turn: u32) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            turn,
            cancel: CancellationToken::new(),
            delegator: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn AgentDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }
}

/// 一次工具执行的结果
#[derive(Clone, Debug, Default)]
pub struct ToolRunResult {
    /// 放进 tool_result 片段的内容
    pub result_parts: Vec<ContentPart>,
    /// 拼进反馈语句的文本
    pub response_text: String,
    /// 副作用：工具产出的资源（按反馈消息 id 作为修订号存储）
    pub attachments: Vec<ResourceAttachment>,
    pub is_error: bool,
}

impl ToolRunResult {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            result_parts: vec![ContentPart::text(text.clone())],
            response_text: text,
            attachments: Vec::new(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    pub fn with_attachment(mut self, attachment: ResourceAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认为无参数对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn run(
        &self,
        interaction: &Interaction,
        invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> Result<ToolRunResult, String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称排序的工具定义，保证每次请求中的工具顺序一致
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
