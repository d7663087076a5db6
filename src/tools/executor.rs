//! 工具执行器
//!
//! 持有 ToolRegistry，按 LLM 返回的顺序逐个执行工具调用（不做回合内并行）。
//! 工具返回 Err 或不存在时转为 "Error with <tool>: <message>" 文本片段，回合照常继续；
//! 每次调用输出一条结构化审计日志（JSON）。超时由上层后端负责，这里不设硬超时。

use std::time::Instant;

use crate::core::OrchestratorError;
use crate::interaction::{ContentPart, Interaction};
use crate::llm::ToolInvocation;
use crate::tools::{ToolContext, ToolDefinition, ToolRegistry, ToolRunResult};

/// 单次调用的结果
#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub invocation: ToolInvocation,
    pub result: ToolRunResult,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        !self.result.is_error
    }

    /// 写入反馈消息的 tool_result 片段
    pub fn to_result_part(&self) -> ContentPart {
        ContentPart::ToolResult {
            tool_use_id: self.invocation.id.clone(),
            content: self.result.result_parts.clone(),
            is_error: self.result.is_error,
        }
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
    max_result_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, max_result_chars: usize) -> Self {
        Self {
            registry,
            max_result_chars,
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行单个工具调用；失败永不向外传播
    pub async fn execute(
        &self,
        interaction: &Interaction,
        invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let start = Instant::now();
        let result = self.run_tool(interaction, invocation, ctx).await;

        let (ok, outcome) = match &result {
            Ok(r) if !r.is_error => (true, "ok"),
            Ok(_) => (false, "error_result"),
            Err(_) => (false, "error"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "interaction_id": ctx.interaction_id,
            "turn": ctx.turn,
            "tool": invocation.name,
            "invocation_id": invocation.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&invocation.input),
        });
        tracing::info!(target: "tool", audit = %audit.to_string(), "tool");

        let mut result = match result {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(
                    tool = %invocation.name,
                    kind = err.kind(),
                    error = %err,
                    "tool execution failed"
                );
                failure_result(&err)
            }
        };
        result.response_text = truncate_response(&result.response_text, self.max_result_chars);

        ToolOutcome {
            invocation: invocation.clone(),
            result,
            duration_ms,
        }
    }

    async fn run_tool(
        &self,
        interaction: &Interaction,
        invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> Result<ToolRunResult, OrchestratorError> {
        let tool = self
            .registry
            .get(&invocation.name)
            .ok_or_else(|| OrchestratorError::ToolExecution {
                tool: invocation.name.clone(),
                message: format!("Unknown tool: {}", invocation.name),
            })?;
        tool.run(interaction, invocation, ctx)
            .await
            .map_err(|message| OrchestratorError::ToolExecution {
                tool: invocation.name.clone(),
                message,
            })
    }
}

/// 失败转为错误结果，回合继续
fn failure_result(err: &OrchestratorError) -> ToolRunResult {
    match err {
        OrchestratorError::ToolExecution { tool, message } => {
            ToolRunResult::error(error_fragment(tool, message))
        }
        other => ToolRunResult::error(other.to_string()),
    }
}

/// 工具失败时对 LLM 可见的文本
pub fn error_fragment(tool: &str, message: &str) -> String {
    format!("Error with {}: {}", tool, message)
}

/// 超过 max_chars 个字符的响应截断并附标记
pub fn truncate_response(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if max_chars == 0 || total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}\n...[truncated {} chars]", kept, total - max_chars)
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
