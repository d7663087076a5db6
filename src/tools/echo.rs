//! Echo 工具（测试与演示用）

use async_trait::async_trait;
use serde_json::Value;

use crate::interaction::Interaction;
use crate::llm::ToolInvocation;
use crate::tools::schema::{input_schema, EchoArgs};
use crate::tools::{Tool, ToolContext, ToolRunResult};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<EchoArgs>()
    }

    async fn run(
        &self,
        _interaction: &Interaction,
        invocation: &ToolInvocation,
        _ctx: &ToolContext,
    ) -> Result<ToolRunResult, String> {
        let args: EchoArgs = serde_json::from_value(invocation.input.clone())
            .map_err(|e| format!("invalid arguments: {}", e))?;
        Ok(ToolRunResult::text(args.text))
    }
}
