//! 代理委派工具
//!
//! delegate_tasks 把一批相互独立的子任务交给编排器：每个子任务在当前交互下新建一个代理交互，
//! 拥有独立的历史与统计；子代理并发运行，全部结束后把结果汇总为一次工具响应。
//! 编排器通过 ToolContext 中的 AgentDelegator 接入，工具本身不持有编排器。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::interaction::Interaction;
use crate::llm::ToolInvocation;
use crate::tools::schema::{input_schema, DelegateTasksArgs, DelegatedTask};
use crate::tools::{Tool, ToolContext, ToolRunResult};

/// 单个子代理的结果
#[derive(Clone, Debug, Serialize)]
pub struct DelegationOutcome {
    pub title: String,
    pub interaction_id: String,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub turns: u32,
}

impl DelegationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// 代理委派入口（由编排器实现）
#[async_trait]
pub trait AgentDelegator: Send + Sync {
    async fn delegate_tasks(
        &self,
        parent_id: &str,
        tasks: Vec<DelegatedTask>,
    ) -> Result<Vec<DelegationOutcome>, OrchestratorError>;
}

pub struct DelegateTasksTool;

#[async_trait]
impl Tool for DelegateTasksTool {
    fn name(&self) -> &str {
        "delegate_tasks"
    }

    fn description(&self) -> &str {
        "Delegate independent sub-tasks to sub-agents that run concurrently, \
         each with its own history. Returns every sub-agent's answer once all of them finish."
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<DelegateTasksArgs>()
    }

    async fn run(
        &self,
        interaction: &Interaction,
        invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> Result<ToolRunResult, String> {
        let args: DelegateTasksArgs = serde_json::from_value(invocation.input.clone())
            .map_err(|e| format!("invalid arguments: {}", e))?;
        if args.tasks.is_empty() {
            return Err("no tasks given".to_string());
        }
        let delegator = ctx
            .delegator
            .as_ref()
            .ok_or_else(|| "agent delegation is not available".to_string())?;

        let outcomes = delegator
            .delegate_tasks(&interaction.id, args.tasks)
            .await
            .map_err(|e| e.to_string())?;

        let all_failed = outcomes.iter().all(|o| !o.succeeded());
        let text = render_outcomes(&outcomes);
        Ok(if all_failed {
            ToolRunResult::error(text)
        } else {
            ToolRunResult::text(text)
        })
    }
}

fn render_outcomes(outcomes: &[DelegationOutcome]) -> String {
    outcomes
        .iter()
        .enumerate()
        .map(|(i, o)| match (&o.answer, &o.error) {
            (_, Some(err)) => format!("### Task {}: {}\nFailed: {}", i + 1, o.title, err),
            (Some(answer), None) => format!(
                "### Task {}: {} ({} turns)\n{}",
                i + 1,
                o.title,
                o.turns,
                answer
            ),
            (None, None) => format!("### Task {}: {}\n(no answer)", i + 1, o.title),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
