//! 工具参数 JSON Schema 生成（schemars）
//!
//! 参数结构体派生 JsonSchema，生成的 schema 作为 ToolDefinition.input_schema 发给 LLM，减少参数格式错误。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

/// echo 工具参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// 要回显的文本
    pub text: String,
}

/// 单个委派子任务
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, serde::Serialize, JsonSchema)]
pub struct DelegatedTask {
    /// 子任务标题，用作代理交互的标题
    pub title: String,
    /// 交给子代理的完整指令
    pub instructions: String,
}

/// delegate_tasks 工具参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DelegateTasksArgs {
    /// 相互独立、可并发执行的子任务
    pub tasks: Vec<DelegatedTask>,
}

/// 参数类型对应的 JSON Schema
pub fn input_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}
