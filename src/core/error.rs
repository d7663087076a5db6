//! 编排器错误类型与恢复动作
//!
//! 结构性错误（非法输入、实体缺失、持久化失败）抛给调用方；
//! 局部可恢复错误（单个工具失败、循环中途的 LLM 请求失败）由回合循环吸收，转为对 LLM 可见的文本。

use thiserror::Error;

use crate::llm::LlmError;
use crate::persistence::PersistenceError;

/// 编排器对外暴露的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 空语句、非法窗口大小、未知交互类型等，在任何修改前拒绝
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("LLM provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn empty_statement() -> Self {
        Self::InvalidInput("statement is empty".to_string())
    }

    /// 事件与日志中使用的简短类别名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Provider(_) => "provider",
            Self::Persistence(_) => "persistence",
            Self::Config(_) => "config",
        }
    }
}

/// 回合失败后的处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 以合成响应代替失败的响应，并把提示作为下一轮反馈
    ContinueWithNotice(String),
    /// 终止当前语句
    Abort,
}
