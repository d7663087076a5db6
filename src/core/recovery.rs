//! 错误恢复引擎
//!
//! 根据失败发生的回合决定降级继续还是终止：首个请求失败由回合循环直接视为致命，
//! 循环内最后一个允许的回合失败则终止，更早的回合以合成响应继续。

use crate::core::{OrchestratorError, RecoveryAction};

/// 合成的助手响应文本（降级继续时写入历史）
pub const DEGRADED_RESPONSE: &str = "An error occurred while contacting the LLM; continuing.";

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// turn 为失败请求所属的回合序号（1 起），max_turns 为本语句的回合上限
    pub fn handle(&self, err: &OrchestratorError, turn: u32, max_turns: u32) -> RecoveryAction {
        match err {
            OrchestratorError::Provider(e) if turn < max_turns => {
                RecoveryAction::ContinueWithNotice(format!("Error with LLM request: {}", e))
            }
            // 持久化/输入类错误不属于可降级的通信失败
            _ => RecoveryAction::Abort,
        }
    }
}
