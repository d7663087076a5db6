//! 会话监管：编排器级取消标志
//!
//! 每个编排器持有一个 CancellationToken；新语句开始时换新令牌，外部取消调用触发当前令牌。
//! 回合循环只在迭代边界检查令牌，进行中的请求与工具不会被抢占。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// 顶层语句开始：丢弃旧令牌（上一次的取消不影响新语句）
    pub fn begin_operation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }

    /// 当前令牌；委派出的子语句复用它，顶层取消会一并停止子代理
    pub fn current_token(&self) -> CancellationToken {
        match self.current.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn cancel(&self) {
        self.current_token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_token().is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
