//! Hive - 多轮 LLM 对话编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、回合循环、错误与恢复、会话监管、任务调度、事件
//! - **hydration**: 上下文水合（资源占位符展开与窗口压缩）
//! - **interaction**: 交互容器、消息、资源修订、钩子与层级注册表
//! - **llm**: LLM 客户端抽象、重试包装与测试客户端
//! - **observability**: tracing 订阅器初始化
//! - **persistence**: 交互与资源修订的存储
//! - **stats**: 计数、Token 用量、工具统计与全局汇总
//! - **tools**: 工具契约、注册表、串行执行器与内置工具

pub mod config;
pub mod core;
pub mod hydration;
pub mod interaction;
pub mod llm;
pub mod observability;
pub mod persistence;
pub mod stats;
pub mod tools;

pub use crate::core::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, StatementOptions, StatementResult,
};
