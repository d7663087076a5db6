//! LLM 层：客户端抽象、重试包装与测试用客户端

pub mod mock;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use traits::{
    LlmClient, LlmError, LlmRequest, LlmResponse, RequestOptions, RequestPurpose, RetryConfig,
    RetryingLlmClient, ToolInvocation,
};
