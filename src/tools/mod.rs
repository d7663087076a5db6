//! 工具层：Tool 契约、注册表、串行执行器与内置工具（echo、delegate_tasks）

pub mod delegate;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use delegate::{AgentDelegator, DelegateTasksTool, DelegationOutcome};
pub use echo::EchoTool;
pub use executor::{error_fragment, truncate_response, ToolExecutor, ToolOutcome};
pub use registry::{Tool, ToolContext, ToolDefinition, ToolRegistry, ToolRunResult};
pub use schema::{input_schema, DelegatedTask};
