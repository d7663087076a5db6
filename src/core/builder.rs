//! 编排器构建器：统一的初始化逻辑
//!
//! 校验配置、选择持久化实现、注册内置工具，库调用方与 main 共用同一套组装流程。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::events::{EventEmitter, EventEnvelope};
use crate::core::{Orchestrator, OrchestratorError};
use crate::llm::LlmClient;
use crate::persistence::{create_persistence, InteractionPersistence};
use crate::tools::{DelegateTasksTool, EchoTool, ToolExecutor, ToolRegistry};

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    persistence: Option<Arc<dyn InteractionPersistence>>,
    tools: Option<ToolRegistry>,
    event_sink: Option<mpsc::UnboundedSender<EventEnvelope>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            persistence: None,
            tools: None,
            event_sink: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 未设置时按 [persistence].data_dir 选择文件或内存存储
    pub fn with_persistence(mut self, persistence: Arc<dyn InteractionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 替换默认工具集
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// 内置工具：echo、delegate_tasks
    pub fn default_tool_registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(DelegateTasksTool);
        tools
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let window = self.config.validate()?;
        let llm = self
            .llm
            .ok_or_else(|| OrchestratorError::Config("no LLM client configured".to_string()))?;
        let persistence = self
            .persistence
            .unwrap_or_else(|| create_persistence(self.config.persistence.data_dir.as_deref()));
        let tools = self.tools.unwrap_or_else(Self::default_tool_registry);
        tracing::info!(
            client = llm.name(),
            tools = ?tools.tool_names(),
            max_turns = self.config.orchestrator.max_turns,
            window = window.get(),
            "orchestrator ready"
        );
        let executor = ToolExecutor::new(tools, self.config.tools.max_result_chars);
        Ok(Orchestrator::from_parts(
            self.config,
            window,
            llm,
            persistence,
            executor,
            EventEmitter::new(self.event_sink),
        ))
    }
}
