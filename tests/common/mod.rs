//! 集成测试公共设施：脚本化 LLM、内存存储、测试工具

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::core::{EventEnvelope, EventReceiver, Orchestrator, OrchestratorBuilder};
use hive::interaction::{Interaction, ResourceAttachment};
use hive::llm::{LlmClient, ToolInvocation};
use hive::persistence::{InteractionPersistence, MemoryPersistence, PersistenceError};
use hive::tools::{Tool, ToolContext, ToolRegistry, ToolRunResult};
use tokio::sync::{mpsc, Mutex};

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub persistence: Arc<MemoryPersistence>,
    pub events: EventReceiver,
    pub conversation_id: String,
}

impl Harness {
    /// 取出目前为止的全部事件
    pub fn drain_events(&mut self) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            out.push(envelope);
        }
        out
    }

    pub async fn interaction(&self) -> Interaction {
        let shared = self
            .orchestrator
            .get_interaction(&self.conversation_id)
            .await
            .expect("conversation registered");
        let interaction = shared.lock().await.clone();
        interaction
    }
}

pub fn test_tools() -> ToolRegistry {
    let mut tools = OrchestratorBuilder::default_tool_registry();
    tools.register(ExplodeTool);
    tools.register(ReadFileTool);
    tools
}

pub async fn harness(llm: Arc<dyn LlmClient>, config: AppConfig) -> Harness {
    harness_with_tools(llm, config, test_tools()).await
}

pub async fn harness_with_tools(
    llm: Arc<dyn LlmClient>,
    config: AppConfig,
    tools: ToolRegistry,
) -> Harness {
    let persistence = Arc::new(MemoryPersistence::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = OrchestratorBuilder::new(config)
        .with_llm(llm)
        .with_persistence(persistence.clone())
        .with_tools(tools)
        .with_event_sink(tx)
        .build()
        .expect("orchestrator builds");
    let conversation = orchestrator.create_conversation(None).await.expect("conversation");
    let conversation_id = conversation.lock().await.id.clone();
    Harness {
        orchestrator,
        persistence,
        events: rx,
        conversation_id,
    }
}

pub fn echo_call(text: &str) -> ToolInvocation {
    ToolInvocation::new("echo", serde_json::json!({ "text": text }))
}

/// 总是失败的工具
pub struct ExplodeTool;

#[async_trait]
impl Tool for ExplodeTool {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn run(
        &self,
        _interaction: &Interaction,
        _invocation: &ToolInvocation,
        _ctx: &ToolContext,
    ) -> Result<ToolRunResult, String> {
        Err("disk on fire".to_string())
    }
}

/// 读取"文件"：返回固定内容并作为资源附带
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a file and attaches it as a resource"
    }

    async fn run(
        &self,
        _interaction: &Interaction,
        invocation: &ToolInvocation,
        _ctx: &ToolContext,
    ) -> Result<ToolRunResult, String> {
        let path = invocation
            .input
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing path".to_string())?;
        Ok(ToolRunResult::text(format!("read {}", path))
            .with_attachment(ResourceAttachment::text(path, format!("contents of {}", path))))
    }
}

/// save 总是失败的存储
pub struct FailingPersistence;

#[async_trait]
impl InteractionPersistence for FailingPersistence {
    async fn save(&self, _interaction: &Interaction) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("disk full".to_string()))
    }

    async fn load(&self, _id: &str) -> Result<Option<Interaction>, PersistenceError> {
        Ok(None)
    }

    async fn delete(&self, _id: &str) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn store_resource_revision(
        &self,
        _interaction_id: &str,
        _uri: &str,
        _revision: &str,
        _content: &[u8],
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn get_resource_revision(
        &self,
        _interaction_id: &str,
        _uri: &str,
        _revision: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(None)
    }
}

/// 每个交互的首次 save 写入内存存储，之后的 save 全部失败
#[derive(Default)]
pub struct SecondSaveFails {
    pub inner: MemoryPersistence,
    saves: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl InteractionPersistence for SecondSaveFails {
    async fn save(&self, interaction: &Interaction) -> Result<(), PersistenceError> {
        let previous = {
            let mut saves = self.saves.lock().await;
            let count = saves.entry(interaction.id.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        if previous > 0 {
            return Err(PersistenceError::Backend("disk full".to_string()));
        }
        self.inner.save(interaction).await
    }

    async fn load(&self, id: &str) -> Result<Option<Interaction>, PersistenceError> {
        self.inner.load(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        self.inner.delete(id).await
    }

    async fn store_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError> {
        self.inner
            .store_resource_revision(interaction_id, uri, revision, content)
            .await
    }

    async fn get_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.inner.get_resource_revision(interaction_id, uri, revision).await
    }
}
