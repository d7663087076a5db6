//! 编排器：对外 API
//!
//! handle_statement 驱动一条语句走完回合循环（见 turn_loop）；此外负责交互的创建、加载、删除，
//! 资源附加，取消，以及批量代理委派。编排器可廉价 Clone，内部状态共享于 Arc 中。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::core::events::{EventEmitter, OrchestratorEvent};
use crate::core::{OrchestratorError, RecoveryEngine, SessionSupervisor, TaskScheduler};
use crate::hydration::HydrationWindow;
use crate::interaction::{
    resource_placeholder, InteractionKind, InteractionManager, Message, ResourceAttachment, Role,
    SharedInteraction,
};
use crate::llm::LlmClient;
use crate::persistence::InteractionPersistence;
use crate::stats::{
    InteractionStats, InteractionUsage, OrchestratorTotals, StatsAggregator, TokenUsage,
};
use crate::tools::{AgentDelegator, DelegatedTask, DelegationOutcome, ToolExecutor};

/// 单条语句的选项
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementOptions {
    /// 覆盖配置中的回合上限
    pub max_turns: Option<u32>,
}

impl StatementOptions {
    pub fn with_max_turns(max_turns: u32) -> Self {
        Self {
            max_turns: Some(max_turns),
        }
    }
}

/// handle_statement 的结果
#[derive(Debug, Clone, Serialize)]
pub struct StatementResult {
    pub interaction_id: String,
    pub answer: String,
    pub thinking: Option<String>,
    pub stats: InteractionStats,
    pub token_usage: TokenUsage,
    /// 循环因取消而提前结束；answer 为截至取消时的最好结果
    pub cancelled: bool,
}

pub(crate) struct OrchestratorInner {
    pub(crate) config: AppConfig,
    pub(crate) window: HydrationWindow,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) persistence: Arc<dyn InteractionPersistence>,
    pub(crate) manager: InteractionManager,
    pub(crate) executor: ToolExecutor,
    /// 计数权威；只在同步小段内持锁，不跨 await
    pub(crate) stats: RwLock<StatsAggregator>,
    pub(crate) supervisor: SessionSupervisor,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) events: EventEmitter,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub(crate) fn from_parts(
        config: AppConfig,
        window: HydrationWindow,
        llm: Arc<dyn LlmClient>,
        persistence: Arc<dyn InteractionPersistence>,
        executor: ToolExecutor,
        events: EventEmitter,
    ) -> Self {
        let scheduler = TaskScheduler::new(config.delegation.max_concurrent);
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                window,
                llm,
                persistence,
                manager: InteractionManager::new(),
                executor,
                stats: RwLock::new(StatsAggregator::new()),
                supervisor: SessionSupervisor::new(),
                scheduler,
                recovery: RecoveryEngine::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &InteractionManager {
        &self.inner.manager
    }

    /// 处理一条用户语句
    pub async fn handle_statement(
        &self,
        text: &str,
        interaction_id: &str,
        options: StatementOptions,
    ) -> Result<StatementResult, OrchestratorError> {
        let max_turns = options
            .max_turns
            .unwrap_or(self.inner.config.orchestrator.max_turns);
        self.run_statement(text, interaction_id, max_turns, true).await
    }

    /// 请求停止当前语句；循环在下一个迭代边界退出
    pub async fn cancel_current_operation(
        &self,
        interaction_id: &str,
    ) -> Result<(), OrchestratorError> {
        if !self.inner.manager.contains(interaction_id).await {
            return Err(OrchestratorError::not_found("interaction", interaction_id));
        }
        tracing::info!(interaction_id = %interaction_id, "cancellation requested");
        self.inner.supervisor.cancel();
        Ok(())
    }

    /// 新建顶层对话
    pub async fn create_conversation(
        &self,
        title: Option<&str>,
    ) -> Result<SharedInteraction, OrchestratorError> {
        self.create_interaction(InteractionKind::Conversation, None, title).await
    }

    /// 在 parent 下新建代理交互（独立历史与统计）
    pub async fn create_agent_interaction(
        &self,
        parent_id: &str,
        title: &str,
    ) -> Result<SharedInteraction, OrchestratorError> {
        self.create_interaction(InteractionKind::Conversation, Some(parent_id), Some(title))
            .await
    }

    pub async fn create_chat_interaction(
        &self,
        parent_id: &str,
        title: &str,
    ) -> Result<SharedInteraction, OrchestratorError> {
        self.create_interaction(InteractionKind::Chat, Some(parent_id), Some(title))
            .await
    }

    pub(crate) async fn create_interaction(
        &self,
        kind: InteractionKind,
        parent_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<SharedInteraction, OrchestratorError> {
        let id = uuid::Uuid::new_v4().to_string();
        let shared = self.inner.manager.create(kind, &id, parent_id).await?;
        if let Some(title) = title {
            shared.lock().await.title = Some(title.to_string());
        }
        self.inner
            .stats
            .write()
            .await
            .track(&id, InteractionStats::default(), TokenUsage::default());
        if title.is_some() {
            self.inner.events.emit(OrchestratorEvent::NewInteraction {
                interaction_id: id.clone(),
                kind,
                parent_id: parent_id.map(String::from),
                title: title.map(String::from),
            });
        }
        tracing::info!(
            interaction_id = %id,
            kind = %kind,
            parent = ?parent_id,
            "interaction created"
        );
        Ok(shared)
    }

    pub async fn get_interaction(&self, id: &str) -> Option<SharedInteraction> {
        self.inner.manager.get(id).await
    }

    /// 从持久化层恢复交互并注册；已在线时直接返回
    pub async fn load_interaction(&self, id: &str) -> Result<SharedInteraction, OrchestratorError> {
        if let Some(existing) = self.inner.manager.get(id).await {
            return Ok(existing);
        }
        let interaction = self
            .inner
            .persistence
            .load(id)
            .await
            .map_err(|e| {
                tracing::error!(interaction_id = %id, error = %e, "failed to load interaction");
                OrchestratorError::from(e)
            })?
            .ok_or_else(|| OrchestratorError::not_found("interaction", id))?;

        let parent = match interaction.parent_id.clone() {
            Some(p) if self.inner.manager.contains(&p).await => Some(p),
            Some(p) => {
                tracing::warn!(
                    interaction_id = %id,
                    parent = %p,
                    "parent not loaded, registering as root"
                );
                None
            }
            None => None,
        };
        let stats = interaction.stats;
        let usage = interaction.token_usage.clone();
        let shared = self.inner.manager.add(interaction, parent.as_deref()).await?;
        self.inner.stats.write().await.track(id, stats, usage);
        tracing::info!(
            interaction_id = %id,
            statements = stats.statement_count,
            "interaction loaded"
        );
        Ok(shared)
    }

    /// 删除交互及全部后代：注册表、统计、持久化
    pub async fn delete_interaction(&self, id: &str) -> Result<bool, OrchestratorError> {
        let doomed = self.inner.manager.subtree(id).await;
        if !self.inner.manager.remove(id).await {
            return Ok(false);
        }
        {
            let mut stats = self.inner.stats.write().await;
            for victim in &doomed {
                stats.forget(victim);
            }
        }
        for victim in &doomed {
            if let Err(e) = self.inner.persistence.delete(victim).await {
                tracing::error!(
                    interaction_id = %victim,
                    error = %e,
                    "failed to delete persisted interaction"
                );
                return Err(e.into());
            }
        }
        self.inner.events.emit(OrchestratorEvent::InteractionDeleted {
            interaction_id: id.to_string(),
            removed: doomed,
        });
        Ok(true)
    }

    /// 附加资源：每个资源以新用户消息的 id 作为修订号存储，历史中只写入占位符
    pub async fn attach_resources(
        &self,
        interaction_id: &str,
        attachments: Vec<ResourceAttachment>,
    ) -> Result<String, OrchestratorError> {
        if attachments.is_empty() {
            return Err(OrchestratorError::InvalidInput("no resources to attach".to_string()));
        }
        let shared = self
            .inner
            .manager
            .get(interaction_id)
            .await
            .ok_or_else(|| OrchestratorError::not_found("interaction", interaction_id))?;
        let mut interaction = shared.lock().await;

        let message_id = uuid::Uuid::new_v4().to_string();
        for attachment in &attachments {
            self.inner
                .persistence
                .store_resource_revision(
                    interaction_id,
                    &attachment.uri,
                    &message_id,
                    &attachment.content,
                )
                .await?;
        }
        for attachment in &attachments {
            interaction.add_resource_revision(attachment.revision_metadata(&message_id));
        }
        let parts = attachments.iter().map(|a| resource_placeholder(&a.uri)).collect();
        let stats = interaction.stats;
        interaction.append_message(Message::with_id(message_id.clone(), Role::User, parts, stats));
        tracing::info!(
            interaction_id = %interaction_id,
            count = attachments.len(),
            revision = %message_id,
            "resources attached"
        );

        self.persist(&interaction).await?;
        Ok(message_id)
    }

    /// 移除资源的全部修订及其独立的附加消息
    pub async fn remove_resource(
        &self,
        interaction_id: &str,
        uri: &str,
    ) -> Result<usize, OrchestratorError> {
        let shared = self
            .inner
            .manager
            .get(interaction_id)
            .await
            .ok_or_else(|| OrchestratorError::not_found("interaction", interaction_id))?;
        let mut interaction = shared.lock().await;
        let removed = interaction.remove_resource(uri);
        self.persist(&interaction).await?;
        Ok(removed)
    }

    /// 批量委派：为每个子任务新建代理交互，并发运行后汇总
    pub async fn delegate_tasks(
        &self,
        parent_id: &str,
        tasks: Vec<DelegatedTask>,
    ) -> Result<Vec<DelegationOutcome>, OrchestratorError> {
        if !self.inner.manager.contains(parent_id).await {
            return Err(OrchestratorError::not_found("interaction", parent_id));
        }
        let mut agents = Vec::with_capacity(tasks.len());
        for task in tasks {
            let shared = self.create_agent_interaction(parent_id, &task.title).await?;
            let id = shared.lock().await.id.clone();
            agents.push((id, task));
        }
        tracing::info!(parent = %parent_id, agents = agents.len(), "delegating tasks");

        let max_turns = self.inner.config.delegation.max_turns;
        let runs = agents
            .iter()
            .map(|(id, task)| {
                let this = self.clone();
                async move {
                    match this.run_statement(&task.instructions, id, max_turns, false).await {
                        Ok(result) => DelegationOutcome {
                            title: task.title.clone(),
                            interaction_id: id.clone(),
                            answer: Some(result.answer),
                            error: None,
                            turns: result.stats.statement_turn_count,
                        },
                        Err(e) => {
                            tracing::warn!(agent = %id, error = %e, "delegated task failed");
                            DelegationOutcome {
                                title: task.title.clone(),
                                interaction_id: id.clone(),
                                answer: None,
                                error: Some(e.to_string()),
                                turns: 0,
                            }
                        }
                    }
                }
            })
            .collect();
        let outcomes = self.inner.scheduler.run_batch(runs).await;

        if self.inner.config.delegation.cleanup_completed {
            for (id, _) in &agents {
                if let Err(e) = self.delete_interaction(id).await {
                    tracing::warn!(agent = %id, error = %e, "failed to clean up agent interaction");
                }
            }
        }
        Ok(outcomes)
    }

    pub async fn totals(&self) -> OrchestratorTotals {
        self.inner.stats.read().await.totals().clone()
    }

    pub async fn interaction_stats(&self, id: &str) -> Option<InteractionUsage> {
        self.inner.stats.read().await.get(id).cloned()
    }

    pub(crate) async fn persist(
        &self,
        interaction: &crate::interaction::Interaction,
    ) -> Result<(), OrchestratorError> {
        self.inner.persistence.save(interaction).await.map_err(|e| {
            tracing::error!(
                interaction_id = %interaction.id,
                error = %e,
                "failed to persist interaction"
            );
            self.inner.events.emit(OrchestratorEvent::Error {
                interaction_id: Some(interaction.id.clone()),
                kind: "persistence".to_string(),
                message: e.to_string(),
            });
            OrchestratorError::from(e)
        })
    }
}

#[async_trait]
impl AgentDelegator for Orchestrator {
    async fn delegate_tasks(
        &self,
        parent_id: &str,
        tasks: Vec<DelegatedTask>,
    ) -> Result<Vec<DelegationOutcome>, OrchestratorError> {
        Orchestrator::delegate_tasks(self, parent_id, tasks).await
    }
}
