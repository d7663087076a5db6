//! 交互钩子：system prompt 准备、消息准备、工具准备
//!
//! 对话与聊天的差异只体现在这三个操作上，由 InteractionKind 在构造时选定实现。

use async_trait::async_trait;

use crate::hydration::{
    hydrate_messages, HydratedResources, HydrationWindow, InteractionResources,
};
use crate::interaction::{Interaction, Message};
use crate::persistence::InteractionPersistence;
use crate::tools::ToolDefinition;

#[async_trait]
pub trait InteractionHooks: Send + Sync {
    fn prepare_system_prompt(&self, interaction: &Interaction, base: &str) -> String;

    /// 生成发给 LLM 的消息列表；不修改交互自身的历史
    async fn prepare_messages(
        &self,
        interaction: &Interaction,
        persistence: &dyn InteractionPersistence,
        window: HydrationWindow,
    ) -> Vec<Message>;

    fn prepare_tools(
        &self,
        interaction: &Interaction,
        available: Vec<ToolDefinition>,
    ) -> Vec<ToolDefinition>;
}

/// 完整对话：目标写入 system prompt，资源水合，开放全部工具
pub struct ConversationHooks;

#[async_trait]
impl InteractionHooks for ConversationHooks {
    fn prepare_system_prompt(&self, interaction: &Interaction, base: &str) -> String {
        let objectives = interaction.objectives.to_prompt_section();
        if objectives.is_empty() {
            return base.to_string();
        }
        format!("{}\n\n## Objectives\n{}", base.trim_end(), objectives.trim_end())
    }

    async fn prepare_messages(
        &self,
        interaction: &Interaction,
        persistence: &dyn InteractionPersistence,
        window: HydrationWindow,
    ) -> Vec<Message> {
        let lookup = InteractionResources {
            interaction,
            persistence,
        };
        hydrate_messages(interaction.messages(), &lookup, window, HydratedResources::default())
            .await
            .messages
    }

    fn prepare_tools(
        &self,
        _interaction: &Interaction,
        available: Vec<ToolDefinition>,
    ) -> Vec<ToolDefinition> {
        available
    }
}

/// 轻量聊天：每次请求只携带最近一条用户消息，不提供工具
///
/// 聊天交互承载标题与目标这类一次性辅助调用，历史只作记录，不回放给 LLM。
pub struct ChatHooks;

#[async_trait]
impl InteractionHooks for ChatHooks {
    fn prepare_system_prompt(&self, _interaction: &Interaction, base: &str) -> String {
        base.to_string()
    }

    async fn prepare_messages(
        &self,
        interaction: &Interaction,
        _persistence: &dyn InteractionPersistence,
        _window: HydrationWindow,
    ) -> Vec<Message> {
        interaction
            .messages()
            .iter()
            .rev()
            .find(|m| m.is_user())
            .cloned()
            .into_iter()
            .collect()
    }

    fn prepare_tools(
        &self,
        _interaction: &Interaction,
        _available: Vec<ToolDefinition>,
    ) -> Vec<ToolDefinition> {
        Vec::new()
    }
}
