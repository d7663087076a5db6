//! 交互层：会话容器（对话 / 聊天）、消息、资源修订、目标、钩子与层级注册表
//!
//! Interaction 独占自己的消息历史、统计与资源元数据；跨交互只做只读汇总。

pub mod hooks;
pub mod manager;
pub mod message;
pub mod resource;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::stats::{InteractionStats, ResourceAccessStats, TokenUsage, ToolUsageStats};

pub use hooks::{ChatHooks, ConversationHooks, InteractionHooks};
pub use manager::{InteractionManager, SharedInteraction};
pub use message::{ContentPart, Message, Role};
pub use resource::{
    parse_resource_placeholder, resource_placeholder, revision_key, ResourceAttachment,
    ResourceRevisionMetadata, ResourceType,
};

/// 交互类型：决定三个钩子的行为
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    /// 完整对话：工具、资源水合、目标锚定
    Conversation,
    /// 轻量聊天：无工具，用于标题/目标等辅助调用
    Chat,
}

impl InteractionKind {
    pub fn hooks(&self) -> &'static dyn InteractionHooks {
        match self {
            Self::Conversation => &ConversationHooks,
            Self::Chat => &ChatHooks,
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation => write!(f, "conversation"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

impl FromStr for InteractionKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conversation" => Ok(Self::Conversation),
            "chat" => Ok(Self::Chat),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown interaction kind: {}",
                other
            ))),
        }
    }
}

/// 对话级目标 + 按语句顺序的语句级目标
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objectives {
    pub conversation: Option<String>,
    pub statements: Vec<String>,
}

impl Objectives {
    pub fn current_statement(&self) -> Option<&str> {
        self.statements.last().map(String::as_str)
    }

    /// 进度头中的目标段落
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if let Some(conv) = &self.conversation {
            s.push_str(&format!("Conversation objective: {}\n", conv));
        }
        if let Some(stmt) = self.current_statement() {
            s.push_str(&format!("Statement objective: {}\n", stmt));
        }
        s
    }
}

/// 会话容器
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub kind: InteractionKind,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    messages: Vec<Message>,
    /// 计数缓存（权威值在 StatsAggregator）
    pub stats: InteractionStats,
    pub token_usage: TokenUsage,
    pub objectives: Objectives,
    /// revision_key(uri, revision) -> 元数据
    resources: BTreeMap<String, ResourceRevisionMetadata>,
    pub tool_usage: ToolUsageStats,
    pub resource_access: ResourceAccessStats,
    /// 辅助调用（标题、目标）使用的聊天子交互
    #[serde(default)]
    pub chat_interaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(id: impl Into<String>, kind: InteractionKind, parent_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            parent_id,
            title: None,
            messages: Vec::new(),
            stats: InteractionStats::default(),
            token_usage: TokenUsage::default(),
            objectives: Objectives::default(),
            resources: BTreeMap::new(),
            tool_usage: ToolUsageStats::default(),
            resource_access: ResourceAccessStats::default(),
            chat_interaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// 从未处理过语句且没有标题：首条语句需要生成标题
    pub fn is_fresh(&self) -> bool {
        self.stats.statement_count == 0 && self.title.is_none()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn append_message(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// 最近一条助手消息的文本（用于语句级目标生成）
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(Message::text)
            .filter(|t| !t.trim().is_empty())
    }

    pub fn add_resource_revision(&mut self, metadata: ResourceRevisionMetadata) {
        self.resource_access.record(&metadata.uri);
        self.resources.insert(metadata.key(), metadata);
    }

    pub fn resource_revision(
        &self,
        uri: &str,
        revision: &str,
    ) -> Option<&ResourceRevisionMetadata> {
        self.resources.get(&revision_key(uri, revision))
    }

    /// 移除资源：删除该 uri 的全部修订元数据，并删掉仅由该资源占位符组成的用户消息。
    /// 返回被删除的消息数。这是消息历史只追加规则的唯一例外。
    pub fn remove_resource(&mut self, uri: &str) -> usize {
        self.resources.retain(|_, meta| meta.uri != uri);
        let before = self.messages.len();
        self.messages.retain(|m| {
            let only_this_resource = m.is_user()
                && !m.content.is_empty()
                && m.content.iter().all(|part| {
                    part.as_text().and_then(parse_resource_placeholder) == Some(uri)
                });
            !only_this_resource
        });
        let removed = before - self.messages.len();
        if removed > 0 {
            self.updated_at = Utc::now();
        }
        removed
    }
}
