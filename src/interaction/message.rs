//! 消息模型：角色、内容片段、创建时的统计快照
//!
//! 消息一旦创建即不可变；工具调用与工具结果作为内容片段嵌入消息，
//! 工具结果可嵌套内容数组（其中可能再次出现资源占位符）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::InteractionStats;

/// 消息角色（与 LLM API 一致；system prompt 单独传递，不入历史）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 单个内容片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// base64 编码的图片
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentPart>,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// 创建时交互计数器的快照
    pub stats: InteractionStats,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>, stats: InteractionStats) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), role, content, stats)
    }

    /// 使用预先分配的 id（资源修订号需要在消息创建前确定）
    pub fn with_id(
        id: impl Into<String>,
        role: Role,
        content: Vec<ContentPart>,
        stats: InteractionStats,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            stats,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: Vec<ContentPart>, stats: InteractionStats) -> Self {
        Self::new(Role::User, content, stats)
    }

    pub fn assistant(content: Vec<ContentPart>, stats: InteractionStats) -> Self {
        Self::new(Role::Assistant, content, stats)
    }

    /// 所有顶层文本片段拼接
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_part_serde_shape() {
        let part = ContentPart::ToolResult {
            tool_use_id: "t1".to_string(),
            content: vec![ContentPart::text("ok")],
            is_error: false,
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["content"][0]["type"], "text");
    }

    #[test]
    fn test_message_text_joins_text_parts_only() {
        let msg = Message::assistant(
            vec![
                ContentPart::text("first"),
                ContentPart::ToolUse {
                    id: "t1".to_string(),
                    name: "echo".to_string(),
                    input: serde_json::json!({}),
                },
                ContentPart::text("second"),
            ],
            InteractionStats::default(),
        );
        assert_eq!(msg.text(), "first\nsecond");
        assert!(!msg.is_user());
    }
}
