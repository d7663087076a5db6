//! 资源修订元数据与资源占位符
//!
//! 资源（文件、URL 等）以 (uri, revision) 为唯一键；revision 为引入该资源的消息 id。
//! 消息历史中只保存占位符 "Resource added: `<uri>`"，真实内容在每次 LLM 调用前由水合引擎展开。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::interaction::ContentPart;

const PLACEHOLDER_PREFIX: &str = "Resource added: ";

/// 支持内联为图片片段的 MIME 类型
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Url,
    Memory,
    Other,
}

/// 某资源某次修订的元数据；内容 blob 以同一键存放于持久化层，写入后不可变
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRevisionMetadata {
    pub uri: String,
    pub revision: String,
    pub size: u64,
    pub resource_type: ResourceType,
    pub mime_type: String,
    pub last_modified: DateTime<Utc>,
    /// 引入该修订的消息 id
    pub message_id: String,
}

impl ResourceRevisionMetadata {
    pub fn key(&self) -> String {
        revision_key(&self.uri, &self.revision)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_supported_image(&self) -> bool {
        SUPPORTED_IMAGE_TYPES.contains(&self.mime_type.as_str())
    }
}

/// (uri, revision) 组合键；revision 为 uuid，不含 '/'
pub fn revision_key(uri: &str, revision: &str) -> String {
    format!("{}/{}", revision, uri)
}

/// 待引入的资源：由用户附加或由工具执行产生
#[derive(Clone, Debug)]
pub struct ResourceAttachment {
    pub uri: String,
    pub resource_type: ResourceType,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ResourceAttachment {
    pub fn text(uri: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            resource_type: ResourceType::File,
            mime_type: "text/plain".to_string(),
            content: content.into().into_bytes(),
            last_modified: None,
        }
    }

    pub fn binary(uri: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            uri: uri.into(),
            resource_type: ResourceType::File,
            mime_type: mime_type.into(),
            content,
            last_modified: None,
        }
    }

    /// 以给定消息 id 作为修订号生成元数据
    pub fn revision_metadata(&self, message_id: &str) -> ResourceRevisionMetadata {
        ResourceRevisionMetadata {
            uri: self.uri.clone(),
            revision: message_id.to_string(),
            size: self.content.len() as u64,
            resource_type: self.resource_type,
            mime_type: self.mime_type.clone(),
            last_modified: self.last_modified.unwrap_or_else(Utc::now),
            message_id: message_id.to_string(),
        }
    }
}

/// 资源占位符片段
pub fn resource_placeholder(uri: &str) -> ContentPart {
    ContentPart::text(format!("{}`{}`", PLACEHOLDER_PREFIX, uri))
}

/// 若文本是资源占位符则返回其 uri
pub fn parse_resource_placeholder(text: &str) -> Option<&str> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^Resource added: `([^`]+)`$").ok())
        .as_ref()?;
    pattern
        .captures(text.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
