//! 上下文水合：每次 LLM 调用前重写消息历史
//!
//! 历史中只保存 "Resource added: `<uri>`" 占位符。水合时自新到旧遍历消息，
//! 每个资源最近的 window 次出现展开为 [元数据块, 内容块]，更早的出现压缩为
//! "截至第 N 回合 / 修订 R 已是最新" 的说明 + 元数据块，保证资源内容在上下文中有界。
//!
//! "最近已水合" 表只在一次调用内有效：按值传入、开头清空、按值返回，不存在于任何实例上。

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::future::{BoxFuture, FutureExt};

use crate::core::OrchestratorError;
use crate::interaction::{
    parse_resource_placeholder, ContentPart, Interaction, Message, ResourceRevisionMetadata,
};
use crate::persistence::{InteractionPersistence, PersistenceError};

/// 默认窗口：每个资源最多保留 2 次完整内容
pub const DEFAULT_WINDOW: usize = 2;

/// 每资源的完整内容窗口，必须为正整数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HydrationWindow(usize);

impl HydrationWindow {
    pub fn new(size: usize) -> Result<Self, OrchestratorError> {
        if size == 0 {
            return Err(OrchestratorError::InvalidInput(
                "hydration window must be a positive integer".to_string(),
            ));
        }
        Ok(Self(size))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for HydrationWindow {
    fn default() -> Self {
        Self(DEFAULT_WINDOW)
    }
}

impl TryFrom<i64> for HydrationWindow {
    type Error = OrchestratorError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 {
            return Err(OrchestratorError::InvalidInput(format!(
                "hydration window must be a positive integer, got {}",
                value
            )));
        }
        Self::new(value as usize)
    }
}

impl TryFrom<f64> for HydrationWindow {
    type Error = OrchestratorError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(OrchestratorError::InvalidInput(format!(
                "hydration window must be a positive integer, got {}",
                value
            )));
        }
        Self::try_from(value as i64)
    }
}

/// 某资源的一次完整水合
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HydrationRecord {
    pub turn_index: usize,
    pub revision: String,
}

/// 本次水合中每个资源已展开的位置（最新在前，长度不超过窗口）
#[derive(Clone, Debug, Default)]
pub struct HydratedResources {
    entries: HashMap<String, VecDeque<HydrationRecord>>,
}

impl HydratedResources {
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn count(&self, uri: &str) -> usize {
        self.entries.get(uri).map_or(0, VecDeque::len)
    }

    pub fn latest(&self, uri: &str) -> Option<&HydrationRecord> {
        self.entries.get(uri).and_then(|e| e.front())
    }

    pub fn records(&self, uri: &str) -> Vec<HydrationRecord> {
        self.entries
            .get(uri)
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 自新到旧遍历时调用：追加到尾部即保持 "最新在前"，超出窗口的被截掉
    fn record(&mut self, uri: &str, record: HydrationRecord, window: HydrationWindow) {
        let entry = self.entries.entry(uri.to_string()).or_default();
        entry.push_back(record);
        entry.truncate(window.get());
    }
}

/// 水合所需的资源查询
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    fn metadata(&self, uri: &str, revision: &str) -> Option<ResourceRevisionMetadata>;

    async fn content(
        &self,
        metadata: &ResourceRevisionMetadata,
    ) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// 以交互的修订表 + 持久化层作为资源来源
pub struct InteractionResources<'a> {
    pub interaction: &'a Interaction,
    pub persistence: &'a dyn InteractionPersistence,
}

#[async_trait]
impl ResourceLookup for InteractionResources<'_> {
    fn metadata(&self, uri: &str, revision: &str) -> Option<ResourceRevisionMetadata> {
        self.interaction.resource_revision(uri, revision).cloned()
    }

    async fn content(
        &self,
        metadata: &ResourceRevisionMetadata,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.persistence
            .get_resource_revision(&self.interaction.id, &metadata.uri, &metadata.revision)
            .await
    }
}

/// 一次水合的结果
#[derive(Debug)]
pub struct HydrationPass {
    pub messages: Vec<Message>,
    pub hydrated: HydratedResources,
}

/// 对消息历史做一次水合；输入不被修改，输出消息数与输入相同（片段可能展开为多个）
pub async fn hydrate_messages(
    messages: &[Message],
    lookup: &dyn ResourceLookup,
    window: HydrationWindow,
    mut hydrated: HydratedResources,
) -> HydrationPass {
    hydrated.reset();
    let mut out = Vec::with_capacity(messages.len());

    for (turn_index, message) in messages.iter().enumerate().rev() {
        if !message.is_user() {
            out.push(message.clone());
            continue;
        }
        let mut pass = PartPass {
            lookup,
            window,
            hydrated: &mut hydrated,
            turn_index,
            revision: &message.id,
        };
        let content = pass.hydrate_parts(&message.content).await;
        out.push(Message {
            content,
            ..message.clone()
        });
    }

    out.reverse();
    HydrationPass {
        messages: out,
        hydrated,
    }
}

struct PartPass<'a> {
    lookup: &'a dyn ResourceLookup,
    window: HydrationWindow,
    hydrated: &'a mut HydratedResources,
    turn_index: usize,
    revision: &'a str,
}

impl<'a> PartPass<'a> {
    fn hydrate_parts<'b>(&'b mut self, parts: &'b [ContentPart]) -> BoxFuture<'b, Vec<ContentPart>>
    where
        'a: 'b,
    {
        async move {
            let mut out = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ContentPart::Text { text } => match parse_resource_placeholder(text) {
                        Some(uri) => out.extend(self.expand(uri, part).await),
                        None => out.push(part.clone()),
                    },
                    ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let content = self.hydrate_parts(content).await;
                        out.push(ContentPart::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content,
                            is_error: *is_error,
                        });
                    }
                    other => out.push(other.clone()),
                }
            }
            out
        }
        .boxed()
    }

    async fn expand(&mut self, uri: &str, original: &ContentPart) -> Vec<ContentPart> {
        let Some(meta) = self.lookup.metadata(uri, self.revision) else {
            tracing::warn!(
                uri = %uri,
                revision = %self.revision,
                "no revision metadata for resource placeholder"
            );
            return vec![original.clone()];
        };

        if self.hydrated.count(uri) >= self.window.get() {
            let note = match self.hydrated.latest(uri) {
                Some(latest) => format!(
                    "Note: Resource `{}` is up to date as of turn {} (revision {}). \
                     Its current content is shown there.",
                    uri, latest.turn_index, latest.revision
                ),
                None => format!("Note: Resource `{}` is shown in a later turn.", uri),
            };
            return vec![ContentPart::text(note), metadata_block(&meta)];
        }

        let content = self.content_block(&meta).await;
        self.hydrated.record(
            uri,
            HydrationRecord {
                turn_index: self.turn_index,
                revision: meta.revision.clone(),
            },
            self.window,
        );
        vec![metadata_block(&meta), content]
    }

    async fn content_block(&self, meta: &ResourceRevisionMetadata) -> ContentPart {
        if meta.is_image() && !meta.is_supported_image() {
            tracing::warn!(
                uri = %meta.uri,
                mime = %meta.mime_type,
                "unsupported image type, sending metadata only"
            );
            return ContentPart::text(format!(
                "Warning: image type {} is not supported; only metadata is available for `{}`.",
                meta.mime_type, meta.uri
            ));
        }
        let bytes = match self.lookup.content(meta).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(
                    uri = %meta.uri,
                    revision = %meta.revision,
                    "resource content missing"
                );
                return ContentPart::text(format!(
                    "Warning: content for `{}` is unavailable.",
                    meta.uri
                ));
            }
            Err(e) => {
                tracing::warn!(uri = %meta.uri, error = %e, "failed to load resource content");
                return ContentPart::text(format!(
                    "Warning: content for `{}` could not be loaded: {}",
                    meta.uri, e
                ));
            }
        };
        if meta.is_image() {
            return ContentPart::Image {
                media_type: meta.mime_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            };
        }
        match String::from_utf8(bytes) {
            Ok(text) => ContentPart::text(text),
            Err(_) => ContentPart::text(format!(
                "[binary resource `{}`: {} bytes, {}]",
                meta.uri, meta.size, meta.mime_type
            )),
        }
    }
}

fn metadata_block(meta: &ResourceRevisionMetadata) -> ContentPart {
    let json = serde_json::json!({
        "uri": meta.uri,
        "revision": meta.revision,
        "size": meta.size,
        "type": meta.resource_type,
        "mime_type": meta.mime_type,
        "last_modified": meta.last_modified.to_rfc3339(),
    });
    let body = serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string());
    ContentPart::text(format!("---resource-metadata---\n{}\n---", body))
}
