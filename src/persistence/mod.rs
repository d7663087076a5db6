//! 交互持久化
//!
//! InteractionPersistence 是编排器的存储协作者：保存/加载/删除交互，存取资源修订内容。
//! 资源内容以 (交互, uri, 修订) 为键，写入后不可变。存储格式对编排核心不透明。
//! 提供两种实现：MemoryPersistence（测试、无数据目录时）与 FilePersistence（每个交互一个 JSON 文件）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::interaction::{revision_key, Interaction};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait InteractionPersistence: Send + Sync {
    async fn save(&self, interaction: &Interaction) -> Result<(), PersistenceError>;

    /// 不存在时返回 None
    async fn load(&self, id: &str) -> Result<Option<Interaction>, PersistenceError>;

    /// 删除交互及其资源内容；不存在不是错误
    async fn delete(&self, id: &str) -> Result<(), PersistenceError>;

    /// 写入一次资源修订；同一键已存在时保持原内容不变
    async fn store_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError>;

    async fn get_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// 内存存储
#[derive(Default)]
pub struct MemoryPersistence {
    interactions: RwLock<HashMap<String, Interaction>>,
    /// interaction_id -> revision_key -> 内容
    resources: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.interactions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.interactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl InteractionPersistence for MemoryPersistence {
    async fn save(&self, interaction: &Interaction) -> Result<(), PersistenceError> {
        self.interactions
            .write()
            .await
            .insert(interaction.id.clone(), interaction.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Interaction>, PersistenceError> {
        Ok(self.interactions.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        self.interactions.write().await.remove(id);
        self.resources.write().await.remove(id);
        Ok(())
    }

    async fn store_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError> {
        self.resources
            .write()
            .await
            .entry(interaction_id.to_string())
            .or_default()
            .entry(revision_key(uri, revision))
            .or_insert_with(|| content.to_vec());
        Ok(())
    }

    async fn get_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self
            .resources
            .read()
            .await
            .get(interaction_id)
            .and_then(|r| r.get(&revision_key(uri, revision)))
            .cloned())
    }
}

/// JSON 文件存储：`<dir>/<id>.json` 保存交互，`<dir>/<id>.resources.json` 保存资源内容（base64）
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
    /// 资源文件的读-改-写需要串行
    resource_lock: tokio::sync::Mutex<()>,
}

#[derive(Default, Serialize, Deserialize)]
struct ResourceFile {
    revisions: HashMap<String, String>,
}

impl FilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            resource_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn interaction_path(&self, id: &str) -> Result<PathBuf, PersistenceError> {
        Ok(self.dir.join(format!("{}.json", sanitize_id(id)?)))
    }

    fn resources_path(&self, id: &str) -> Result<PathBuf, PersistenceError> {
        Ok(self.dir.join(format!("{}.resources.json", sanitize_id(id)?)))
    }

    async fn read_resources(&self, path: &Path) -> Result<ResourceFile, PersistenceError> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ResourceFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 交互 id 直接作为文件名，拒绝路径分隔符
fn sanitize_id(id: &str) -> Result<&str, PersistenceError> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        return Err(PersistenceError::Backend(format!("invalid interaction id: {:?}", id)));
    }
    Ok(id)
}

async fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl InteractionPersistence for FilePersistence {
    async fn save(&self, interaction: &Interaction) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.interaction_path(&interaction.id)?;
        let data = serde_json::to_string_pretty(interaction)?;
        tokio::fs::write(&path, data).await?;
        tracing::debug!(
            interaction_id = %interaction.id,
            path = %path.display(),
            "interaction saved"
        );
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Interaction>, PersistenceError> {
        let path = self.interaction_path(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        remove_if_exists(&self.interaction_path(id)?).await?;
        let _guard = self.resource_lock.lock().await;
        remove_if_exists(&self.resources_path(id)?).await
    }

    async fn store_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError> {
        let path = self.resources_path(interaction_id)?;
        let _guard = self.resource_lock.lock().await;
        let mut file = self.read_resources(&path).await?;
        let key = revision_key(uri, revision);
        if file.revisions.contains_key(&key) {
            return Ok(());
        }
        file.revisions
            .insert(key, base64::engine::general_purpose::STANDARD.encode(content));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, serde_json::to_string(&file)?).await?;
        Ok(())
    }

    async fn get_resource_revision(
        &self,
        interaction_id: &str,
        uri: &str,
        revision: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.resources_path(interaction_id)?;
        let file = {
            let _guard = self.resource_lock.lock().await;
            self.read_resources(&path).await?
        };
        file.revisions
            .get(&revision_key(uri, revision))
            .map(|encoded| {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| PersistenceError::Backend(format!("corrupt resource blob: {}", e)))
            })
            .transpose()
    }
}

/// 配置了数据目录时使用文件存储，否则使用内存存储
pub fn create_persistence(data_dir: Option<&Path>) -> Arc<dyn InteractionPersistence> {
    match data_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "using file persistence");
            Arc::new(FilePersistence::new(dir))
        }
        None => {
            tracing::info!("no data_dir configured, using in-memory persistence");
            Arc::new(MemoryPersistence::new())
        }
    }
}
