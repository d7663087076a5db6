//! 交互注册表：所有在线交互 + 父子层级
//!
//! 层级以显式的 child -> parent 边表保存（不在交互内部嵌入父引用），
//! 级联删除与后代遍历都用显式工作栈完成，深层委派链不会压深调用栈。
//! 注册表与边表放在同一把锁下，所有修改操作相互串行。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::core::OrchestratorError;
use crate::interaction::{Interaction, InteractionKind};

/// 注册表中共享的交互句柄；语句执行期间由编排器独占加锁
pub type SharedInteraction = Arc<Mutex<Interaction>>;

#[derive(Default)]
struct Registry {
    interactions: HashMap<String, SharedInteraction>,
    /// child_id -> parent_id
    parents: HashMap<String, String>,
}

impl Registry {
    fn children_of(&self, id: &str) -> Vec<String> {
        let mut children: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, parent)| parent.as_str() == id)
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        children
    }

    fn descendants_of(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = self.children_of(id);
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            stack.extend(self.children_of(&next));
            out.push(next);
        }
        out
    }

    fn require(&self, id: &str) -> Result<(), OrchestratorError> {
        if self.interactions.contains_key(id) {
            Ok(())
        } else {
            Err(OrchestratorError::not_found("interaction", id))
        }
    }

    /// 设置父节点；拒绝会形成环的边，保持森林结构
    fn link(&mut self, child_id: &str, parent_id: &str) -> Result<(), OrchestratorError> {
        self.require(child_id)?;
        self.require(parent_id)?;
        if child_id == parent_id || self.descendants_of(child_id).iter().any(|d| d == parent_id) {
            return Err(OrchestratorError::InvalidInput(format!(
                "moving {} under {} would create a cycle",
                child_id, parent_id
            )));
        }
        self.parents.insert(child_id.to_string(), parent_id.to_string());
        Ok(())
    }
}

/// 交互注册表
#[derive(Default)]
pub struct InteractionManager {
    registry: RwLock<Registry>,
}

impl InteractionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按类型构造并注册新交互；给定 parent_id 时记录层级边
    pub async fn create(
        &self,
        kind: InteractionKind,
        id: &str,
        parent_id: Option<&str>,
    ) -> Result<SharedInteraction, OrchestratorError> {
        let interaction = Interaction::new(id, kind, parent_id.map(String::from));
        self.add(interaction, parent_id).await
    }

    /// 按类型名构造（未知类型返回 InvalidInput）
    pub async fn create_by_name(
        &self,
        kind: &str,
        id: &str,
        parent_id: Option<&str>,
    ) -> Result<SharedInteraction, OrchestratorError> {
        let kind: InteractionKind = kind.parse()?;
        self.create(kind, id, parent_id).await
    }

    /// 注册一个已构造好的交互（例如从持久化层加载的）
    pub async fn add(
        &self,
        mut interaction: Interaction,
        parent_id: Option<&str>,
    ) -> Result<SharedInteraction, OrchestratorError> {
        let mut registry = self.registry.write().await;
        let id = interaction.id.clone();
        if registry.interactions.contains_key(&id) {
            return Err(OrchestratorError::InvalidInput(format!(
                "interaction already registered: {}",
                id
            )));
        }
        // 记录上的 parent_id 与边表保持一致
        match parent_id {
            Some(parent) => {
                registry.require(parent)?;
                interaction.parent_id = Some(parent.to_string());
            }
            None => interaction.parent_id = None,
        }
        let kind = interaction.kind;
        let shared = Arc::new(Mutex::new(interaction));
        registry.interactions.insert(id.clone(), shared.clone());
        if let Some(parent) = parent_id {
            registry.parents.insert(id.clone(), parent.to_string());
        }
        tracing::debug!(
            interaction_id = %id,
            kind = %kind,
            parent = ?parent_id,
            "interaction registered"
        );
        Ok(shared)
    }

    /// 查找交互；未命中不是错误，只记录日志
    pub async fn get(&self, id: &str) -> Option<SharedInteraction> {
        let found = self.registry.read().await.interactions.get(id).cloned();
        if found.is_none() {
            tracing::debug!(interaction_id = %id, "interaction not found");
        }
        found
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.registry.read().await.interactions.contains_key(id)
    }

    /// 删除交互及其全部后代；返回根节点是否存在
    pub async fn remove(&self, id: &str) -> bool {
        let mut registry = self.registry.write().await;
        if !registry.interactions.contains_key(id) {
            tracing::debug!(interaction_id = %id, "remove: interaction not found");
            return false;
        }
        let mut doomed = registry.descendants_of(id);
        doomed.push(id.to_string());
        for victim in &doomed {
            registry.interactions.remove(victim);
            registry.parents.remove(victim);
        }
        tracing::info!(interaction_id = %id, removed = doomed.len(), "interaction removed");
        true
    }

    /// 删除前预览将被移除的 id（根 + 后代）
    pub async fn subtree(&self, id: &str) -> Vec<String> {
        let registry = self.registry.read().await;
        if !registry.interactions.contains_key(id) {
            return Vec::new();
        }
        let mut ids = vec![id.to_string()];
        ids.extend(registry.descendants_of(id));
        ids
    }

    pub async fn children(&self, id: &str) -> Vec<String> {
        self.registry.read().await.children_of(id)
    }

    pub async fn descendants(&self, id: &str) -> Vec<String> {
        self.registry.read().await.descendants_of(id)
    }

    pub async fn parent(&self, id: &str) -> Option<String> {
        self.registry.read().await.parents.get(id).cloned()
    }

    pub async fn set_parent(
        &self,
        child_id: &str,
        parent_id: &str,
    ) -> Result<(), OrchestratorError> {
        let shared = {
            let mut registry = self.registry.write().await;
            registry.link(child_id, parent_id)?;
            registry.interactions.get(child_id).cloned()
        };
        // 注册表锁释放后再锁交互，避免与执行中的语句互等
        if let Some(shared) = shared {
            shared.lock().await.parent_id = Some(parent_id.to_string());
        }
        Ok(())
    }

    /// 移动到新父节点；new_parent_id 为 None 时成为根节点
    pub async fn move_interaction(
        &self,
        id: &str,
        new_parent_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        match new_parent_id {
            Some(parent) => self.set_parent(id, parent).await,
            None => {
                let shared = {
                    let mut registry = self.registry.write().await;
                    registry.require(id)?;
                    registry.parents.remove(id);
                    registry.interactions.get(id).cloned()
                };
                if let Some(shared) = shared {
                    shared.lock().await.parent_id = None;
                }
                Ok(())
            }
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .read()
            .await
            .interactions
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.interactions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tree() -> InteractionManager {
        // root -> a -> a1 -> a11 ; root -> b ; other
        let m = InteractionManager::new();
        m.create(InteractionKind::Conversation, "root", None).await.unwrap();
        m.create(InteractionKind::Conversation, "a", Some("root")).await.unwrap();
        m.create(InteractionKind::Conversation, "a1", Some("a")).await.unwrap();
        m.create(InteractionKind::Chat, "a11", Some("a1")).await.unwrap();
        m.create(InteractionKind::Chat, "b", Some("root")).await.unwrap();
        m.create(InteractionKind::Conversation, "other", None).await.unwrap();
        m
    }

    #[tokio::test]
    async fn test_get_unregistered_is_none() {
        let m = InteractionManager::new();
        assert!(m.get("missing").await.is_none());
        assert!(!m.remove("missing").await);
    }

    #[tokio::test]
    async fn test_create_with_unknown_parent_fails() {
        let m = InteractionManager::new();
        let err = m
            .create(InteractionKind::Chat, "c", Some("nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
        assert!(m.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_by_unknown_kind_fails() {
        let m = InteractionManager::new();
        let err = m.create_by_name("workspace", "c", None).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_children_and_descendants() {
        let m = tree().await;
        assert_eq!(m.children("root").await, vec!["a".to_string(), "b".to_string()]);
        let mut desc = m.descendants("root").await;
        desc.sort();
        assert_eq!(desc, vec!["a", "a1", "a11", "b"]);
        assert_eq!(m.parent("a11").await.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_remove_cascades_to_descendants_only() {
        let m = tree().await;
        let before: HashSet<String> = m.ids().await.into_iter().collect();
        let mut gone: HashSet<String> = m.descendants("a").await.into_iter().collect();
        gone.insert("a".to_string());

        assert!(m.remove("a").await);

        let after: HashSet<String> = m.ids().await.into_iter().collect();
        let expected: HashSet<String> = before.difference(&gone).cloned().collect();
        assert_eq!(after, expected);
        assert_eq!(m.children("root").await, vec!["b".to_string()]);
        assert!(m.parent("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_deep_chain() {
        let m = InteractionManager::new();
        m.create(InteractionKind::Conversation, "n0", None).await.unwrap();
        for i in 1..2000 {
            let parent = format!("n{}", i - 1);
            m.create(InteractionKind::Conversation, &format!("n{}", i), Some(&parent))
                .await
                .unwrap();
        }
        assert!(m.remove("n0").await);
        assert!(m.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_parent_requires_both_endpoints() {
        let m = tree().await;
        assert!(m.set_parent("other", "missing").await.is_err());
        assert!(m.set_parent("missing", "root").await.is_err());

        m.set_parent("other", "b").await.unwrap();
        assert_eq!(m.parent("other").await.as_deref(), Some("b"));
        let other = m.get("other").await.unwrap();
        assert_eq!(other.lock().await.parent_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_move_rejects_cycles_and_detaches() {
        let m = tree().await;
        let err = m.move_interaction("a", Some("a11")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        m.move_interaction("a1", Some("b")).await.unwrap();
        assert_eq!(m.children("b").await, vec!["a1".to_string()]);

        m.move_interaction("a1", None).await.unwrap();
        assert!(m.parent("a1").await.is_none());
        assert_eq!(m.descendants("a1").await, vec!["a11".to_string()]);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let m = tree().await;
        let dup = Interaction::new("a", InteractionKind::Chat, None);
        assert!(m.add(dup, None).await.is_err());
    }

    #[tokio::test]
    async fn test_add_as_root_clears_stale_parent() {
        let m = InteractionManager::new();
        let orphan = Interaction::new(
            "orphan",
            InteractionKind::Conversation,
            Some("gone".to_string()),
        );
        let shared = m.add(orphan, None).await.unwrap();
        assert!(shared.lock().await.parent_id.is_none());
        assert!(m.parent("orphan").await.is_none());
    }
}
