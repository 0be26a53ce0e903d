//! 消息操作：编辑、删除、重新生成、切换变体
//!
//! 先持久化，成功后再改内存存储；分段消息一律按 base id 寻址。每个成功的操作都会在
//! 事件总线上发布“会话列表需要刷新”。
//!
//! 回复逐段展示期间拒绝所有操作：未到期的分段会在操作之后继续追加，
//! 截断或合并后的结果会被旧回复的剩余分段打乱。

use crate::chat::api::ChatApi;
use crate::chat::bus::ConversationListBus;
use crate::chat::error::SyncError;
use crate::chat::message::{Message, MessageStore};
use crate::chat::serialization::{base_id, is_local_id, is_temp_id};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// 删除目标：按位置或按 ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    Index(usize),
    Id(String),
}

impl From<usize> for DeleteTarget {
    fn from(index: usize) -> Self {
        DeleteTarget::Index(index)
    }
}

impl From<&str> for DeleteTarget {
    fn from(id: &str) -> Self {
        DeleteTarget::Id(id.to_string())
    }
}

impl From<String> for DeleteTarget {
    fn from(id: String) -> Self {
        DeleteTarget::Id(id)
    }
}

pub struct ActionReconciler {
    character_id: String,
    api: Arc<dyn ChatApi>,
    store: Arc<MessageStore>,
    bus: ConversationListBus,
    displaying: watch::Receiver<bool>,
}

impl ActionReconciler {
    pub fn new(
        character_id: String,
        api: Arc<dyn ChatApi>,
        store: Arc<MessageStore>,
        bus: ConversationListBus,
        displaying: watch::Receiver<bool>,
    ) -> Self {
        Self {
            character_id,
            api,
            store,
            bus,
            displaying,
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if *self.displaying.borrow() {
            warn!("[Actions] 回复展示中，操作被拒绝");
            return Err(SyncError::SendInProgress.into());
        }
        Ok(())
    }

    /// 解析为可持久化的 base id，并确认消息在当前存储中
    fn resolve(&self, id: &str) -> Result<String> {
        let base = base_id(id).to_string();
        if is_temp_id(&base) || is_local_id(&base) {
            return Err(SyncError::NotPersisted(id.to_string()).into());
        }
        if self.store.group_range(&base).is_none() {
            return Err(SyncError::MessageNotFound(id.to_string()).into());
        }
        Ok(base)
    }

    /// 编辑消息；分段消息的所有分段都更新为新内容
    pub async fn edit(&self, id: &str, content: &str) -> Result<()> {
        self.ensure_idle()?;
        let base = self.resolve(id)?;
        self.api.edit_message(&base, content).await?;
        let updated = self.store.update_group_content(&base, content);
        info!(
            "[Actions] ✏️ 编辑消息: baseId={}, 更新分段数={}",
            base, updated
        );
        self.bus.conversations_changed(&self.character_id);
        Ok(())
    }

    /// 删除目标消息及其之后的全部消息
    ///
    /// `confirm` 返回 false 时不发请求，返回 `Ok(false)`。
    pub async fn delete_from(
        &self,
        target: DeleteTarget,
        confirm: impl FnOnce(&Message) -> bool + Send,
    ) -> Result<bool> {
        self.ensure_idle()?;
        let message = match &target {
            DeleteTarget::Index(index) => self.store.get_at(*index),
            DeleteTarget::Id(id) => self.store.get(id),
        }
        .ok_or_else(|| SyncError::MessageNotFound(format!("{:?}", target)))?;

        let base = self.resolve(&message.id)?;
        if !confirm(&message) {
            info!("[Actions] 用户取消删除: id={}", message.id);
            return Ok(false);
        }

        self.api.delete_from(&base).await?;

        // 请求期间存储可能有变化，按 base id 重新定位；分段组从第一段开始截断
        match self.store.group_range(&base) {
            Some(range) => {
                let removed = self.store.remove_from(range.start);
                info!(
                    "[Actions] 🗑️ 删除消息: baseId={}, 本地截断 {} 条",
                    base, removed
                );
            }
            None => warn!("[Actions] ⚠️ 删除成功但本地已无该消息: baseId={}", base),
        }
        self.bus.conversations_changed(&self.character_id);
        Ok(true)
    }

    /// 重新生成某条消息，新变体原位合并
    pub async fn regenerate(&self, id: &str) -> Result<Message> {
        self.ensure_idle()?;
        let base = self.resolve(id)?;
        let variant = self.api.regenerate_message(&base).await?;
        self.merge(&base, variant)
    }

    /// 切换到指定变体，原位合并
    pub async fn swipe(&self, id: &str, swipe_index: usize) -> Result<Message> {
        self.ensure_idle()?;
        let base = self.resolve(id)?;
        let variant = self.api.swipe_message(&base, swipe_index).await?;
        self.merge(&base, variant)
    }

    fn merge(&self, base: &str, variant: Message) -> Result<Message> {
        if !self.store.merge_variant(base, &variant) {
            return Err(SyncError::MessageNotFound(base.to_string()).into());
        }
        info!(
            "[Actions] 🔁 合并变体: baseId={}, swipe={}/{}",
            base, variant.swipe_index, variant.swipe_count
        );
        self.bus.conversations_changed(&self.character_id);
        Ok(variant)
    }
}
