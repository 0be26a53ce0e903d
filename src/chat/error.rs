//! 客户端同步错误
//!
//! I/O 类错误统一走 `anyhow`；这里只列出客户端自己判定的错误，调用方可通过
//! `anyhow::Error::downcast_ref::<SyncError>()` 区分。

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// 已有发送在进行中（或正在逐段展示回复），本次发送被拒绝
    #[error("已有消息正在发送")]
    SendInProgress,

    /// 已有历史加载在进行中
    #[error("正在加载更早的消息")]
    LoadInProgress,

    /// 首次加载时会话或角色不存在
    #[error("会话不存在: characterId={0}")]
    ConversationNotFound(String),

    #[error("消息不存在: {0}")]
    MessageNotFound(String),

    /// 临时消息尚未被服务器确认，不能对其执行操作
    #[error("消息尚未持久化: {0}")]
    NotPersisted(String),

    /// 会话视图已关闭
    #[error("会话已关闭: characterId={0}")]
    SessionClosed(String),
}
