//! 聊天回调接口
//!
//! 由调用方注册，用于接收需要展示给用户的提示（可关闭的错误横幅、解除匹配通知、连接状态）。

use async_trait::async_trait;

#[async_trait]
pub trait ChatListener: Send + Sync {
    /// 可恢复错误（发送失败、加载失败、生成失败等），由界面以可关闭的提示展示
    async fn on_error(&self, character_id: String, error: String);

    /// 角色解除匹配，与当前打开的会话无关
    async fn on_character_unmatched(&self, character_id: String, reason: Option<String>);

    /// 推送连接状态变化
    async fn on_connection_status_changed(&self, connected: bool, message: String);
}

/// 空实现（默认监听器）
pub struct EmptyChatListener;

#[async_trait]
impl ChatListener for EmptyChatListener {
    async fn on_error(&self, _character_id: String, _error: String) {}
    async fn on_character_unmatched(&self, _character_id: String, _reason: Option<String>) {}
    async fn on_connection_status_changed(&self, _connected: bool, _message: String) {}
}
