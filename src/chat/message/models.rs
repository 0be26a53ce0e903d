//! 消息数据模型

use crate::chat::serialization::{base_id, deserialize_id, is_temp_id, part_index};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 消息类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
}

fn default_swipe_count() -> usize {
    1
}

/// 会话中的单条消息
///
/// `id` 可能是服务器 ID、临时 ID（`temp-` 前缀）或分段 ID（`<baseId>-part-<n>`）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub image_url: Option<String>,
    /// 后续消息附加的简短回应
    #[serde(default)]
    pub reaction: Option<String>,
    /// 仅分段组的最后一段为 true
    #[serde(rename = "isLastPart", default)]
    pub is_last_part: bool,
    /// 当前变体序号（regenerate / swipe）
    #[serde(default)]
    pub swipe_index: usize,
    /// 变体总数
    #[serde(default = "default_swipe_count")]
    pub swipe_count: usize,
}

impl Message {
    /// 构造一条文本消息，时间为当前时刻
    pub fn text(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            message_type: MessageType::Text,
            image_url: None,
            reaction: None,
            is_last_part: false,
            swipe_index: 0,
            swipe_count: 1,
        }
    }

    pub fn is_temporary(&self) -> bool {
        is_temp_id(&self.id)
    }

    pub fn base_id(&self) -> &str {
        base_id(&self.id)
    }

    pub fn part_index(&self) -> Option<usize> {
        part_index(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_server_shape() {
        let json = r#"{
            "id": 42,
            "role": "assistant",
            "content": "hi",
            "created_at": "2024-05-01T10:00:00Z",
            "message_type": "image",
            "image_url": "https://cdn/x.png",
            "isLastPart": true
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.message_type, MessageType::Image);
        assert!(msg.is_last_part);
        assert_eq!(msg.swipe_count, 1);
        assert_eq!(msg.reaction, None);
    }

    #[test]
    fn part_accessors() {
        let msg = Message::text("7-part-1", Role::Assistant, "b");
        assert_eq!(msg.base_id(), "7");
        assert_eq!(msg.part_index(), Some(1));
        assert!(!msg.is_temporary());
    }
}
