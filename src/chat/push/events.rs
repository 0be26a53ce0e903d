//! 推送事件定义
//!
//! 线上格式：`{"type": "<事件名>", "data": {...}}`，每个 data 都带 `characterId`。

use crate::chat::message::Message;
use crate::chat::presence::Mood;
use crate::chat::serialization::deserialize_id;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflinePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseErrorPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoodChangePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
    pub mood: Mood,
    #[serde(default)]
    pub system_message: Option<String>,
}

/// 服务器推送事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage(NewMessagePayload),
    CharacterTyping(TypingPayload),
    CharacterOffline(OfflinePayload),
    AiResponseError(ResponseErrorPayload),
    CharacterUnmatched(UnmatchedPayload),
    MoodChange(MoodChangePayload),
}

/// 事件类型（订阅用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushEventKind {
    NewMessage,
    CharacterTyping,
    CharacterOffline,
    AiResponseError,
    CharacterUnmatched,
    MoodChange,
}

impl PushEvent {
    pub fn kind(&self) -> PushEventKind {
        match self {
            PushEvent::NewMessage(_) => PushEventKind::NewMessage,
            PushEvent::CharacterTyping(_) => PushEventKind::CharacterTyping,
            PushEvent::CharacterOffline(_) => PushEventKind::CharacterOffline,
            PushEvent::AiResponseError(_) => PushEventKind::AiResponseError,
            PushEvent::CharacterUnmatched(_) => PushEventKind::CharacterUnmatched,
            PushEvent::MoodChange(_) => PushEventKind::MoodChange,
        }
    }

    pub fn character_id(&self) -> &str {
        match self {
            PushEvent::NewMessage(p) => &p.character_id,
            PushEvent::CharacterTyping(p) => &p.character_id,
            PushEvent::CharacterOffline(p) => &p.character_id,
            PushEvent::AiResponseError(p) => &p.character_id,
            PushEvent::CharacterUnmatched(p) => &p.character_id,
            PushEvent::MoodChange(p) => &p.character_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_events() {
        let json = r#"{"type": "new_message", "data": {
            "characterId": 5,
            "message": {"id": 42, "role": "assistant", "content": "Hey!", "created_at": "2024-05-01T10:00:00Z"}
        }}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), PushEventKind::NewMessage);
        assert_eq!(event.character_id(), "5");

        let typing: PushEvent =
            serde_json::from_str(r#"{"type": "character_typing", "data": {"characterId": "c1"}}"#)
                .unwrap();
        assert_eq!(typing.kind(), PushEventKind::CharacterTyping);

        let mood: PushEvent = serde_json::from_str(
            r#"{"type": "mood_change", "data": {"characterId": "c1", "mood": "excited", "systemMessage": "She is excited"}}"#,
        )
        .unwrap();
        match mood {
            PushEvent::MoodChange(p) => {
                assert_eq!(p.mood, Mood::Excited);
                assert_eq!(p.system_message.as_deref(), Some("She is excited"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        let result = serde_json::from_str::<PushEvent>(r#"{"type": "billing", "data": {}}"#);
        assert!(result.is_err());
    }
}
