pub mod chat;

// 重新导出常用类型，方便外部使用
pub use chat::{
    api::{ChatApi, HttpChatApi},
    bus::{ConversationListBus, ListEvent},
    client::{ChatClient, ClientConfig},
    conversation::{
        AutoScroll, ConversationSession, DeleteTarget, OutgoingMessage, ScrollAnchor, SendOutcome,
        SessionStatus, Viewport,
    },
    listener::{ChatListener, EmptyChatListener},
    message::{Message, MessageType, Role, StoreSnapshot},
    presence::{Mood, PresenceState},
    push::{ConnectionStatus, PushEvent, ReconnectPolicy},
    SyncError,
};
