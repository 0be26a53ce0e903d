//! 推送通道
//!
//! 长连接、事件定义与事件路由

pub mod connection;
pub mod events;
pub mod router;

pub use connection::{
    ConnectionStatus, PushConnection, PushConnectionConfig, PushConnectionHandle, ReconnectPolicy,
};
pub use events::{PushEvent, PushEventKind};
pub use router::{PushHandler, PushRouter, SubscriptionId, SubscriptionScope};
