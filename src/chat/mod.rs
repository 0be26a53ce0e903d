//! 角色聊天同步引擎
//!
//! 单一推送通道 + HTTP 接口 + 每个会话一份内存消息存储

pub mod api;
pub mod bus;
pub mod client;
pub mod conversation;
pub mod error;
pub mod listener;
pub mod message;
pub mod presence;
pub mod push;
pub mod serialization;
pub mod tasks;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::SyncError;
pub use listener::{ChatListener, EmptyChatListener};
