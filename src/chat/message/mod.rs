//! 消息模块
//!
//! 消息模型与每个会话的内存消息存储

pub mod models;
pub mod store;

// 重新导出主要类型
pub use models::{Message, MessageType, Role};
pub use store::{MessageStore, PageState, StoreSnapshot};
