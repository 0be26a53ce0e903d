//! 会话视图模块
//!
//! 每个打开的会话一个 [`ConversationSession`]：乐观发送、逐段展示、历史分页、消息操作与草稿

pub mod actions;
pub mod drafts;
pub mod pagination;
pub mod reveal;
pub mod session;

pub use actions::{ActionReconciler, DeleteTarget};
pub use drafts::DraftCache;
pub use pagination::{AutoScroll, ScrollAnchor, Viewport};
pub use reveal::{split_segments, RevealScheduler};
pub use session::{
    ConversationSession, OutgoingMessage, SendOutcome, SessionConfig, SessionStatus,
};
