//! 进程级事件总线
//!
//! 任何地方都可以发布“会话列表需要刷新”，会话列表等视图订阅后重新拉取未读数与排序。

use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEvent {
    /// 某个会话的消息发生了变化
    ConversationsChanged { character_id: String },
}

#[derive(Clone)]
pub struct ConversationListBus {
    tx: broadcast::Sender<ListEvent>,
}

impl Default for ConversationListBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ConversationListBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListEvent> {
        self.tx.subscribe()
    }

    /// 发布事件，返回收到的订阅者数量（没有订阅者时为 0）
    pub fn publish(&self, event: ListEvent) -> usize {
        trace!("[Bus] 发布事件: {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn conversations_changed(&self, character_id: &str) -> usize {
        self.publish(ListEvent::ConversationsChanged {
            character_id: character_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_refresh_signal() {
        let bus = ConversationListBus::default();
        assert_eq!(bus.conversations_changed("c1"), 0);

        let mut rx = bus.subscribe();
        assert_eq!(bus.conversations_changed("c2"), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ListEvent::ConversationsChanged {
                character_id: "c2".into()
            }
        );
    }
}
