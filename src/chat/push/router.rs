//! 推送事件路由
//!
//! 单一推送通道收到的事件在这里分发：
//! - 在线状态（输入中 / 情绪）先写入进程级 [`PresenceBroadcaster`]，与当前打开哪个会话无关；
//! - 绑定到会话的处理器只会收到该会话角色的事件，其余事件直接丢弃。

use crate::chat::presence::PresenceBroadcaster;
use crate::chat::push::events::{PushEvent, PushEventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

pub type PushHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// 订阅作用域
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// 所有角色的事件
    Global,
    /// 仅某个角色（会话）的事件
    Conversation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: PushEventKind,
    scope: SubscriptionScope,
    handler: PushHandler,
}

pub struct PushRouter {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    presence: Arc<PresenceBroadcaster>,
}

impl PushRouter {
    pub fn new(presence: Arc<PresenceBroadcaster>) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            presence,
        }
    }

    pub fn presence(&self) -> &Arc<PresenceBroadcaster> {
        &self.presence
    }

    pub fn subscribe<F>(&self, kind: PushEventKind, scope: SubscriptionScope, handler: F) -> SubscriptionId
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(Subscription {
                id,
                kind,
                scope,
                handler: Arc::new(handler),
            });
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subs) = self.subscriptions.lock() else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 分发一个事件，返回收到该事件的处理器数量
    pub fn dispatch(&self, event: &PushEvent) -> usize {
        let character_id = event.character_id();
        self.apply_presence(event);

        // 先复制出处理器再调用，处理器内部可以安全地订阅/退订
        let handlers: Vec<PushHandler> = match self.subscriptions.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|s| s.kind == event.kind())
                .filter(|s| match &s.scope {
                    SubscriptionScope::Global => true,
                    SubscriptionScope::Conversation(c) => c == character_id,
                })
                .map(|s| s.handler.clone())
                .collect(),
            Err(_) => Vec::new(),
        };

        if handlers.is_empty() {
            debug!(
                "[Router] 丢弃事件（无匹配的订阅）: kind={:?}, characterId={}",
                event.kind(),
                character_id
            );
            return 0;
        }
        trace!(
            "[Router] 分发事件: kind={:?}, characterId={}, 处理器数={}",
            event.kind(),
            character_id,
            handlers.len()
        );
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn apply_presence(&self, event: &PushEvent) {
        let character_id = event.character_id();
        match event {
            PushEvent::CharacterTyping(_) => self.presence.set_typing(character_id, true),
            PushEvent::NewMessage(_)
            | PushEvent::CharacterOffline(_)
            | PushEvent::AiResponseError(_) => self.presence.set_typing(character_id, false),
            PushEvent::MoodChange(p) => self.presence.set_mood(character_id, p.mood),
            PushEvent::CharacterUnmatched(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{Message, Role};
    use crate::chat::presence::Mood;
    use crate::chat::push::events::{MoodChangePayload, NewMessagePayload, TypingPayload};
    use crate::chat::tasks::TaskRegistry;
    use std::time::Duration;

    fn router() -> PushRouter {
        PushRouter::new(Arc::new(PresenceBroadcaster::new(
            Arc::new(TaskRegistry::new()),
            Duration::from_secs(30),
        )))
    }

    fn new_message(character_id: &str) -> PushEvent {
        PushEvent::NewMessage(NewMessagePayload {
            character_id: character_id.into(),
            message: Message::text("1", Role::Assistant, "hi"),
        })
    }

    #[test]
    fn scoped_handlers_ignore_other_characters() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.subscribe(
            PushEventKind::NewMessage,
            SubscriptionScope::Conversation("a".into()),
            move |e| sink.lock().unwrap().push(e.character_id().to_string()),
        );

        assert_eq!(router.dispatch(&new_message("b")), 0);
        assert_eq!(router.dispatch(&new_message("a")), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn presence_updates_without_any_subscriber() {
        let router = router();
        router.dispatch(&PushEvent::CharacterTyping(TypingPayload {
            character_id: "b".into(),
        }));
        assert!(router.presence().get("b").typing);

        router.dispatch(&new_message("b"));
        assert!(!router.presence().get("b").typing);
    }

    #[tokio::test]
    async fn mood_goes_to_presence_for_background_character() {
        let router = router();
        router.subscribe(
            PushEventKind::MoodChange,
            SubscriptionScope::Conversation("a".into()),
            |_| panic!("事件不应路由到其他会话"),
        );
        router.dispatch(&PushEvent::MoodChange(MoodChangePayload {
            character_id: "b".into(),
            mood: Mood::Happy,
            system_message: None,
        }));
        assert_eq!(router.presence().get("b").mood, Some(Mood::Happy));
        assert_eq!(router.presence().get("a").mood, None);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let router = router();
        let id = router.subscribe(PushEventKind::NewMessage, SubscriptionScope::Global, |_| {});
        assert_eq!(router.dispatch(&new_message("x")), 1);
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        assert_eq!(router.dispatch(&new_message("x")), 0);
        assert_eq!(router.subscription_count(), 0);
    }
}
