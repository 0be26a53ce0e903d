//! 角色在线状态（正在输入 / 情绪效果）
//!
//! 进程级共享，不属于任何一个会话视图：侧边栏需要在会话未打开时也显示角色状态。
//! 只有推送路由器会修改它，视图只读。

use crate::chat::tasks::TaskRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// 情绪 / 背景效果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Sad,
    Angry,
    Excited,
    Flirty,
    Shy,
    Calm,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceState {
    pub typing: bool,
    pub mood: Option<Mood>,
}

pub type PresenceMap = HashMap<String, PresenceState>;

pub struct PresenceBroadcaster {
    tx: watch::Sender<PresenceMap>,
    tasks: Arc<TaskRegistry>,
    mood_ttl: Duration,
}

impl PresenceBroadcaster {
    pub fn new(tasks: Arc<TaskRegistry>, mood_ttl: Duration) -> Self {
        Self {
            tx: watch::Sender::new(PresenceMap::new()),
            tasks,
            mood_ttl,
        }
    }

    pub fn get(&self, character_id: &str) -> PresenceState {
        self.tx
            .borrow()
            .get(character_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceMap> {
        self.tx.subscribe()
    }

    pub(crate) fn set_typing(&self, character_id: &str, typing: bool) {
        self.update(character_id, |state| {
            let changed = state.typing != typing;
            state.typing = typing;
            changed
        });
    }

    /// 设置情绪效果，`mood_ttl` 后自动清除；新情绪会替换旧的清除定时器
    pub(crate) fn set_mood(self: &Arc<Self>, character_id: &str, mood: Mood) {
        let key = Self::timer_key(character_id);
        self.tasks.cancel_all(&key);
        self.update(character_id, |state| {
            let changed = state.mood != Some(mood);
            state.mood = Some(mood);
            changed
        });

        let weak = Arc::downgrade(self);
        let character_id = character_id.to_string();
        self.tasks.spawn_after(&key, self.mood_ttl, async move {
            if let Some(presence) = weak.upgrade() {
                debug!("[Presence] 情绪效果过期: characterId={}", character_id);
                presence.clear_mood_state(&character_id);
            }
        });
    }

    /// 立即清除情绪效果并撤销其清除定时器（离开会话时）
    pub(crate) fn expire_mood(&self, character_id: &str) {
        self.tasks.cancel_all(&Self::timer_key(character_id));
        self.clear_mood_state(character_id);
    }

    fn clear_mood_state(&self, character_id: &str) {
        self.update(character_id, |state| state.mood.take().is_some());
    }

    fn update(&self, character_id: &str, f: impl FnOnce(&mut PresenceState) -> bool) {
        self.tx.send_if_modified(|map| {
            let state = map.entry(character_id.to_string()).or_default();
            f(state)
        });
    }

    fn timer_key(character_id: &str) -> String {
        format!("presence:{}", character_id)
    }
}
