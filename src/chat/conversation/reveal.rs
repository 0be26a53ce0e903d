//! 助手回复逐段展示
//!
//! 多行回复按换行拆成若干段，每段间隔固定时间追加，ID 为 `<baseId>-part-<n>`，
//! 只有最后一段 `is_last_part = true`。所有定时器登记在会话的任务组下，离开会话时统一取消。
//! 展示过程中 `displaying` 为 true，发送流水线据此拒绝新的发送。

use crate::chat::message::{Message, MessageStore, MessageType, Role};
use crate::chat::serialization::part_id;
use crate::chat::tasks::TaskRegistry;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// 按换行拆分，去掉首尾空白和空段
pub fn split_segments(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Default)]
struct RevealState {
    /// 尚未追加的分段数
    pending: usize,
    /// 最后一个已排期分段的时间
    last_due: Option<Instant>,
}

pub struct RevealScheduler {
    key: String,
    store: Arc<MessageStore>,
    tasks: Arc<TaskRegistry>,
    interval: Duration,
    state: Arc<Mutex<RevealState>>,
    displaying: Arc<watch::Sender<bool>>,
}

impl RevealScheduler {
    pub fn new(
        key: String,
        store: Arc<MessageStore>,
        tasks: Arc<TaskRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            key,
            store,
            tasks,
            interval,
            state: Arc::new(Mutex::new(RevealState::default())),
            displaying: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn is_displaying(&self) -> bool {
        *self.displaying.borrow()
    }

    pub fn subscribe_displaying(&self) -> watch::Receiver<bool> {
        self.displaying.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.pending).unwrap_or(0)
    }

    /// 依次展示若干条消息；排在已排期的分段之后，保证顺序
    pub fn reveal(&self, messages: Vec<Message>) {
        for message in messages {
            self.reveal_one(message);
        }
    }

    fn reveal_one(&self, message: Message) {
        let segments = if message.role == Role::Assistant && message.message_type == MessageType::Text
        {
            split_segments(&message.content)
        } else {
            Vec::new()
        };

        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if segments.len() <= 1 {
            if state.pending == 0 {
                self.store.append(message);
                return;
            }
            // 前面还有分段在排队，单条消息也要排在后面
            let due = Self::next_slot(&state, self.interval);
            self.schedule(&mut state, vec![(due, message)]);
            return;
        }

        let count = segments.len();
        let base = message.id.clone();
        info!(
            "[Reveal] 🧩 逐段展示: baseId={}, 分段数={}",
            base, count
        );
        let start = Self::next_slot(&state, self.interval);
        let plan: Vec<(Instant, Message)> = segments
            .into_iter()
            .enumerate()
            .map(|(i, segment)| {
                let mut part = message.clone();
                part.id = part_id(&base, i);
                part.content = segment;
                part.is_last_part = i + 1 == count;
                (start + self.interval * i as u32, part)
            })
            .collect();
        self.schedule(&mut state, plan);
    }

    fn next_slot(state: &RevealState, interval: Duration) -> Instant {
        let now = Instant::now();
        match state.last_due {
            Some(last) if state.pending > 0 => (last + interval).max(now),
            _ => now,
        }
    }

    fn schedule(&self, state: &mut RevealState, plan: Vec<(Instant, Message)>) {
        state.pending += plan.len();
        if let Some((due, _)) = plan.last() {
            state.last_due = Some(*due);
        }
        self.displaying.send_replace(true);

        for (due, part) in plan {
            let store = self.store.clone();
            let shared = self.state.clone();
            let displaying = self.displaying.clone();
            self.tasks.spawn_at(&self.key, due, async move {
                debug!("[Reveal] 追加分段: id={}", part.id);
                store.append(part);
                if let Ok(mut state) = shared.lock() {
                    state.pending = state.pending.saturating_sub(1);
                    if state.pending == 0 {
                        state.last_due = None;
                        displaying.send_replace(false);
                    }
                }
            });
        }
    }

    /// 取消全部未执行的分段，返回取消数量
    pub fn cancel(&self) -> usize {
        let cancelled = self.tasks.cancel_all(&self.key);
        if let Ok(mut state) = self.state.lock() {
            state.pending = 0;
            state.last_due = None;
        }
        self.displaying.send_replace(false);
        if cancelled > 0 {
            info!(
                "[Reveal] ⏹️ 取消逐段展示: key={}, 未展示={}",
                self.key, cancelled
            );
        }
        cancelled
    }
}
