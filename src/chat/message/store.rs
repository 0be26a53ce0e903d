//! 内存消息存储
//!
//! 每个打开的会话一份，按 `created_at`/插入顺序保存消息。除了 `prepend`（加载更早的历史）
//! 和 `replace`（乐观消息确认）之外，任何操作都不会改变已有消息的相对顺序。
//!
//! 存储基于 `tokio::sync::watch`：每次修改都会递增版本号并通知订阅者，所有操作都是同步的。

use crate::chat::message::models::Message;
use crate::chat::serialization::{base_id, is_local_id};
use std::collections::HashSet;
use std::ops::Range;
use tokio::sync::watch;
use tracing::{debug, warn};

/// 分页状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
    /// 服务器会话 ID（首次加载后才有）
    pub conversation_id: Option<String>,
    /// 服务器报告的消息总数
    pub total: usize,
    /// 是否还有更早的消息
    pub has_more: bool,
}

/// 某一版本的存储快照
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub version: u64,
    pub messages: Vec<Message>,
    pub page: PageState,
}

impl StoreSnapshot {
    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }
}

pub struct MessageStore {
    tx: watch::Sender<StoreSnapshot>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(StoreSnapshot::default()),
        }
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page(&self) -> PageState {
        self.tx.borrow().page.clone()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.tx
            .borrow()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn get_at(&self, index: usize) -> Option<Message> {
        self.tx.borrow().messages.get(index).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.tx.borrow().messages.iter().position(|m| m.id == id)
    }

    /// 分段组（共享同一 base id 的连续消息）所在的区间
    pub fn group_range(&self, base: &str) -> Option<Range<usize>> {
        group_range(&self.tx.borrow().messages, base)
    }

    pub fn oldest_id(&self) -> Option<String> {
        self.tx.borrow().messages.first().map(|m| m.id.clone())
    }

    pub fn newest_id(&self) -> Option<String> {
        self.tx.borrow().messages.last().map(|m| m.id.clone())
    }

    /// 当前未确认的临时消息 ID
    pub fn temporary_id(&self) -> Option<String> {
        self.tx
            .borrow()
            .messages
            .iter()
            .find(|m| m.is_temporary())
            .map(|m| m.id.clone())
    }

    /// 已持久化的消息条数（分段按一条计，不含临时消息和本地消息），用作分页偏移
    pub fn persisted_count(&self) -> usize {
        let snapshot = self.tx.borrow();
        snapshot
            .messages
            .iter()
            .filter(|m| !m.is_temporary() && !is_local_id(&m.id))
            .map(|m| base_id(&m.id))
            .collect::<HashSet<_>>()
            .len()
    }

    /// 首次加载：整体替换
    pub fn reset(&self, messages: Vec<Message>, page: PageState) {
        self.mutate(|msgs, current_page| {
            *msgs = messages;
            *current_page = page;
            (true, ())
        })
    }

    pub fn set_page(&self, page: PageState) {
        self.mutate(|_, current_page| {
            let changed = *current_page != page;
            *current_page = page;
            (changed, ())
        })
    }

    /// 追加到末尾；ID 已存在时忽略
    pub fn append(&self, message: Message) -> bool {
        self.mutate(|msgs, _| {
            if msgs.iter().any(|m| m.id == message.id) {
                debug!("[Store] 忽略重复消息: id={}", message.id);
                return (false, false);
            }
            msgs.push(message);
            (true, true)
        })
    }

    /// 在头部插入更早的消息，返回实际插入条数
    ///
    /// 比当前第一条消息还新的条目不会插入头部（服务器返回的页与已有消息重叠或错位时）。
    pub fn prepend(&self, mut older: Vec<Message>) -> usize {
        older.sort_by_key(|m| m.created_at);
        self.mutate(|msgs, _| {
            let mut seen: HashSet<String> = msgs.iter().map(|m| m.id.clone()).collect();
            older.retain(|m| seen.insert(m.id.clone()));
            if let Some(head) = msgs.first().map(|m| m.created_at) {
                let before = older.len();
                older.retain(|m| m.created_at <= head);
                if older.len() != before {
                    warn!(
                        "[Store] ⚠️ 历史页包含比当前首条更新的消息，已丢弃 {} 条",
                        before - older.len()
                    );
                }
            }
            let added = older.len();
            if added == 0 {
                return (false, 0);
            }
            msgs.splice(0..0, older);
            (true, added)
        })
    }

    /// 原位替换 `match_id` 对应的消息
    ///
    /// 若 `new.id` 已在别处存在（例如推送先于接口响应到达），则删除被匹配的消息，
    /// 保证确认后的 ID 只出现一次。
    pub fn replace(&self, match_id: &str, new: Message) -> bool {
        self.mutate(|msgs, _| {
            let Some(pos) = msgs.iter().position(|m| m.id == match_id) else {
                return (false, false);
            };
            let duplicate = msgs
                .iter()
                .enumerate()
                .any(|(i, m)| i != pos && m.id == new.id);
            if duplicate {
                debug!(
                    "[Store] 确认消息已存在，移除占位消息: match_id={}, id={}",
                    match_id, new.id
                );
                msgs.remove(pos);
            } else {
                msgs[pos] = new;
            }
            (true, true)
        })
    }

    pub fn remove(&self, id: &str) -> Option<Message> {
        self.mutate(|msgs, _| match msgs.iter().position(|m| m.id == id) {
            Some(pos) => (true, Some(msgs.remove(pos))),
            None => (false, None),
        })
    }

    /// 截断：删除 `index` 及之后的全部消息，返回删除条数
    pub fn remove_from(&self, index: usize) -> usize {
        self.mutate(|msgs, _| {
            if index >= msgs.len() {
                return (false, 0);
            }
            let removed = msgs.len() - index;
            msgs.truncate(index);
            (true, removed)
        })
    }

    pub fn update_content(&self, id: &str, content: &str) -> bool {
        self.mutate(|msgs, _| match msgs.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.content = content.to_string();
                (true, true)
            }
            None => (false, false),
        })
    }

    /// 更新同一 base id 下所有分段的内容，`is_last_part` 不变
    pub fn update_group_content(&self, base: &str, content: &str) -> usize {
        self.mutate(|msgs, _| {
            let mut updated = 0;
            for m in msgs.iter_mut().filter(|m| base_id(&m.id) == base) {
                m.content = content.to_string();
                updated += 1;
            }
            (updated > 0, updated)
        })
    }

    /// 合并新变体（仅内容和变体元数据），位置不变
    ///
    /// 分段组合并为组首位置上的一条消息。
    pub fn merge_variant(&self, id: &str, source: &Message) -> bool {
        let base = base_id(id).to_string();
        self.mutate(|msgs, _| {
            let Some(range) = group_range(msgs, &base) else {
                return (false, false);
            };
            let start = range.start;
            let target = &mut msgs[start];
            if range.len() > 1 {
                target.id = base.clone();
                target.is_last_part = false;
            }
            target.content = source.content.clone();
            target.swipe_index = source.swipe_index;
            target.swipe_count = source.swipe_count;
            msgs.drain(start + 1..range.end);
            (true, true)
        })
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Message>, &mut PageState) -> (bool, R)) -> R {
        let mut result = None;
        self.tx.send_if_modified(|snapshot| {
            let (changed, r) = f(&mut snapshot.messages, &mut snapshot.page);
            result = Some(r);
            if changed {
                snapshot.version += 1;
            }
            changed
        });
        // send_if_modified 总是同步调用闭包
        result.unwrap_or_else(|| unreachable!("闭包未执行"))
    }
}

fn group_range(messages: &[Message], base: &str) -> Option<Range<usize>> {
    let start = messages.iter().position(|m| base_id(&m.id) == base)?;
    let len = messages[start..]
        .iter()
        .take_while(|m| base_id(&m.id) == base)
        .count();
    Some(start..start + len)
}
