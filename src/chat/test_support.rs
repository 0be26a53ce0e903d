//! 测试辅助：内存 ChatApi、记录型监听器、测试日志

use crate::chat::api::ChatApi;
use crate::chat::error::SyncError;
use crate::chat::listener::ChatListener;
use crate::chat::message::{Message, Role};
use crate::chat::types::{
    ConversationInfo, ConversationPage, RegenerateConversationResp, SendMessageReq,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Notify;

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        let filter_layer = EnvFilter::new("info,companion_chat_sdk_rust=debug");
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

/// 按秒构造消息（`created_at` 单调递增）
pub(crate) fn msg(id: &str, role: Role, content: &str, secs: i64) -> Message {
    let mut m = Message::text(id, role, content);
    m.created_at = Utc
        .timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .unwrap_or_else(Utc::now);
    m
}

/// 内存服务端
///
/// `history` 按时间升序保存已持久化的消息；分页从最新往前取。
pub(crate) struct MockApi {
    pub history: Mutex<Vec<Message>>,
    pub calls: Mutex<Vec<String>>,
    pub next_id: AtomicU64,
    pub not_found: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_pages: AtomicBool,
    pub fail_actions: AtomicBool,
    /// 设置后发送请求会一直等待，直到 `notify_one`
    pub send_gate: Mutex<Option<Arc<Notify>>>,
    pub first_messages: Mutex<Vec<Message>>,
    pub regenerated: Mutex<Vec<Message>>,
    /// 依次作用于每次 `get_conversation` 的响应延迟
    pub page_delays: Mutex<VecDeque<Duration>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(42),
            not_found: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            fail_pages: AtomicBool::new(false),
            fail_actions: AtomicBool::new(false),
            send_gate: Mutex::new(None),
            first_messages: Mutex::new(Vec::new()),
            regenerated: Mutex::new(Vec::new()),
            page_delays: Mutex::new(VecDeque::new()),
        }
    }

    /// 预置 `count` 条历史消息，ID 为 `h0..h{count-1}`
    pub fn with_history(count: usize) -> Self {
        let api = Self::new();
        {
            let mut history = api.history.lock().unwrap();
            for i in 0..count {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                history.push(msg(&format!("h{}", i), role, &format!("m{}", i), i as i64));
            }
        }
        api
    }

    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_actions(&self) -> Result<()> {
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(anyhow!("HTTP 500: action failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn get_conversation(
        &self,
        character_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<ConversationPage> {
        self.record(format!("get:{}:{}", limit, offset));
        let delay = self.page_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.not_found.load(Ordering::SeqCst) {
            return Err(SyncError::ConversationNotFound(character_id.to_string()).into());
        }
        if self.fail_pages.load(Ordering::SeqCst) {
            return Err(anyhow!("HTTP 500: page failed"));
        }
        let history = self.history.lock().unwrap();
        let total = history.len();
        let end = total.saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(ConversationPage {
            conversation: ConversationInfo {
                id: format!("conv-{}", character_id),
                character_id: character_id.to_string(),
                total_messages: total,
            },
            messages: history[start..end].to_vec(),
            total,
            has_more: start > 0,
        })
    }

    async fn send_message(
        &self,
        _character_id: &str,
        req: &SendMessageReq,
    ) -> Result<Option<Message>> {
        self.record(format!("send:{}", req.message));
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(anyhow!("HTTP 500: send failed"));
        }
        if req.message.is_empty() && req.image_url.is_none() {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut stored = Message::text(id, Role::User, req.message.clone());
        stored.image_url = req.image_url.clone();
        self.history.lock().unwrap().push(stored.clone());
        Ok(Some(stored))
    }

    async fn first_message(&self, _character_id: &str) -> Result<Vec<Message>> {
        self.record("first".to_string());
        Ok(self.first_messages.lock().unwrap().clone())
    }

    async fn regenerate_conversation(
        &self,
        _character_id: &str,
    ) -> Result<RegenerateConversationResp> {
        self.record("regen-conv".to_string());
        self.check_actions()?;
        Ok(RegenerateConversationResp {
            messages: self.regenerated.lock().unwrap().clone(),
            conversation: None,
        })
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<()> {
        self.record(format!("edit:{}:{}", message_id, content));
        self.check_actions()
    }

    async fn delete_from(&self, message_id: &str) -> Result<()> {
        self.record(format!("delete:{}", message_id));
        self.check_actions()
    }

    async fn swipe_message(&self, message_id: &str, swipe_index: usize) -> Result<Message> {
        self.record(format!("swipe:{}:{}", message_id, swipe_index));
        self.check_actions()?;
        let mut m = Message::text(
            message_id,
            Role::Assistant,
            format!("variant {}", swipe_index),
        );
        m.swipe_index = swipe_index;
        m.swipe_count = 3;
        Ok(m)
    }

    async fn regenerate_message(&self, message_id: &str) -> Result<Message> {
        self.record(format!("regen:{}", message_id));
        self.check_actions()?;
        let mut m = Message::text(message_id, Role::Assistant, "regenerated");
        m.swipe_index = 1;
        m.swipe_count = 2;
        Ok(m)
    }

    async fn mark_read(&self, character_id: &str) -> Result<()> {
        self.record(format!("read:{}", character_id));
        Ok(())
    }
}

/// 记录所有回调的监听器
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub errors: Mutex<Vec<(String, String)>>,
    pub unmatched: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatListener for RecordingListener {
    async fn on_error(&self, character_id: String, error: String) {
        self.errors.lock().unwrap().push((character_id, error));
    }

    async fn on_character_unmatched(&self, character_id: String, _reason: Option<String>) {
        self.unmatched.lock().unwrap().push(character_id);
    }

    async fn on_connection_status_changed(&self, _connected: bool, _message: String) {}
}
