//! 会话视图同步引擎
//!
//! 一个 [`ConversationSession`] 对应一个打开的会话视图：持有该会话的消息存储，
//! 负责乐观发送、推送事件落地、逐段展示、历史分页与消息操作。离开会话时调用
//! [`ConversationSession::close`]，退订推送并取消该会话的全部定时任务。

use crate::chat::api::ChatApi;
use crate::chat::bus::ConversationListBus;
use crate::chat::conversation::actions::{ActionReconciler, DeleteTarget};
use crate::chat::conversation::drafts::DraftCache;
use crate::chat::conversation::pagination::{apply_anchored, Viewport};
use crate::chat::conversation::reveal::RevealScheduler;
use crate::chat::error::SyncError;
use crate::chat::listener::ChatListener;
use crate::chat::message::{Message, MessageStore, MessageType, PageState, Role, StoreSnapshot};
use crate::chat::presence::PresenceState;
use crate::chat::push::{PushEvent, PushEventKind, PushRouter, SubscriptionId, SubscriptionScope};
use crate::chat::serialization::{generate_local_id, generate_temp_id};
use crate::chat::tasks::TaskRegistry;
use crate::chat::types::SendMessageReq;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 会话视图序号，区分同一角色先后打开的视图，定时任务按视图登记
static SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

/// 会话视图配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 每页消息数
    pub page_size: usize,
    /// 逐段展示的间隔
    pub reveal_interval: Duration,
}

/// 会话依赖的共享组件（由客户端注入）
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub api: Arc<dyn ChatApi>,
    pub router: Arc<PushRouter>,
    pub tasks: Arc<TaskRegistry>,
    pub bus: ConversationListBus,
    pub drafts: Arc<DraftCache>,
    pub listener: Arc<dyn ChatListener>,
}

/// 待发送内容；文本为空且没有图片时表示“继续”
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub image_url: Option<String>,
    pub image_description: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn image(image_url: impl Into<String>, description: Option<String>) -> Self {
        Self {
            text: String::new(),
            image_url: Some(image_url.into()),
            image_description: description,
        }
    }

    /// 不带用户文本的“继续”请求
    pub fn nudge() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image_url.is_none()
    }
}

/// 发送结果
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// 乐观消息已被服务器确认
    Confirmed(Message),
    /// “继续”请求已提交，没有用户消息
    Nudged,
}

/// 会话状态快照（供视图渲染）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// 发送请求进行中，或回复仍在逐段展示
    pub sending: bool,
    pub displaying: bool,
    pub loading_more: bool,
    pub has_more: bool,
    /// 最近一次可关闭的错误提示
    pub last_error: Option<String>,
}

/// 进入时置位、离开作用域时复位的标志
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConversationSession {
    character_id: String,
    seq: u64,
    config: SessionConfig,
    store: Arc<MessageStore>,
    reveal: RevealScheduler,
    actions: ActionReconciler,
    deps: SessionDeps,
    sending: AtomicBool,
    loading_more: AtomicBool,
    closed: AtomicBool,
    last_error: Mutex<Option<String>>,
    draft: Mutex<String>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    image_index: Arc<watch::Sender<usize>>,
}

impl ConversationSession {
    pub(crate) fn new(character_id: String, config: SessionConfig, deps: SessionDeps) -> Self {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let store = Arc::new(MessageStore::new());
        let reveal = RevealScheduler::new(
            format!("reveal:{}:{}", character_id, seq),
            store.clone(),
            deps.tasks.clone(),
            config.reveal_interval,
        );
        let actions = ActionReconciler::new(
            character_id.clone(),
            deps.api.clone(),
            store.clone(),
            deps.bus.clone(),
            reveal.subscribe_displaying(),
        );
        let draft = deps.drafts.get(&character_id);
        Self {
            character_id,
            seq,
            config,
            store,
            reveal,
            actions,
            deps,
            sending: AtomicBool::new(false),
            loading_more: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            draft: Mutex::new(draft),
            subscriptions: Mutex::new(Vec::new()),
            image_index: Arc::new(watch::Sender::new(0)),
        }
    }

    fn image_key(&self) -> String {
        format!("images:{}:{}", self.character_id, self.seq)
    }

    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.store.subscribe()
    }

    pub fn subscribe_displaying(&self) -> watch::Receiver<bool> {
        self.reveal.subscribe_displaying()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        let displaying = self.reveal.is_displaying();
        SessionStatus {
            sending: self.sending.load(Ordering::SeqCst) || displaying,
            displaying,
            loading_more: self.loading_more.load(Ordering::SeqCst),
            has_more: self.store.page().has_more,
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }

    /// 关闭错误提示
    pub fn dismiss_error(&self) {
        if let Ok(mut e) = self.last_error.lock() {
            *e = None;
        }
    }

    /// 该角色的在线状态（只读）
    pub fn presence(&self) -> PresenceState {
        self.deps.router.presence().get(&self.character_id)
    }

    pub fn draft(&self) -> String {
        self.draft.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn set_draft(&self, text: &str) {
        if let Ok(mut d) = self.draft.lock() {
            *d = text.to_string();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::SessionClosed(self.character_id.clone()).into());
        }
        Ok(())
    }

    /// 记录可关闭的错误并通知监听器
    fn surface_error(&self, message: String) {
        warn!(
            "[Session] ⚠️ characterId={} 错误: {}",
            self.character_id, message
        );
        if let Ok(mut e) = self.last_error.lock() {
            *e = Some(message.clone());
        }
        let listener = self.deps.listener.clone();
        let character_id = self.character_id.clone();
        tokio::spawn(async move {
            listener.on_error(character_id, message).await;
        });
    }

    fn spawn_mark_read(&self) {
        let api = self.deps.api.clone();
        let character_id = self.character_id.clone();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&character_id).await {
                debug!("[Session] 标记已读失败: characterId={}, {:#}", character_id, e);
            }
        });
    }

    // ========== 生命周期 ==========

    /// 首次加载最新一页；会话为空时拉取开场消息
    pub(crate) async fn load_initial(&self) -> Result<()> {
        info!(
            "[Session] 📂 打开会话: characterId={}, pageSize={}",
            self.character_id, self.config.page_size
        );
        let page = match self
            .deps
            .api
            .get_conversation(&self.character_id, self.config.page_size, 0)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(
                    "[Session] ❌ 会话加载失败: characterId={}, {:#}",
                    self.character_id, e
                );
                self.surface_error(format!("会话加载失败: {:#}", e));
                return Err(e);
            }
        };

        let mut messages = page.messages;
        messages.sort_by_key(|m| m.created_at);
        let empty = messages.is_empty();
        self.store.reset(
            messages,
            PageState {
                conversation_id: Some(page.conversation.id),
                total: page.total,
                has_more: page.has_more,
            },
        );
        info!(
            "[Session] ✅ 会话加载完成: characterId={}, 消息数={}, total={}, hasMore={}",
            self.character_id,
            self.store.len(),
            page.total,
            page.has_more
        );

        if empty {
            match self.deps.api.first_message(&self.character_id).await {
                Ok(opening) => self.reveal.reveal(opening),
                Err(e) => self.surface_error(format!("开场消息获取失败: {:#}", e)),
            }
        }
        self.spawn_mark_read();
        Ok(())
    }

    /// 订阅本会话的推送事件
    pub(crate) fn attach(self: &Arc<Self>) {
        let scope = SubscriptionScope::Conversation(self.character_id.clone());
        let kinds = [
            PushEventKind::NewMessage,
            PushEventKind::AiResponseError,
            PushEventKind::CharacterOffline,
            PushEventKind::MoodChange,
        ];
        let mut ids = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let weak: Weak<Self> = Arc::downgrade(self);
            ids.push(self.deps.router.subscribe(kind, scope.clone(), move |event| {
                if let Some(session) = weak.upgrade() {
                    session.handle_push(event);
                }
            }));
        }
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.extend(ids);
        }
    }

    /// 离开会话：退订推送、取消定时任务、保存草稿
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut subs) = self.subscriptions.lock() {
            for id in subs.drain(..) {
                self.deps.router.unsubscribe(id);
            }
        }
        let cancelled = self.reveal.cancel()
            + self
                .deps
                .tasks
                .cancel_all(&self.image_key());
        self.deps.router.presence().expire_mood(&self.character_id);
        self.deps.drafts.set(&self.character_id, &self.draft());
        info!(
            "[Session] 🚪 离开会话: characterId={}, 取消定时任务={}",
            self.character_id, cancelled
        );
    }

    /// 加载完成前已被更新的打开操作取代：只撤销自己的定时任务，
    /// 不动角色级的在线状态和草稿（可能属于取代它的视图）
    pub(crate) fn discard(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reveal.cancel();
        self.deps.tasks.cancel_all(&self.image_key());
        debug!(
            "[Session] 丢弃被取代的会话视图: characterId={}, seq={}",
            self.character_id, self.seq
        );
    }

    // ========== 推送事件 ==========

    fn handle_push(&self, event: &PushEvent) {
        if self.is_closed() || event.character_id() != self.character_id {
            return;
        }
        match event {
            PushEvent::NewMessage(p) => self.on_new_message(p.message.clone()),
            PushEvent::AiResponseError(p) => {
                let detail = if p.error.is_empty() {
                    "回复生成失败".to_string()
                } else {
                    p.error.clone()
                };
                self.surface_error(detail);
            }
            PushEvent::CharacterOffline(p) => {
                let detail = p
                    .message
                    .clone()
                    .unwrap_or_else(|| "角色暂时离线".to_string());
                self.surface_error(detail);
            }
            PushEvent::MoodChange(p) => {
                if let Some(text) = p.system_message.as_ref().filter(|t| !t.trim().is_empty()) {
                    self.store
                        .append(Message::text(generate_local_id(), Role::System, text.clone()));
                }
            }
            PushEvent::CharacterTyping(_) | PushEvent::CharacterUnmatched(_) => {}
        }
    }

    fn on_new_message(&self, message: Message) {
        // 整条消息重复推送时，它可能已经被拆成分段
        let duplicate = self.store.contains(&message.id)
            || (message.part_index().is_none() && self.store.group_range(&message.id).is_some());
        if duplicate {
            debug!("[Session] 忽略已存在的消息: id={}", message.id);
            return;
        }
        debug!(
            "[Session] 📨 新消息: characterId={}, id={}, role={:?}",
            self.character_id, message.id, message.role
        );
        match message.role {
            Role::Assistant => self.reveal.reveal(vec![message]),
            _ => {
                self.store.append(message);
            }
        }
        self.spawn_mark_read();
        self.deps.bus.conversations_changed(&self.character_id);
    }

    // ========== 乐观发送 ==========

    pub async fn send_text(&self, text: &str) -> Result<SendOutcome> {
        self.send(OutgoingMessage::text(text)).await
    }

    /// 发送消息
    ///
    /// 非空内容先以临时消息立即显示，服务器确认后原位替换；失败则移除临时消息，
    /// 不恢复输入框内容。已有发送未完成或回复仍在展示时直接拒绝，不发请求。
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<SendOutcome> {
        self.ensure_open()?;
        if self.reveal.is_displaying() || self.store.temporary_id().is_some() {
            warn!("[Session] 发送被拒绝（回复展示中或有未确认消息）");
            return Err(SyncError::SendInProgress.into());
        }
        let Some(_sending) = FlagGuard::try_acquire(&self.sending) else {
            warn!("[Session] 发送被拒绝（已有发送进行中）");
            return Err(SyncError::SendInProgress.into());
        };

        let text = outgoing.text.trim().to_string();
        let temp_id = if outgoing.is_empty() {
            None
        } else {
            let mut temp = Message::text(generate_temp_id(), Role::User, text.clone());
            if let Some(url) = &outgoing.image_url {
                temp.message_type = MessageType::Image;
                temp.image_url = Some(url.clone());
            }
            let id = temp.id.clone();
            self.store.append(temp);
            self.set_draft("");
            debug!("[Session] 📤 乐观消息已显示: tempId={}", id);
            Some(id)
        };

        let req = SendMessageReq {
            message: text,
            conversation_id: self.store.page().conversation_id,
            image_url: outgoing.image_url,
            image_description: outgoing.image_description,
        };
        let result = self.deps.api.send_message(&self.character_id, &req).await;

        match (result, temp_id) {
            (Ok(Some(confirmed)), Some(temp_id)) => {
                info!(
                    "[Session] ✅ 消息已确认: tempId={} -> id={}",
                    temp_id, confirmed.id
                );
                self.store.replace(&temp_id, confirmed.clone());
                self.deps.bus.conversations_changed(&self.character_id);
                Ok(SendOutcome::Confirmed(confirmed))
            }
            (Ok(_), None) => {
                info!("[Session] ✅ 继续请求已提交");
                self.deps.bus.conversations_changed(&self.character_id);
                Ok(SendOutcome::Nudged)
            }
            (Ok(None), Some(temp_id)) => {
                self.store.remove(&temp_id);
                let e = anyhow::anyhow!("响应中缺少 message 字段");
                self.surface_error(format!("发送失败: {:#}", e));
                Err(e)
            }
            (Err(e), temp_id) => {
                if let Some(temp_id) = temp_id {
                    self.store.remove(&temp_id);
                    info!("[Session] ↩️ 回滚乐观消息: tempId={}", temp_id);
                }
                self.surface_error(format!("发送失败: {:#}", e));
                Err(e)
            }
        }
    }

    // ========== 历史分页 ==========

    /// 加载更早的一页并保持视口位置，返回插入条数
    pub async fn load_more<V>(&self, viewport: &mut V) -> Result<usize>
    where
        V: Viewport + Send + ?Sized,
    {
        self.ensure_open()?;
        if !self.store.page().has_more {
            debug!("[Session] 没有更早的消息");
            return Ok(0);
        }
        let Some(_loading) = FlagGuard::try_acquire(&self.loading_more) else {
            return Err(SyncError::LoadInProgress.into());
        };

        let offset = self.store.persisted_count();
        let page = match self
            .deps
            .api
            .get_conversation(&self.character_id, self.config.page_size, offset)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.surface_error(format!("加载历史失败: {:#}", e));
                return Err(e);
            }
        };

        let mut added = 0;
        apply_anchored(viewport, || {
            added = self.store.prepend(page.messages);
            self.store.snapshot().messages
        });
        let mut state = self.store.page();
        state.has_more = page.has_more;
        state.total = page.total;
        self.store.set_page(state);
        info!(
            "[Session] 📜 加载历史: offset={}, 插入={}, hasMore={}",
            offset, added, page.has_more
        );
        Ok(added)
    }

    // ========== 消息操作 ==========

    pub async fn edit(&self, id: &str, content: &str) -> Result<()> {
        self.ensure_open()?;
        let result = self.actions.edit(id, content).await;
        self.report("编辑失败", result)
    }

    pub async fn delete_from(
        &self,
        target: impl Into<DeleteTarget>,
        confirm: impl FnOnce(&Message) -> bool + Send,
    ) -> Result<bool> {
        self.ensure_open()?;
        let result = self.actions.delete_from(target.into(), confirm).await;
        self.report("删除失败", result)
    }

    pub async fn regenerate(&self, id: &str) -> Result<Message> {
        self.ensure_open()?;
        let result = self.actions.regenerate(id).await;
        self.report("重新生成失败", result)
    }

    pub async fn swipe(&self, id: &str, swipe_index: usize) -> Result<Message> {
        self.ensure_open()?;
        let result = self.actions.swipe(id, swipe_index).await;
        self.report("切换变体失败", result)
    }

    /// 重新生成末尾的助手回复：先截掉末尾的助手消息，再逐段展示新回复
    pub async fn regenerate_latest(&self) -> Result<usize> {
        self.ensure_open()?;
        if self.reveal.is_displaying() {
            return Err(SyncError::SendInProgress.into());
        }
        let Some(_sending) = FlagGuard::try_acquire(&self.sending) else {
            return Err(SyncError::SendInProgress.into());
        };

        let resp = match self
            .deps
            .api
            .regenerate_conversation(&self.character_id)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.surface_error(format!("重新生成失败: {:#}", e));
                return Err(e);
            }
        };

        let snapshot = self.store.snapshot();
        let start = snapshot
            .messages
            .iter()
            .rposition(|m| m.role != Role::Assistant)
            .map(|i| i + 1)
            .unwrap_or(0);
        let removed = self.store.remove_from(start);
        let count = resp.messages.len();
        self.reveal.reveal(resp.messages);
        info!(
            "[Session] 🔁 重新生成回复: 移除={}, 新消息={}",
            removed, count
        );
        self.deps.bus.conversations_changed(&self.character_id);
        Ok(count)
    }

    fn report<T>(&self, what: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            // 用户取消、目标不存在这类本地判定同样需要提示
            self.surface_error(format!("{}: {:#}", what, e));
        }
        result
    }

    // ========== 图片轮播 ==========

    /// 每隔 `period` 切换到下一张图片，离开会话时自动停止
    pub fn start_image_cycle(&self, image_count: usize, period: Duration) -> watch::Receiver<usize> {
        let key = self.image_key();
        self.deps.tasks.cancel_all(&key);
        self.image_index.send_replace(0);
        if image_count > 1 && !self.is_closed() {
            let index = self.image_index.clone();
            self.deps.tasks.spawn_repeating(&key, period, move || {
                index.send_modify(|i| *i = (*i + 1) % image_count);
            });
        }
        self.image_index.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::presence::PresenceBroadcaster;
    use crate::chat::test_support::{init_test_logger, MockApi, RecordingListener};

    fn session_with(api: Arc<MockApi>) -> Arc<ConversationSession> {
        init_test_logger();
        let tasks = Arc::new(TaskRegistry::new());
        let presence = Arc::new(PresenceBroadcaster::new(
            tasks.clone(),
            Duration::from_secs(30),
        ));
        let deps = SessionDeps {
            api,
            router: Arc::new(PushRouter::new(presence)),
            tasks,
            bus: ConversationListBus::default(),
            drafts: Arc::new(DraftCache::new()),
            listener: Arc::new(RecordingListener::default()),
        };
        Arc::new(ConversationSession::new(
            "c1".into(),
            SessionConfig {
                page_size: 30,
                reveal_interval: Duration::from_millis(800),
            },
            deps,
        ))
    }

    #[test]
    fn flag_guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = FlagGuard::try_acquire(&flag).unwrap();
            assert!(FlagGuard::try_acquire(&flag).is_none());
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn outgoing_emptiness() {
        assert!(OutgoingMessage::nudge().is_empty());
        assert!(OutgoingMessage::text("  \n").is_empty());
        assert!(!OutgoingMessage::image("https://img/1.png", None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn image_cycle_wraps_and_stops_on_close() {
        let session = session_with(Arc::new(MockApi::new()));
        let rx = session.start_image_cycle(3, Duration::from_secs(5));
        assert_eq!(*rx.borrow(), 0);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(*rx.borrow(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*rx.borrow(), 0);

        session.close();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*rx.borrow(), 0);
    }

    #[tokio::test]
    async fn closed_session_rejects_operations() {
        let session = session_with(Arc::new(MockApi::new()));
        session.load_initial().await.unwrap();
        session.close();
        let err = session.send_text("hi").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn image_send_shows_optimistic_image() {
        let api = Arc::new(MockApi::new());
        let gate = api.gate_sends();
        let session = session_with(api);
        session.load_initial().await.unwrap();

        let sending = session.send(OutgoingMessage::image(
            "https://img/1.png",
            Some("a cat".into()),
        ));
        let inspect = async {
            tokio::task::yield_now().await;
            let snapshot = session.snapshot();
            gate.notify_one();
            snapshot
        };
        let (sent, during) = tokio::join!(sending, inspect);
        assert!(sent.is_ok());
        assert_eq!(during.messages.len(), 1);
        assert_eq!(during.messages[0].message_type, MessageType::Image);
        assert!(during.messages[0].is_temporary());
        assert_eq!(
            session.snapshot().messages[0].image_url.as_deref(),
            Some("https://img/1.png")
        );
    }
}
