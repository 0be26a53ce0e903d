//! 聊天客户端
//!
//! 进程级入口：持有推送连接、推送路由、在线状态、事件总线、草稿缓存和 HTTP 接口。
//! 同一时刻最多一个打开的会话视图，打开新会话时旧会话自动关闭。

use crate::chat::api::{ChatApi, HttpChatApi};
use crate::chat::bus::ConversationListBus;
use crate::chat::conversation::session::SessionDeps;
use crate::chat::conversation::{ConversationSession, DraftCache, SessionConfig};
use crate::chat::error::SyncError;
use crate::chat::listener::{ChatListener, EmptyChatListener};
use crate::chat::presence::PresenceBroadcaster;
use crate::chat::push::{
    PushConnection, PushConnectionConfig, PushConnectionHandle, PushEvent, PushEventKind,
    PushRouter, ReconnectPolicy, SubscriptionId, SubscriptionScope,
};
use crate::chat::tasks::TaskRegistry;
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 用户 ID（推送连接按用户建立）
    pub user_id: String,
    /// 认证 token
    pub token: String,
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// WebSocket 推送地址
    pub ws_url: String,
    /// 每页消息数
    pub page_size: usize,
    /// 逐段展示间隔
    pub reveal_interval: Duration,
    /// 情绪效果持续时间
    pub mood_ttl: Duration,
    /// HTTP 请求超时
    pub request_timeout: Duration,
    /// 推送断线重连策略
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String, token: String) -> Self {
        Self {
            user_id,
            token,
            api_base_url: "http://localhost:3000/api".to_string(),
            ws_url: "ws://localhost:3000/ws".to_string(),
            page_size: 30,
            reveal_interval: Duration::from_millis(800),
            mood_ttl: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            page_size: self.page_size,
            reveal_interval: self.reveal_interval,
        }
    }
}

/// 当前打开的会话视图；每次打开或关闭都会递增 `generation`
#[derive(Default)]
struct ActiveSlot {
    generation: u64,
    session: Option<Arc<ConversationSession>>,
}

pub struct ChatClient {
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    tasks: Arc<TaskRegistry>,
    router: Arc<PushRouter>,
    bus: ConversationListBus,
    drafts: Arc<DraftCache>,
    listener: Arc<dyn ChatListener>,
    unmatched_subscription: Option<SubscriptionId>,
    connection: Option<PushConnectionHandle>,
    active: Mutex<ActiveSlot>,
}

impl ChatClient {
    /// 使用 HTTP 接口创建客户端
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = HttpChatApi::build_client(&config.token, config.request_timeout)?;
        let api = Arc::new(HttpChatApi::new(client, config.api_base_url.clone()));
        Ok(Self::with_api(config, api))
    }

    /// 使用自定义接口实现创建客户端
    pub fn with_api(config: ClientConfig, api: Arc<dyn ChatApi>) -> Self {
        let tasks = Arc::new(TaskRegistry::new());
        let presence = Arc::new(PresenceBroadcaster::new(tasks.clone(), config.mood_ttl));
        let router = Arc::new(PushRouter::new(presence));
        let mut client = Self {
            config,
            api,
            tasks,
            router,
            bus: ConversationListBus::default(),
            drafts: Arc::new(DraftCache::new()),
            listener: Arc::new(EmptyChatListener),
            unmatched_subscription: None,
            connection: None,
            active: Mutex::new(ActiveSlot::default()),
        };
        client.subscribe_unmatched();
        client
    }

    /// 注册回调监听器（应在 `connect` 和打开会话之前调用）
    pub fn set_listener(&mut self, listener: Arc<dyn ChatListener>) {
        self.listener = listener;
        self.subscribe_unmatched();
    }

    /// 解除匹配与当前打开的会话无关，全局订阅
    fn subscribe_unmatched(&mut self) {
        if let Some(id) = self.unmatched_subscription.take() {
            self.router.unsubscribe(id);
        }
        let listener = self.listener.clone();
        let id = self.router.subscribe(
            PushEventKind::CharacterUnmatched,
            SubscriptionScope::Global,
            move |event| {
                if let PushEvent::CharacterUnmatched(p) = event {
                    info!("[Client] 💔 角色解除匹配: characterId={}", p.character_id);
                    let listener = listener.clone();
                    let character_id = p.character_id.clone();
                    let reason = p.reason.clone();
                    tokio::spawn(async move {
                        listener.on_character_unmatched(character_id, reason).await;
                    });
                }
            },
        );
        self.unmatched_subscription = Some(id);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<PushRouter> {
        &self.router
    }

    pub fn presence(&self) -> &Arc<PresenceBroadcaster> {
        self.router.presence()
    }

    pub fn bus(&self) -> &ConversationListBus {
        &self.bus
    }

    pub fn drafts(&self) -> &Arc<DraftCache> {
        &self.drafts
    }

    pub fn connection(&self) -> Option<&PushConnectionHandle> {
        self.connection.as_ref()
    }

    /// 建立推送长连接（后台运行，断线自动重连）
    pub fn connect(&mut self) {
        if let Some(old) = self.connection.take() {
            old.shutdown();
        }
        info!(
            "[Client] 🔌 启动推送连接: userId={}, ws={}",
            self.config.user_id, self.config.ws_url
        );
        let connection = PushConnection::new(
            PushConnectionConfig {
                ws_url: self.config.ws_url.clone(),
                user_id: self.config.user_id.clone(),
                token: self.config.token.clone(),
                reconnect: self.config.reconnect.clone(),
            },
            self.router.clone(),
            self.listener.clone(),
        );
        self.connection = Some(connection.spawn());
    }

    fn slot(&self) -> MutexGuard<'_, ActiveSlot> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 打开会话视图；之前打开的会话先关闭
    ///
    /// 会话不存在时返回 [`SyncError::ConversationNotFound`]。加载期间又打开了别的会话
    /// （或调用了 [`ChatClient::close_active`]）时，本次打开作废并返回
    /// [`SyncError::SessionClosed`]，当前视图以最后一次打开为准。
    pub async fn open_conversation(&self, character_id: &str) -> Result<Arc<ConversationSession>> {
        let generation = self.close_active();

        let session = Arc::new(ConversationSession::new(
            character_id.to_string(),
            self.config.session_config(),
            SessionDeps {
                api: self.api.clone(),
                router: self.router.clone(),
                tasks: self.tasks.clone(),
                bus: self.bus.clone(),
                drafts: self.drafts.clone(),
                listener: self.listener.clone(),
            },
        ));
        let loaded = session.load_initial().await;

        let claimed = {
            let mut slot = self.slot();
            if slot.generation == generation && loaded.is_ok() {
                slot.session = Some(session.clone());
                true
            } else {
                false
            }
        };
        if !claimed {
            session.discard();
            loaded?;
            info!(
                "[Client] 会话打开已被取代: characterId={}",
                character_id
            );
            return Err(SyncError::SessionClosed(character_id.to_string()).into());
        }
        session.attach();
        Ok(session)
    }

    pub fn active(&self) -> Option<Arc<ConversationSession>> {
        self.slot().session.clone()
    }

    /// 关闭当前会话视图，同时作废尚未完成的打开操作；返回新的代数
    pub fn close_active(&self) -> u64 {
        let (generation, previous) = {
            let mut slot = self.slot();
            slot.generation += 1;
            (slot.generation, slot.session.take())
        };
        if let Some(session) = previous {
            session.close();
        }
        generation
    }

    /// 关闭会话、断开推送并取消全部定时任务
    pub fn shutdown(&mut self) {
        self.close_active();
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        self.tasks.cancel_everything();
        info!("[Client] 👋 客户端已关闭: userId={}", self.config.user_id);
    }
}
