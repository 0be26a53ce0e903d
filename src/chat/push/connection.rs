//! 推送长连接
//!
//! 每个用户一条 WebSocket 连接。断线后按指数退避重连，超过最大次数后放弃；
//! 断线期间不缓存任何事件（至多一次送达），缺口由下一次主动拉取补齐。

use crate::chat::listener::ChatListener;
use crate::chat::push::events::PushEvent;
use crate::chat::push::router::PushRouter;
use crate::chat::serialization::{decompress_gzip, is_gzip};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// 重连策略（指数退避，有上限）
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// 连续失败的最大重连次数
    pub max_attempts: u32,
    /// 首次重连等待时间
    pub initial_backoff: Duration,
    /// 最长等待时间
    pub max_backoff: Duration,
    /// 退避倍数
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重连（从 1 开始）前的等待时间；超过上限返回 None
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// 重连次数耗尽
    Failed,
}

/// 推送连接配置
#[derive(Debug, Clone)]
pub struct PushConnectionConfig {
    pub ws_url: String,
    pub user_id: String,
    pub token: String,
    pub reconnect: ReconnectPolicy,
}

/// 运行中的推送连接
pub struct PushConnectionHandle {
    task: JoinHandle<()>,
    status: watch::Receiver<ConnectionStatus>,
}

impl PushConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for PushConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct PushConnection {
    config: PushConnectionConfig,
    router: Arc<PushRouter>,
    listener: Arc<dyn ChatListener>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl PushConnection {
    pub fn new(
        config: PushConnectionConfig,
        router: Arc<PushRouter>,
        listener: Arc<dyn ChatListener>,
    ) -> Self {
        Self {
            config,
            router,
            listener,
            status_tx: watch::Sender::new(ConnectionStatus::Disconnected),
        }
    }

    /// 启动后台连接任务
    pub fn spawn(self) -> PushConnectionHandle {
        let status = self.status_tx.subscribe();
        let task = tokio::spawn(self.run());
        PushConnectionHandle { task, status }
    }

    /// 构建 WebSocket 连接 URL
    fn build_url(&self) -> String {
        format!(
            "{}/?userId={}&token={}",
            self.config.ws_url.trim_end_matches('/'),
            self.config.user_id,
            self.config.token
        )
    }

    async fn run(self) {
        let url = self.build_url();
        let mut attempt: u32 = 0;

        loop {
            self.set_status(ConnectionStatus::Connecting);
            info!(
                "[Push] 🔗 连接推送服务 (user={}, attempt={})",
                self.config.user_id, attempt
            );

            match connect_async(&url).await {
                Ok((ws_stream, response)) => {
                    info!("[Push] ✅ WebSocket 连接成功, 状态: {}", response.status());
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    self.notify_status(true, "连接成功".to_string());

                    match self.pump(ws_stream).await {
                        Ok(()) => warn!("[Push] ⚠️ 服务器关闭了连接"),
                        Err(e) => warn!("[Push] ⚠️ 连接中断: {:#}", e),
                    }
                    self.set_status(ConnectionStatus::Disconnected);
                    self.notify_status(false, "连接断开".to_string());
                }
                Err(e) => {
                    warn!("[Push] ❌ WebSocket 连接失败: {}", e);
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }

            attempt += 1;
            match self.config.reconnect.delay_for(attempt) {
                Some(delay) => {
                    info!(
                        "[Push] 🔄 {:?} 后重连 ({}/{})",
                        delay, attempt, self.config.reconnect.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        "[Push] ❌ 重连 {} 次均失败，停止重连",
                        self.config.reconnect.max_attempts
                    );
                    self.set_status(ConnectionStatus::Failed);
                    self.notify_status(false, "重连失败".to_string());
                    return;
                }
            }
        }
    }

    /// 读取直到连接结束；正常关闭返回 Ok
    async fn pump(&self, ws_stream: WsStream) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        // 心跳：写端只用于 ping，由心跳任务独占
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if write.send(WsMessage::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        let result = async {
            while let Some(frame) = read.next().await {
                match frame.context("读取 WebSocket 帧失败")? {
                    WsMessage::Text(text) => self.handle_payload(text.as_bytes()),
                    WsMessage::Binary(data) => {
                        if is_gzip(&data) {
                            match decompress_gzip(&data) {
                                Ok(d) => self.handle_payload(&d),
                                Err(e) => error!("[Push] 解压失败: {}", e),
                            }
                        } else {
                            self.handle_payload(&data);
                        }
                    }
                    WsMessage::Close(frame) => {
                        debug!("[Push] 收到关闭帧: {:?}", frame);
                        break;
                    }
                    _ => {}
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        heartbeat.abort();
        result
    }

    fn handle_payload(&self, data: &[u8]) {
        match serde_json::from_slice::<PushEvent>(data) {
            Ok(event) => {
                debug!(
                    "[Push] 📥 收到事件: kind={:?}, characterId={}",
                    event.kind(),
                    event.character_id()
                );
                self.router.dispatch(&event);
            }
            Err(e) => {
                warn!(
                    "[Push] 事件解析失败: {}, 原始数据: {}",
                    e,
                    String::from_utf8_lossy(data)
                );
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    fn notify_status(&self, connected: bool, message: String) {
        let listener = self.listener.clone();
        tokio::spawn(async move {
            listener.on_connection_status_changed(connected, message).await;
        });
    }
}
