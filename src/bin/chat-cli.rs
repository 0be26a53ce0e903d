//! 角色聊天 CLI 客户端（测试版）
//!
//! 启动时通过命令行参数指定用户和角色，连接推送、打开会话，
//! 之后从标准输入读取命令或消息。

use anyhow::{Context, Result};
use clap::Parser;
use companion_chat_sdk_rust::{
    ChatClient, ChatListener, ClientConfig, ConversationSession, Message, Viewport,
};
use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::{
    self,
    format::{DefaultFields, Format},
    MakeWriter,
};

/// 角色聊天 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(about = "角色聊天 CLI 客户端 - 用于测试同步引擎", long_about = None)]
struct Args {
    /// 用户 ID
    #[arg(short, long)]
    user_id: String,

    /// 认证 token
    #[arg(short, long)]
    token: String,

    /// 要打开的角色 ID
    #[arg(short, long)]
    character: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:3000/api")]
    api_base_url: String,

    /// WebSocket 推送地址
    #[arg(long, default_value = "ws://localhost:3000/ws")]
    ws_url: String,

    /// 运行时长（秒），0 表示直到 /quit 或输入结束
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,companion_chat_sdk_rust=debug）
    #[arg(long, default_value = "info,companion_chat_sdk_rust=debug")]
    log_level: String,

    /// 额外写入的日志文件，传空字符串关闭
    #[arg(long, default_value = "debug.log")]
    log_file: String,
}

/// 统一的 fmt 层格式：带文件名和行号，不带 target
fn fmt_layer<S, W>(writer: W, ansi: bool) -> fmt::Layer<S, DefaultFields, Format, W>
where
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(ansi)
}

/// 初始化日志：stdout 总是输出，指定了日志文件时再写一份到文件
fn init_logger(log_level: &str, log_file: Option<&str>) -> Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("无法创建日志文件 {}", path))?;
            Some(fmt_layer(file, false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer(io::stdout, true))
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        info!("[CLI] 📝 日志同时写入文件: {}", path);
    }
    Ok(())
}

struct CliListener;

#[async_trait::async_trait]
impl ChatListener for CliListener {
    async fn on_error(&self, character_id: String, error: String) {
        error!("[CLI] ❌ {}: {}", character_id, error);
    }

    async fn on_character_unmatched(&self, character_id: String, reason: Option<String>) {
        warn!(
            "[CLI] 💔 角色解除匹配: {} ({})",
            character_id,
            reason.unwrap_or_default()
        );
    }

    async fn on_connection_status_changed(&self, connected: bool, message: String) {
        if connected {
            info!("[CLI] 🔗 已连接: {}", message);
        } else {
            error!("[CLI] 🔗 断开连接: {}", message);
        }
    }
}

/// 终端视口：一条消息一行
#[derive(Default)]
struct LineViewport {
    offset: f64,
    extent: f64,
}

impl Viewport for LineViewport {
    fn scroll_offset(&self) -> f64 {
        self.offset
    }

    fn content_extent(&self) -> f64 {
        self.extent
    }

    fn layout(&mut self, messages: &[Message]) {
        self.extent = messages.len() as f64;
    }

    fn set_scroll_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    fn scroll_to_latest(&mut self) {
        self.offset = self.extent;
    }
}

fn print_message(message: &Message) {
    println!("  [{}] {:?}: {}", message.id, message.role, message.content);
}

/// 消息列表变化时打印新增的尾部消息
fn spawn_printer(session: &Arc<ConversationSession>) {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        let mut auto = companion_chat_sdk_rust::AutoScroll::new();
        let mut printed: Option<String> = None;
        loop {
            let messages = rx.borrow_and_update().messages.clone();
            if auto.on_update(&messages) {
                let start = printed
                    .as_ref()
                    .and_then(|id| messages.iter().position(|m| &m.id == id))
                    .map(|i| i + 1)
                    .unwrap_or(0);
                messages[start..].iter().for_each(print_message);
            }
            printed = messages.last().map(|m| m.id.clone());
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}

async fn handle_command(
    session: &ConversationSession,
    viewport: &mut LineViewport,
    line: &str,
) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let arg1 = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    match command {
        "/quit" => return Ok(false),
        "/more" => {
            let added = session.load_more(viewport).await?;
            info!("[CLI] 📜 加载了 {} 条更早的消息", added);
            for message in session.snapshot().messages.iter().take(added) {
                print_message(message);
            }
        }
        "/continue" => {
            session.send_text("").await?;
        }
        "/edit" => session.edit(arg1, rest).await?,
        "/delete" => {
            session
                .delete_from(arg1, |m| {
                    info!("[CLI] 🗑️ 删除 {} 及之后的消息", m.id);
                    true
                })
                .await?;
        }
        "/regen" => {
            let variant = session.regenerate(arg1).await?;
            print_message(&variant);
        }
        "/swipe" => {
            let index: usize = rest.trim().parse().context("变体序号必须是数字")?;
            let variant = session.swipe(arg1, index).await?;
            print_message(&variant);
        }
        "/regen-last" => {
            session.regenerate_latest().await?;
        }
        _ => {
            session.send_text(line).await?;
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = Some(args.log_file.as_str()).filter(|p| !p.is_empty());
    init_logger(&args.log_level, log_file)?;

    info!("[CLI] 🚀 角色聊天 CLI 客户端（测试模式）");
    info!("[CLI] 👤 用户: {}, 角色: {}", args.user_id, args.character);

    let mut config = ClientConfig::new(args.user_id.clone(), args.token.clone());
    config.api_base_url = args.api_base_url.clone();
    config.ws_url = args.ws_url.clone();

    let mut client = ChatClient::new(config)?;
    client.set_listener(Arc::new(CliListener));
    client.connect();

    let session = client
        .open_conversation(&args.character)
        .await
        .context("打开会话失败")?;
    spawn_printer(&session);

    let mut viewport = LineViewport::default();
    viewport.layout(&session.snapshot().messages);
    viewport.scroll_to_latest();

    info!("[CLI] 💡 命令: /more /continue /edit <id> <text> /delete <id> /regen <id> /swipe <id> <n> /regen-last /quit");

    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("[CLI] ⏰ 运行时长已到");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match handle_command(&session, &mut viewport, line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("[CLI] ⚠️ {:#}", e),
                }
                session.dismiss_error();
            }
        }
    }

    client.shutdown();
    info!("[CLI] 👋 程序退出");
    Ok(())
}
