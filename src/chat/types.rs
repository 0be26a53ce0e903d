//! HTTP 接口 DTO 与通用响应处理

use crate::chat::message::Message;
use crate::chat::serialization::deserialize_id;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// 会话信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub character_id: String,
    /// 消息总数（服务器可能不返回）
    #[serde(default)]
    pub total_messages: usize,
}

/// `GET conversation` 响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    pub conversation: ConversationInfo,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub has_more: bool,
}

/// 发送消息请求
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageReq {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_description: Option<String>,
}

/// 发送消息响应；“继续”请求没有用户消息时 `message` 为空
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResp {
    #[serde(default)]
    pub message: Option<Message>,
}

/// 单条消息响应
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResp {
    pub message: Message,
}

/// 多条消息响应（first-message）
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResp {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// 会话级重新生成响应，消息列表字段可能叫 `messages` 或 `newMessages`
#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateConversationResp {
    #[serde(default, alias = "newMessages")]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub conversation: Option<ConversationInfo>,
}

/// 错误响应体
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "message")]
    error: Option<String>,
}

/// 通用 HTTP 响应处理函数：检查状态码并直接反序列化为业务结构体
/// 所有 API 都可以共用此方法
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<T> {
    use anyhow::Context;

    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        let detail = serde_json::from_slice::<ErrorBody>(&body_bytes)
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| body_str.to_string());
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, detail
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, detail));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    // 空 body 视为 null（例如 PUT/DELETE 只返回 204）
    let bytes: &[u8] = if body_bytes.is_empty() {
        b"null"
    } else {
        &body_bytes
    };
    serde_json::from_slice::<T>(bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}
