//! 聊天 HTTP API 客户端
//!
//! 负责所有会话/消息相关的 HTTP 请求。同步引擎只依赖 [`ChatApi`] trait，
//! 测试中可以替换为内存实现。

use crate::chat::error::SyncError;
use crate::chat::message::Message;
use crate::chat::types::{
    handle_http_response, ConversationPage, MessageResp, MessagesResp,
    RegenerateConversationResp, SendMessageReq, SendMessageResp,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::IgnoredAny;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// 拉取会话及一页消息（`offset` 为已加载的消息数）
    async fn get_conversation(
        &self,
        character_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<ConversationPage>;

    /// 持久化用户消息；助手回复随后通过推送到达
    async fn send_message(
        &self,
        character_id: &str,
        req: &SendMessageReq,
    ) -> Result<Option<Message>>;

    /// 空会话的开场消息（同步返回多条）
    async fn first_message(&self, character_id: &str) -> Result<Vec<Message>>;

    /// 重新生成会话末尾的回复
    async fn regenerate_conversation(&self, character_id: &str)
        -> Result<RegenerateConversationResp>;

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<()>;

    /// 删除该消息及其之后的全部消息
    async fn delete_from(&self, message_id: &str) -> Result<()>;

    async fn swipe_message(&self, message_id: &str, swipe_index: usize) -> Result<Message>;

    async fn regenerate_message(&self, message_id: &str) -> Result<Message>;

    async fn mark_read(&self, character_id: &str) -> Result<()>;
}

/// 基于 reqwest 的实现
pub struct HttpChatApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl HttpChatApi {
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// 创建带认证头和请求超时的 HTTP 客户端
    pub fn build_client(token: &str, timeout: Duration) -> Result<reqwest::Client> {
        reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                        .context("无效的 token")?,
                );
                headers
            })
            .timeout(timeout)
            .build()
            .context("创建 HTTP 客户端失败")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let operation_id = Uuid::new_v4().to_string();
        let url = self.url(path);
        debug!("[ChatAPI] 📡 {} {} operationID={}", method, url, operation_id);
        self.client
            .request(method, url)
            .header("Content-Type", "application/json")
            .header("operationID", operation_id)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_conversation(
        &self,
        character_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<ConversationPage> {
        info!(
            "[ChatAPI] 📡 拉取会话: characterId={}, limit={}, offset={}",
            character_id, limit, offset
        );
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/conversations/{}", character_id),
            )
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await
            .context("请求失败")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::ConversationNotFound(character_id.to_string()).into());
        }
        handle_http_response::<ConversationPage>(response, "拉取会话").await
    }

    async fn send_message(
        &self,
        character_id: &str,
        req: &SendMessageReq,
    ) -> Result<Option<Message>> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/conversations/{}/messages", character_id),
            )
            .json(req)
            .send()
            .await
            .context("请求失败")?;
        let resp = handle_http_response::<SendMessageResp>(response, "发送消息").await?;
        Ok(resp.message)
    }

    async fn first_message(&self, character_id: &str) -> Result<Vec<Message>> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/conversations/{}/first-message", character_id),
            )
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("请求失败")?;
        let resp = handle_http_response::<MessagesResp>(response, "开场消息").await?;
        Ok(resp.messages)
    }

    async fn regenerate_conversation(
        &self,
        character_id: &str,
    ) -> Result<RegenerateConversationResp> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/conversations/{}/regenerate", character_id),
            )
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("请求失败")?;
        handle_http_response::<RegenerateConversationResp>(response, "重新生成会话").await
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/messages/{}", message_id))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .context("请求失败")?;
        handle_http_response::<IgnoredAny>(response, "编辑消息").await?;
        Ok(())
    }

    async fn delete_from(&self, message_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/messages/{}/delete-from", message_id),
            )
            .send()
            .await
            .context("请求失败")?;
        handle_http_response::<IgnoredAny>(response, "删除消息").await?;
        Ok(())
    }

    async fn swipe_message(&self, message_id: &str, swipe_index: usize) -> Result<Message> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/messages/{}/swipe", message_id),
            )
            .json(&serde_json::json!({ "swipeIndex": swipe_index }))
            .send()
            .await
            .context("请求失败")?;
        let resp = handle_http_response::<MessageResp>(response, "切换变体").await?;
        Ok(resp.message)
    }

    async fn regenerate_message(&self, message_id: &str) -> Result<Message> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/messages/{}/regenerate", message_id),
            )
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("请求失败")?;
        let resp = handle_http_response::<MessageResp>(response, "重新生成消息").await?;
        Ok(resp.message)
    }

    async fn mark_read(&self, character_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/conversations/{}/mark-read", character_id),
            )
            .send()
            .await
            .context("请求失败")?;
        handle_http_response::<IgnoredAny>(response, "标记已读").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls_without_double_slash() {
        let client = HttpChatApi::build_client("t", Duration::from_secs(5)).unwrap();
        let api = HttpChatApi::new(client, "http://localhost:3000/api/".into());
        assert_eq!(
            api.url("/conversations/c1"),
            "http://localhost:3000/api/conversations/c1"
        );
    }
}
