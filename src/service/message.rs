//! 消息服务 / Message service
//!
//! 存储之上的薄领域层：统一入库入口（重复ID由存储层幂等吸收）、
//! 待推送查询与状态更新。
//! Thin domain layer over the store: the single ingestion entry point
//! (duplicate ids are absorbed idempotently by the store), pending queries
//! and status updates.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::domain::message::{Message, MessageType, NewMessage, PushMessageRequest, PushStatus};
use crate::error::{AppError, AppResult};
use crate::storage::MessageStore;

pub struct MessageService {
    store: Arc<dyn MessageStore>,
    login_batch_limit: u32,
}

impl MessageService {
    pub fn new(store: Arc<dyn MessageStore>, cfg: &DeliveryConfig) -> Self {
        Self {
            store,
            login_batch_limit: cfg.login_batch_limit,
        }
    }

    /// 入库一条消息及其接收者 / Persist one message and its recipients
    pub async fn add(
        &self,
        msg_type: MessageType,
        user_ids: &[String],
        message_id: &str,
        content: Value,
        timestamp: i64,
    ) -> AppResult<()> {
        let message = NewMessage {
            id: message_id.to_string(),
            msg_type,
            content,
            timestamp,
        };
        self.store.add(user_ids, &message).await
    }

    /// 摄取事件入口（HTTP适配器与队列消费者共用）
    /// Ingestion-event entry point (shared by the HTTP adapter and any queue consumer)
    pub async fn ingest(&self, request: &PushMessageRequest) -> AppResult<String> {
        if request.user_ids.is_empty() || request.user_ids.iter().any(|u| u.is_empty()) {
            return Err(AppError::validation(
                "user_ids",
                "must be a non-empty list of user ids",
            ));
        }
        if !request.content.is_object() {
            return Err(AppError::validation("content", "must be an object"));
        }
        let message_id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = request
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        self.add(
            MessageType::ToUsers,
            &request.user_ids,
            &message_id,
            request.content.clone(),
            timestamp,
        )
        .await?;
        Ok(message_id)
    }

    pub async fn get_by_id(&self, message_id: &str) -> AppResult<(Message, Vec<String>)> {
        self.store.get_by_id(message_id).await
    }

    pub async fn oldest_undispatched(&self) -> AppResult<(Message, Vec<String>)> {
        self.store.oldest_undispatched().await
    }

    /// 用户待推送消息，批大小为配置的登录补发上限
    /// The user's pending batch, capped at the configured login-drain limit
    pub async fn pending_for_user(&self, user_id: &str) -> AppResult<Vec<Message>> {
        self.store
            .pending_for_user(user_id, self.login_batch_limit)
            .await
    }

    pub async fn update_status(
        &self,
        user_id: &str,
        message_id: &str,
        status: PushStatus,
    ) -> AppResult<()> {
        self.store.update_status(user_id, message_id, status).await
    }

    pub async fn mark_dispatched(&self, message_id: &str) -> AppResult<()> {
        self.store.mark_dispatched(message_id).await
    }

    /// 出站帧编码 / Outbound frame encoding
    pub fn encode(message: &Message) -> AppResult<String> {
        Ok(serde_json::to_string(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use serde_json::json;

    fn service() -> MessageService {
        MessageService::new(Arc::new(MemoryStore::new()), &DeliveryConfig::default())
    }

    #[tokio::test]
    async fn ingest_rejects_bad_shapes() {
        let svc = service();

        let no_users = PushMessageRequest {
            user_ids: vec![],
            content: json!({"k": "v"}),
            id: None,
            timestamp: None,
        };
        assert!(svc.ingest(&no_users).await.is_err());

        let bad_content = PushMessageRequest {
            user_ids: vec!["a".into()],
            content: json!("not an object"),
            id: None,
            timestamp: None,
        };
        assert!(svc.ingest(&bad_content).await.is_err());
    }

    #[tokio::test]
    async fn ingest_replay_with_same_id_is_idempotent() {
        let svc = service();
        let request = PushMessageRequest {
            user_ids: vec!["a".into(), "b".into()],
            content: json!({"k": "v"}),
            id: Some("m4".into()),
            timestamp: None,
        };
        assert_eq!(svc.ingest(&request).await.unwrap(), "m4");
        assert_eq!(svc.ingest(&request).await.unwrap(), "m4");

        let (_, recipients) = svc.get_by_id("m4").await.unwrap();
        assert_eq!(recipients.len(), 2);
        assert_eq!(svc.pending_for_user("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingest_generates_an_id_when_absent() {
        let svc = service();
        let request = PushMessageRequest {
            user_ids: vec!["a".into()],
            content: json!({"k": "v"}),
            id: None,
            timestamp: None,
        };
        let id = svc.ingest(&request).await.unwrap();
        assert!(!id.is_empty());
        assert!(svc.get_by_id(&id).await.is_ok());
    }
}
