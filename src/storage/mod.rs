//! 存储模块 / Storage module
//!
//! 消息与按接收者的推送状态的持久化契约。消息行与全部接收者状态行必须原子落库，
//! 重复的消息ID按成功处理（容忍上游 at-least-once 重投）。
//! Persistence contract for messages and per-recipient delivery status. The
//! message row and all recipient rows land atomically; a duplicate message id
//! is treated as success (tolerates at-least-once upstream redelivery).

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::domain::message::{Message, NewMessage, PushStatus};
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 入库消息及其接收者状态行，原子，重复ID幂等
    /// Persist the message and its recipient rows atomically; duplicate id is a no-op
    async fn add(&self, user_ids: &[String], message: &NewMessage) -> AppResult<()>;

    /// 按ID取消息与接收者 / Fetch a message and its recipients by id
    async fn get_by_id(&self, message_id: &str) -> AppResult<(Message, Vec<String>)>;

    /// 最早一条尚未经过扇出的消息 / Oldest message whose fan-out pass has not run
    async fn oldest_undispatched(&self) -> AppResult<(Message, Vec<String>)>;

    /// 某用户待推送消息，按创建时间升序，最多 limit 条
    /// A user's pending messages, creation time ascending, capped at limit
    async fn pending_for_user(&self, user_id: &str, limit: u32) -> AppResult<Vec<Message>>;

    /// 更新 (user, message) 的推送状态，幂等
    /// Upsert the status for the (user, message) pair; idempotent
    async fn update_status(
        &self,
        user_id: &str,
        message_id: &str,
        status: PushStatus,
    ) -> AppResult<()>;

    /// 标记消息的扇出已完成 / Mark the message's fan-out pass complete
    async fn mark_dispatched(&self, message_id: &str) -> AppResult<()>;
}

/// 按配置构建存储后端 / Build the storage backend from configuration
pub async fn build(cfg: &StorageConfig) -> AppResult<Arc<dyn MessageStore>> {
    match cfg.backend.as_str() {
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        "postgres" => Ok(Arc::new(postgres::PgMessageStore::connect(cfg).await?)),
        other => Err(AppError::validation(
            "storage.backend",
            format!("unknown backend: {}", other),
        )),
    }
}
