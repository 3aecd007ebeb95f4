//! 内存存储后端 / In-memory storage backend
//!
//! 单进程部署与测试用，契约与 postgres 后端一致。
//! For single-process deployments and tests; contract-identical to the
//! postgres backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::message::{Message, NewMessage, PushStatus};
use crate::error::{AppError, AppResult};
use crate::storage::MessageStore;

struct StoredMessage {
    message: Message,
    recipients: Vec<String>,
    dispatched: bool,
    /// 入库顺序，创建时间相同的消息按此定序 / Insertion order, breaks created_at ties
    seq: u64,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<String, StoredMessage>,
    records: HashMap<(String, String), PushStatus>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn add(&self, user_ids: &[String], message: &NewMessage) -> AppResult<()> {
        let mut inner = self.inner.write();
        if inner.messages.contains_key(&message.id) {
            debug!("message {} already exists", message.id);
            return Ok(());
        }
        let now = Utc::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        for user_id in user_ids {
            inner
                .records
                .insert((user_id.clone(), message.id.clone()), PushStatus::Unhandled);
        }
        inner.messages.insert(
            message.id.clone(),
            StoredMessage {
                message: Message {
                    id: message.id.clone(),
                    msg_type: message.msg_type,
                    content: message.content.clone(),
                    timestamp: message.timestamp,
                    created_at: now,
                    updated_at: now,
                },
                recipients: user_ids.to_vec(),
                dispatched: false,
                seq,
            },
        );
        Ok(())
    }

    async fn get_by_id(&self, message_id: &str) -> AppResult<(Message, Vec<String>)> {
        let inner = self.inner.read();
        let stored = inner
            .messages
            .get(message_id)
            .ok_or_else(|| AppError::not_found(format!("message {}", message_id)))?;
        Ok((stored.message.clone(), stored.recipients.clone()))
    }

    async fn oldest_undispatched(&self) -> AppResult<(Message, Vec<String>)> {
        let inner = self.inner.read();
        inner
            .messages
            .values()
            .filter(|s| !s.dispatched)
            .min_by_key(|s| s.seq)
            .map(|s| (s.message.clone(), s.recipients.clone()))
            .ok_or_else(|| AppError::not_found("pending message"))
    }

    async fn pending_for_user(&self, user_id: &str, limit: u32) -> AppResult<Vec<Message>> {
        let inner = self.inner.read();
        let mut pending: Vec<&StoredMessage> = inner
            .records
            .iter()
            .filter(|((uid, _), status)| uid == user_id && **status == PushStatus::Unhandled)
            .filter_map(|((_, mid), _)| inner.messages.get(mid))
            .collect();
        pending.sort_by_key(|s| s.seq);
        pending.truncate(limit as usize);
        Ok(pending.into_iter().map(|s| s.message.clone()).collect())
    }

    async fn update_status(
        &self,
        user_id: &str,
        message_id: &str,
        status: PushStatus,
    ) -> AppResult<()> {
        let mut inner = self.inner.write();
        inner
            .records
            .insert((user_id.to_string(), message_id.to_string()), status);
        Ok(())
    }

    async fn mark_dispatched(&self, message_id: &str) -> AppResult<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| AppError::not_found(format!("message {}", message_id)))?;
        stored.dispatched = true;
        stored.message.updated_at = Utc::now();
        Ok(())
    }
}
