//! Postgres 存储后端 / Postgres storage backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::config::StorageConfig;
use crate::domain::message::{Message, MessageType, NewMessage, PushStatus};
use crate::error::{AppError, AppResult};
use crate::storage::MessageStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS t_message (
        id          TEXT PRIMARY KEY,
        type        SMALLINT NOT NULL,
        content     TEXT NOT NULL,
        "timestamp" BIGINT NOT NULL,
        dispatched  BOOLEAN NOT NULL DEFAULT FALSE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS t_user_message (
        user_id     TEXT NOT NULL,
        message_id  TEXT NOT NULL REFERENCES t_message (id),
        push_status SMALLINT NOT NULL DEFAULT 0,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, message_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_user_message_pending
        ON t_user_message (user_id, push_status)
    "#,
];

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub async fn connect(cfg: &StorageConfig) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> AppResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn row_to_message(row: &PgRow) -> AppResult<Message> {
    let type_code: i16 = row.try_get("type")?;
    let msg_type = MessageType::try_from(type_code as u8)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    let content: String = row.try_get("content")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(Message {
        id: row.try_get("id")?,
        msg_type,
        content: serde_json::from_str(&content)?,
        timestamp: row.try_get("timestamp")?,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn add(&self, user_ids: &[String], message: &NewMessage) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"INSERT INTO t_message (id, type, content, "timestamp")
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(&message.id)
        .bind(u8::from(message.msg_type) as i16)
        .bind(message.content.to_string())
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // 重复入库视为成功 / duplicate ingestion is success
            debug!("message {} already exists", message.id);
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query(
            r#"INSERT INTO t_user_message (user_id, message_id)
               SELECT u, $2 FROM UNNEST($1::text[]) AS u
               ON CONFLICT DO NOTHING"#,
        )
        .bind(user_ids)
        .bind(&message.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, message_id: &str) -> AppResult<(Message, Vec<String>)> {
        let row = sqlx::query(
            r#"SELECT id, type, content, "timestamp", created_at, updated_at
               FROM t_message WHERE id = $1"#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found(format!("message {}", message_id)))?;
        let message = row_to_message(&row)?;
        let recipients = self.recipients_of(message_id).await?;
        Ok((message, recipients))
    }

    async fn oldest_undispatched(&self) -> AppResult<(Message, Vec<String>)> {
        let row = sqlx::query(
            r#"SELECT id, type, content, "timestamp", created_at, updated_at
               FROM t_message
               WHERE dispatched = FALSE
               ORDER BY created_at ASC
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("pending message"))?;
        let message = row_to_message(&row)?;
        let recipients = self.recipients_of(&message.id).await?;
        Ok((message, recipients))
    }

    async fn pending_for_user(&self, user_id: &str, limit: u32) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"SELECT m.id, m.type, m.content, m."timestamp", m.created_at, m.updated_at
               FROM t_message m
               JOIN t_user_message um ON um.message_id = m.id
               WHERE um.user_id = $1 AND um.push_status = $2
               ORDER BY m.created_at ASC
               LIMIT $3"#,
        )
        .bind(user_id)
        .bind(i16::from(PushStatus::Unhandled))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn update_status(
        &self,
        user_id: &str,
        message_id: &str,
        status: PushStatus,
    ) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO t_user_message (user_id, message_id, push_status)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id, message_id)
               DO UPDATE SET push_status = EXCLUDED.push_status, updated_at = now()"#,
        )
        .bind(user_id)
        .bind(message_id)
        .bind(i16::from(status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dispatched(&self, message_id: &str) -> AppResult<()> {
        let updated = sqlx::query(
            r#"UPDATE t_message SET dispatched = TRUE, updated_at = now() WHERE id = $1"#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(AppError::not_found(format!("message {}", message_id)));
        }
        Ok(())
    }
}

impl PgMessageStore {
    async fn recipients_of(&self, message_id: &str) -> AppResult<Vec<String>> {
        let rows = sqlx::query(r#"SELECT user_id FROM t_user_message WHERE message_id = $1"#)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get("user_id").map_err(AppError::from))
            .collect()
    }
}
