//! 入站帧分发 / Inbound frame dispatch
//!
//! 按声明的 type 分发：Ack 接受并忽略；ChatRoom 校验 from/to 后整体入库并
//! 唤醒推送引擎；其余一律按协议违规断开。
//! Dispatch by the declared type: Ack is accepted and ignored; ChatRoom is
//! validated (from/to) then stored verbatim and the delivery engine is
//! signaled; anything else is a protocol violation.

use tracing::debug;

use crate::domain::message::{ChatRoomBody, ClientFrame, MessageType};
use crate::error::{AppError, AppResult};
use crate::ws::connection::WsConn;
use crate::ws::WsContext;

pub async fn handle_client_frame(text: &str, conn: &WsConn, ctx: &WsContext) -> AppResult<()> {
    let frame: ClientFrame = serde_json::from_str(text)
        .map_err(|e| AppError::protocol(format!("malformed frame: {}", e)))?;
    let frame_type = MessageType::try_from(frame.frame_type).map_err(AppError::protocol)?;

    match frame_type {
        MessageType::Ack => {
            // 应用层确认，核心侧无需动作 / application-level ack, nothing to do here
            debug!("ack {} from user {}", frame.id, conn.user.id);
            Ok(())
        }
        MessageType::ChatRoom => {
            let body = frame
                .body
                .as_ref()
                .ok_or_else(|| AppError::protocol("body is required"))?;
            let chat = ChatRoomBody::parse(body)?;
            let recipients = vec![chat.from, chat.to];
            ctx.service
                .add(
                    MessageType::ChatRoom,
                    &recipients,
                    &frame.id,
                    chat.raw,
                    frame.timestamp_millis(),
                )
                .await?;
            ctx.engine.notify_new_message().await;
            Ok(())
        }
        MessageType::ToUsers => Err(AppError::protocol(format!(
            "unexpected inbound message type {}",
            frame.frame_type
        ))),
    }
}
