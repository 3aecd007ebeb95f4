//! 消息领域模型 / Message domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// 消息类型，整数编码与入站帧的 type 字段一致
/// Message type, integer-coded to match the inbound frame `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    /// 消息确认 / Application-level acknowledgement
    Ack,
    /// 推送给指定用户集合 / Push to a set of users
    ToUsers,
    /// 聊天室消息 / Chat-room message
    ChatRoom,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Ack => 1,
            MessageType::ToUsers => 2,
            MessageType::ChatRoom => 3,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(MessageType::Ack),
            2 => Ok(MessageType::ToUsers),
            3 => Ok(MessageType::ChatRoom),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

/// 推送状态 / Delivery status per (user, message) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// 待处理 / Pending
    Unhandled,
    /// 推送中 / Sending
    Sending,
    /// 推送成功 / Delivered
    Success,
    /// 推送失败 / Failed
    Failed,
}

impl From<PushStatus> for i16 {
    fn from(s: PushStatus) -> i16 {
        match s {
            PushStatus::Unhandled => 0,
            PushStatus::Sending => 1,
            PushStatus::Success => 2,
            PushStatus::Failed => 3,
        }
    }
}

impl TryFrom<i16> for PushStatus {
    type Error = String;

    fn try_from(v: i16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PushStatus::Unhandled),
            1 => Ok(PushStatus::Sending),
            2 => Ok(PushStatus::Success),
            3 => Ok(PushStatus::Failed),
            other => Err(format!("unknown push status {}", other)),
        }
    }
}

/// 持久化后的消息，同时是出站帧的信封
/// Persisted message, also the outbound frame envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub msg_type: MessageType,
    #[serde(rename = "Content")]
    pub content: Value,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// 待入库的消息 / Message to be persisted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub msg_type: MessageType,
    pub content: Value,
    /// 生产方的事件时间（毫秒）/ Producer-assigned event time (ms)
    pub timestamp: i64,
}

/// 已解析身份 / Resolved user identity
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: String,
    pub org_id: String,
    pub name: String,
}

/// 入站客户端帧 / Inbound client frame
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: u8,
    pub timestamp: serde_json::Number,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ClientFrame {
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp
            .as_i64()
            .or_else(|| self.timestamp.as_f64().map(|f| f as i64))
            .unwrap_or_default()
    }
}

/// 聊天室帧体，from/to 为必填字段，整体原样入库
/// Chat-room frame body; from/to are required, the whole body is stored verbatim
#[derive(Debug, Clone)]
pub struct ChatRoomBody {
    pub from: String,
    pub to: String,
    pub raw: Value,
}

impl ChatRoomBody {
    pub fn parse(body: &Value) -> Result<Self, AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| AppError::protocol("body is not an object"))?;
        let from = obj
            .get("from")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::protocol("body.from is not a string"))?;
        let to = obj
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::protocol("body.to is not a string"))?;
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            raw: body.clone(),
        })
    }
}

/// 推送消息请求（HTTP入口，对应队列事件的 {user_ids, content}）
/// Push message request (HTTP entry, mirrors the queue event {user_ids, content})
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessageRequest {
    pub user_ids: Vec<String>,
    pub content: Value,
    /// 可选的幂等ID，缺省生成 / Optional idempotency id, generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessageResponse {
    pub success: bool,
    pub message: String,
    pub message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trip() {
        for t in [MessageType::Ack, MessageType::ToUsers, MessageType::ChatRoom] {
            assert_eq!(MessageType::try_from(u8::from(t)).unwrap(), t);
        }
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let msg = Message {
            id: "m1".into(),
            msg_type: MessageType::ToUsers,
            content: serde_json::json!({"hello": "world"}),
            timestamp: 1_700_000_000_000,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let v: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["ID"], "m1");
        assert_eq!(v["Type"], 2);
        assert_eq!(v["Content"]["hello"], "world");
        assert!(v.get("Timestamp").is_some());
        assert!(v.get("CreatedAt").is_some());
        assert!(v.get("UpdatedAt").is_some());
    }

    #[test]
    fn client_frame_accepts_float_timestamp() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"id":"f1","type":1,"timestamp":1700000000000.0}"#).unwrap();
        assert_eq!(frame.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(frame.frame_type, 1);
    }

    #[test]
    fn chat_room_body_requires_from_and_to() {
        let ok = serde_json::json!({"from": "a", "to": "b", "text": "hi"});
        let body = ChatRoomBody::parse(&ok).unwrap();
        assert_eq!(body.from, "a");
        assert_eq!(body.to, "b");
        assert_eq!(body.raw["text"], "hi");

        let missing_to = serde_json::json!({"from": "a"});
        assert!(ChatRoomBody::parse(&missing_to).is_err());
        let not_object = serde_json::json!("nope");
        assert!(ChatRoomBody::parse(&not_object).is_err());
    }
}
