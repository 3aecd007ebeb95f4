//! WebSocket 接入层 / WebSocket layer
//!
//! 每条连接一个 actor：独占传输句柄，读写两个泵加一次性优雅关闭。
//! One actor per connection: it owns the transport handle, runs the two
//! pumps, and closes gracefully exactly once.

pub mod connection;
pub mod handler;
pub mod server;

use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::registry::ConnectionRegistry;
use crate::service::delivery::DeliveryEngine;
use crate::service::message::MessageService;

/// 连接处理共享依赖 / Shared dependencies for connection handling
pub struct WsContext {
    pub registry: Arc<ConnectionRegistry>,
    pub service: Arc<MessageService>,
    pub engine: Arc<DeliveryEngine>,
    pub connection: ConnectionConfig,
}
