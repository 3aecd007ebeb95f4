//! message-push
//!
//! 面向用户的消息推送服务：消息经队列事件或在线客户端进入，持久化后
//! 向在线接收者即时扇出；离线接收者的消息保持待处理，用户重连时按
//! 创建时间顺序补发（store-and-forward）。
//! Store-and-forward message push: messages arrive from queue events or
//! connected clients, are persisted, then fanned out to online recipients
//! immediately; offline recipients get their backlog, in creation-time
//! order, on their next connection.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod registry;
pub mod service;
pub mod signal;
pub mod storage;
pub mod ws;
