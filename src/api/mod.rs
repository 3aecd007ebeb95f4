//! HTTP 接口 / HTTP API

pub mod v1;

use std::sync::Arc;

use actix_web::web;

use crate::registry::ConnectionRegistry;
use crate::service::delivery::DeliveryEngine;
use crate::service::message::MessageService;

/// HTTP处理共享状态 / Shared state for HTTP handlers
pub struct ApiState {
    pub service: Arc<MessageService>,
    pub engine: Arc<DeliveryEngine>,
    pub registry: Arc<ConnectionRegistry>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    v1::message::push::register(cfg, v1::message::push::ROUTE_PATH);
    v1::health::basic::register(cfg, v1::health::basic::ROUTE_PATH);
}
