use actix_web::{web, Responder};
use serde_json::json;

use crate::api::ApiState;

pub const ROUTE_PATH: &str = "/api/v1/health/basic";

// 路由注册入口（GET）
// Route registration entry (GET)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(health_basic_handle)));
}

// 基础健康检查
// Basic health check
pub async fn health_basic_handle(state: web::Data<ApiState>) -> impl Responder {
    web::Json(json!({
        "status": "ok",
        "online_connections": state.registry.len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
