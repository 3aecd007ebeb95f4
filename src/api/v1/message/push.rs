use actix_web::{web, Responder};

use crate::api::ApiState;
use crate::domain::message::{PushMessageRequest, PushMessageResponse};
use crate::error::AppError;

pub const ROUTE_PATH: &str = "/api/v1/message/push";

// 路由注册入口（POST）
// Route registration entry (POST)
pub fn register(cfg: &mut actix_web::web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(message_push_handle)));
}

// 消息摄取接口：入库后唤醒新消息扇出协程
// Message ingestion API: persist, then wake the new-message worker
pub async fn message_push_handle(
    state: web::Data<ApiState>,
    request: web::Json<PushMessageRequest>,
) -> Result<impl Responder, AppError> {
    let message_id = state.service.ingest(&request).await?;
    state.engine.notify_new_message().await;
    Ok(web::Json(PushMessageResponse {
        success: true,
        message: "ok".to_string(),
        message_id: Some(message_id),
    }))
}
