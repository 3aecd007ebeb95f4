use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// 统一的应用错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("认证错误: {message}")]
    Auth { message: String },

    #[error("协议错误: {message}")]
    Protocol { message: String },

    #[error("验证错误: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("外部服务错误: {service}: {message}")]
    ExternalService { service: String, message: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// 创建协议错误
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// 创建验证错误
    pub fn validation<T: Into<String>, U: Into<String>>(field: T, message: U) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建外部服务错误
    pub fn external_service<T: Into<String>, U: Into<String>>(service: T, message: U) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// 创建资源未找到错误
    pub fn not_found<T: Into<String>>(resource: T) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// 获取HTTP状态码
    pub fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth { .. } => StatusCode::UNAUTHORIZED,
            AppError::Protocol { .. } => StatusCode::BAD_REQUEST,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();

        match self {
            AppError::Internal(_) | AppError::Database(_) | AppError::Serialize(_) => {
                tracing::error!("Internal error: {}", message);
            }
            AppError::ExternalService { .. } => {
                tracing::warn!("External service error: {}", message);
            }
            _ => {
                tracing::info!("Client error: {}", message);
            }
        }

        HttpResponse::build(status).json(json!({
            "success": false,
            "error": {
                "message": message,
            },
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

/// 应用结果类型
pub type AppResult<T> = Result<T, AppError>;
