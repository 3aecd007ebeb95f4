//! 身份内省客户端 / Identity introspection client
//!
//! 公网握手凭 Authorization 头换取已解析身份；失败只拒绝该次握手，
//! 不影响进程。
//! The public handshake trades the Authorization header for a resolved
//! identity; failure rejects that handshake only, never the process.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::IdentifyConfig;
use crate::domain::message::UserInfo;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// 令牌内省 / Token introspection
    async fn introspect(&self, authorization: &str) -> AppResult<UserInfo>;
}

pub struct HttpIdentityService {
    addr: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IntrospectResponse {
    user_id: String,
    #[serde(default)]
    org_id: String,
    #[serde(default)]
    user_name: String,
}

impl HttpIdentityService {
    pub fn new(cfg: &IdentifyConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| AppError::external_service("identify-service", e.to_string()))?;
        Ok(Self {
            addr: cfg.addr.clone(),
            client,
        })
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn introspect(&self, authorization: &str) -> AppResult<UserInfo> {
        let url = format!("{}/api/v1/identify-service/token/introspect", self.addr);
        let response = self
            .client
            .post(&url)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|e| AppError::external_service("identify-service", e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::auth(format!(
                "introspect rejected: {}",
                response.status()
            )));
        }
        let body: IntrospectResponse = response
            .json()
            .await
            .map_err(|e| AppError::external_service("identify-service", e.to_string()))?;
        Ok(UserInfo {
            id: body.user_id,
            org_id: body.org_id,
            name: body.user_name,
        })
    }
}
