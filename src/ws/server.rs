//! WS 监听 / WS listeners
//!
//! 公网监听在握手时捕获 Authorization 头并调用身份内省；内网监听信任
//! URL 查询里的 user_id。鉴权失败只关闭该连接。
//! The public listener captures the Authorization header at handshake time
//! and calls identity introspection; the private listener trusts the
//! user_id query parameter. Auth failure closes that connection only.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{error, info, warn};

use crate::domain::message::UserInfo;
use crate::error::{AppError, AppResult};
use crate::service::identify::IdentityService;
use crate::ws::{connection, WsContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// 需要身份内省 / Requires identity introspection
    Public,
    /// 信任 user_id 查询参数 / Trusts the user_id query parameter
    Private,
}

/// 绑定地址并进入接受循环 / Bind the address and enter the accept loop
pub async fn run_listener(
    kind: ListenerKind,
    addr: String,
    identity: Arc<dyn IdentityService>,
    ctx: Arc<WsContext>,
    shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let listener = TcpListener::bind(&addr).await?;
    serve_listener(kind, listener, identity, ctx, shutdown).await
}

/// 已绑定监听器上的接受循环，收到停机信号后退出并关闭所有连接
/// Accept loop over a bound listener; exits on the shutdown signal and
/// closes every actor
pub async fn serve_listener(
    kind: ListenerKind,
    listener: TcpListener,
    identity: Arc<dyn IdentityService>,
    ctx: Arc<WsContext>,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let addr = listener.local_addr()?;
    info!("🚀 {:?} WebSocket listener on {}", kind, addr);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let identity = identity.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_handshake(kind, stream, peer_addr, identity, ctx).await;
                        });
                    }
                    Err(e) => {
                        error!("accept error on {}: {}", addr, e);
                    }
                }
            }
        }
    }
    ctx.registry.close_all();
    info!("{:?} WebSocket listener on {} stopped", kind, addr);
    Ok(())
}

async fn handle_handshake(
    kind: ListenerKind,
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
    identity: Arc<dyn IdentityService>,
    ctx: Arc<WsContext>,
) {
    // 在握手回调里捕获路径与鉴权头 / capture path and auth header in the handshake callback
    let mut uri = String::new();
    let mut authorization: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        uri = req.uri().to_string();
        authorization = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };

    let mut ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("handshake from {} failed: {}", peer_addr, e);
            return;
        }
    };

    let user = match resolve_user(kind, &uri, authorization.as_deref(), identity.as_ref()).await {
        Ok(user) => user,
        Err(e) => {
            warn!("auth failed for {}: {}", peer_addr, e);
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "unauthorized".into(),
                }))
                .await;
            return;
        }
    };

    info!("user {} connected from {}", user.id, peer_addr);
    connection::serve(ws_stream, user, ctx).await;
}

async fn resolve_user(
    kind: ListenerKind,
    uri: &str,
    authorization: Option<&str>,
    identity: &dyn IdentityService,
) -> AppResult<UserInfo> {
    match kind {
        ListenerKind::Private => {
            let user_id = query_param(uri, "user_id")
                .ok_or_else(|| AppError::validation("user_id", "user_id is required"))?;
            Ok(UserInfo {
                name: format!("private-{}", user_id),
                org_id: String::new(),
                id: user_id,
            })
        }
        ListenerKind::Public => {
            let auth =
                authorization.ok_or_else(|| AppError::auth("Authorization is required"))?;
            identity.introspect(auth).await
        }
    }
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}
