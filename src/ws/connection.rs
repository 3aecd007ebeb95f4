//! 连接 actor / Connection actor
//!
//! 生命周期：Alive -> Closing -> Closed。入站泵在滚动读超时下读帧，
//! 出站泵在心跳、关闭信号与出站队列之间 select。关闭是幂等的单次触发，
//! 两个泵都退出后才释放传输句柄。
//! Lifecycle: Alive -> Closing -> Closed. The inbound pump reads under a
//! rolling read deadline; the outbound pump selects over heartbeat, the
//! close signal and the outbound queue. Close is an idempotent one-shot;
//! the transport is released only after both pumps have exited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::domain::message::UserInfo;
use crate::error::{AppError, AppResult};
use crate::ws::{handler, WsContext};

/// 连接 actor 的共享句柄 / Shared handle of a connection actor
pub struct WsConn {
    pub user: UserInfo,
    conn_id: String,
    outbound: mpsc::Sender<String>,
    alive: AtomicBool,
    close_tx: watch::Sender<bool>,
}

/// 泵侧的接收端，交给连接驱动或测试直接消费
/// Pump-side receivers, consumed by the connection driver or by tests
pub struct ConnPumps {
    pub outbound_rx: mpsc::Receiver<String>,
    pub close_rx: watch::Receiver<bool>,
}

impl WsConn {
    pub fn new(user: UserInfo, outbound_capacity: usize) -> (Arc<Self>, ConnPumps) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity);
        let (close_tx, close_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            user,
            conn_id: Uuid::new_v4().to_string(),
            outbound,
            alive: AtomicBool::new(true),
            close_tx,
        });
        (
            conn,
            ConnPumps {
                outbound_rx,
                close_rx,
            },
        )
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// 订阅关闭信号 / Subscribe to the close signal
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// 触发优雅关闭，幂等 / Trigger graceful close, idempotent
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.close_tx.send_replace(true);
        }
    }

    /// 入队一条出站消息。连接已关闭返回 false；队列满时丢弃并告警
    /// （记录保持待处理，由之后的登录补发重投）。
    /// Enqueue one outbound payload. Returns false once closing/closed;
    /// a full queue drops the payload with a warning (the record stays
    /// pending and a later login drain re-delivers it).
    pub fn send(&self, payload: String) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.outbound.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "outbound queue full for user {}, dropping payload",
                    self.user.id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// 驱动一条已完成握手和鉴权的连接，两个泵都退出后返回
/// Drive an accepted, authenticated connection; returns after both pumps exit
pub async fn serve(stream: WebSocketStream<TcpStream>, user: UserInfo, ctx: Arc<WsContext>) {
    let user_id = user.id.clone();
    let (conn, pumps) = WsConn::new(user, ctx.connection.outbound_capacity);
    let (sink, ws_rx) = stream.split();

    let write_task = tokio::spawn(write_pump(
        conn.clone(),
        sink,
        pumps.outbound_rx,
        pumps.close_rx,
        ctx.connection.clone(),
    ));

    // 注册即逐出同一用户的旧连接 / registering evicts the user's previous actor
    ctx.registry.add(conn.clone());
    ctx.engine.notify_user_login(&user_id).await;

    if let Err(e) = read_pump(ws_rx, &conn, &ctx).await {
        warn!("closing connection for user {}: {}", user_id, e);
    }

    conn.close();
    ctx.registry.remove_conn(&conn);
    let _ = write_task.await;
    info!("user {} disconnected", user_id);
}

/// 入站泵 / Inbound pump
///
/// 收到任意帧（含pong）都会刷新读限期；读超时、对端关闭或协议违规都会终止连接。
/// Any received frame (pong included) refreshes the read deadline; a read
/// timeout, peer close or protocol violation terminates the connection.
async fn read_pump(
    mut ws_rx: SplitStream<WebSocketStream<TcpStream>>,
    conn: &Arc<WsConn>,
    ctx: &WsContext,
) -> AppResult<()> {
    let mut close_rx = conn.closed();
    let read_timeout = ctx.connection.read_timeout();
    loop {
        tokio::select! {
            _ = close_rx.changed() => return Ok(()),
            next = tokio::time::timeout(read_timeout, ws_rx.next()) => {
                let frame = match next {
                    Err(_) => {
                        warn!("read deadline exceeded for user {}", conn.user.id);
                        return Ok(());
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(Err(e))) => {
                        // 对端异常断开 / abnormal peer disconnect
                        error!("read message error for user {}: {}", conn.user.id, e);
                        return Ok(());
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    WsMessage::Pong(_) | WsMessage::Ping(_) => {}
                    WsMessage::Close(close_frame) => {
                        if let Some(cf) = close_frame {
                            if cf.code != CloseCode::Normal && cf.code != CloseCode::Away {
                                error!(
                                    "abnormal close from user {}: {:?} {}",
                                    conn.user.id, cf.code, cf.reason
                                );
                            }
                        }
                        return Ok(());
                    }
                    WsMessage::Text(text) => {
                        debug!("receive message from user {}: {}", conn.user.id, text);
                        handler::handle_client_frame(&text, conn, ctx).await?;
                    }
                    WsMessage::Binary(_) => {
                        return Err(AppError::protocol("unexpected binary frame"));
                    }
                    WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

/// 出站泵 / Outbound pump
async fn write_pump(
    conn: Arc<WsConn>,
    mut sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut close_rx: watch::Receiver<bool>,
    cfg: ConnectionConfig,
) {
    let write_timeout = cfg.write_timeout();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + cfg.heartbeat_interval(),
        cfg.heartbeat_interval(),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = write_frame(&mut sink, WsMessage::Ping(Vec::new()), write_timeout).await {
                    error!("write ping error for user {}: {}", conn.user.id, e);
                    break;
                }
            }
            _ = close_rx.changed() => {
                let close = WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "server close".into(),
                }));
                if let Err(e) = write_frame(&mut sink, close, write_timeout).await {
                    debug!("write close message error for user {}: {}", conn.user.id, e);
                }
                break;
            }
            item = outbound_rx.recv() => {
                let Some(payload) = item else { break };
                if let Err(e) = write_frame(&mut sink, WsMessage::Text(payload), write_timeout).await {
                    error!("write message error for user {}: {}", conn.user.id, e);
                    break;
                }
            }
        }
    }
    // 写泵退出即触发整体关闭，读泵随之退出 / pump exit triggers the close, waking the read pump
    conn.close();
}

async fn write_frame(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    frame: WsMessage,
    timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(timeout, sink.send(frame))
        .await
        .map_err(|_| anyhow::anyhow!("write timeout"))??;
    Ok(())
}
