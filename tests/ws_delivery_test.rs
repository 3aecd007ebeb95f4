//! 端到端推送流程集成测试 / End-to-end delivery flow integration tests
//!
//! 内存存储 + 回环地址上的真实 WebSocket 连接。
//! Memory store + real WebSocket connections over loopback.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use message_push::config::{ConnectionConfig, DeliveryConfig};
use message_push::domain::message::{PushMessageRequest, UserInfo};
use message_push::error::{AppError, AppResult};
use message_push::registry::ConnectionRegistry;
use message_push::service::delivery::DeliveryEngine;
use message_push::service::identify::IdentityService;
use message_push::service::message::MessageService;
use message_push::storage::memory::MemoryStore;
use message_push::ws::server::{serve_listener, ListenerKind};
use message_push::ws::WsContext;

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// 把 Authorization 头原样当作用户ID / Treats the Authorization header as the user id
struct StaticIdentity;

#[async_trait::async_trait]
impl IdentityService for StaticIdentity {
    async fn introspect(&self, authorization: &str) -> AppResult<UserInfo> {
        let token = authorization
            .strip_prefix("Bearer ")
            .unwrap_or(authorization);
        if token.is_empty() {
            return Err(AppError::auth("empty token"));
        }
        Ok(UserInfo {
            id: token.to_string(),
            org_id: "org-test".to_string(),
            name: format!("user-{}", token),
        })
    }
}

struct TestServer {
    port: u16,
    service: Arc<MessageService>,
    engine: Arc<DeliveryEngine>,
    registry: Arc<ConnectionRegistry>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server(kind: ListenerKind, connection: ConnectionConfig) -> TestServer {
    let delivery_cfg = DeliveryConfig::default();
    let service = Arc::new(MessageService::new(
        Arc::new(MemoryStore::new()),
        &delivery_cfg,
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = DeliveryEngine::start(
        service.clone(),
        registry.clone(),
        &delivery_cfg,
        shutdown_rx.clone(),
    );
    let ctx = Arc::new(WsContext {
        registry: registry.clone(),
        service: service.clone(),
        engine: engine.clone(),
        connection,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let identity: Arc<dyn IdentityService> = Arc::new(StaticIdentity);
    tokio::spawn(serve_listener(kind, listener, identity, ctx, shutdown_rx));

    TestServer {
        port,
        service,
        engine,
        registry,
        _shutdown: shutdown_tx,
    }
}

async fn connect_private(server: &TestServer, user_id: &str) -> Client {
    let url = format!(
        "ws://127.0.0.1:{}/ws/private?user_id={}",
        server.port, user_id
    );
    let (client, _) = connect_async(url).await.unwrap();
    wait_until_online(server, user_id).await;
    client
}

async fn wait_until_online(server: &TestServer, user_id: &str) {
    for _ in 0..100 {
        if server.registry.get(user_id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("user {} never showed up in the registry", user_id);
}

/// 读取下一条文本帧并解析信封，跳过心跳控制帧
/// Read the next text frame as an envelope, skipping heartbeat control frames
async fn recv_envelope(client: &mut Client) -> Value {
    let deadline = Duration::from_secs(2);
    loop {
        let frame = timeout(deadline, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed unexpectedly")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// 等待服务端关闭连接 / Wait for the server to close the connection
async fn expect_close(client: &mut Client) {
    let deadline = Duration::from_secs(2);
    loop {
        match timeout(deadline, client.next())
            .await
            .expect("timed out waiting for close")
        {
            None => return,
            Some(Err(_)) => return,
            Some(Ok(WsMessage::Close(_))) => return,
            Some(Ok(_)) => continue,
        }
    }
}

async fn ingest(server: &TestServer, id: &str, user_ids: &[&str], content: Value) {
    let request = PushMessageRequest {
        user_ids: user_ids.iter().map(|s| s.to_string()).collect(),
        content,
        id: Some(id.to_string()),
        timestamp: None,
    };
    server.service.ingest(&request).await.unwrap();
    server.engine.notify_new_message().await;
}

#[tokio::test]
async fn online_fan_out_and_offline_backlog() {
    let server = start_server(ListenerKind::Private, ConnectionConfig::default()).await;
    let mut alice = connect_private(&server, "alice").await;

    // bob 不在线 / bob is offline
    ingest(&server, "m1", &["alice", "bob"], json!({"text": "hi"})).await;

    let envelope = recv_envelope(&mut alice).await;
    assert_eq!(envelope["ID"], "m1");
    assert_eq!(envelope["Content"]["text"], "hi");

    // bob 上线即收到积压 / bob receives the backlog on connect
    let mut bob = connect_private(&server, "bob").await;
    let envelope = recv_envelope(&mut bob).await;
    assert_eq!(envelope["ID"], "m1");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server
        .service
        .pending_for_user("bob")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn backlog_is_drained_in_creation_order() {
    let server = start_server(ListenerKind::Private, ConnectionConfig::default()).await;

    ingest(&server, "m2", &["carol"], json!({"n": 2})).await;
    ingest(&server, "m3", &["carol"], json!({"n": 3})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut carol = connect_private(&server, "carol").await;
    assert_eq!(recv_envelope(&mut carol).await["ID"], "m2");
    assert_eq!(recv_envelope(&mut carol).await["ID"], "m3");
}

#[tokio::test]
async fn chat_room_frame_reaches_both_parties() {
    let server = start_server(ListenerKind::Private, ConnectionConfig::default()).await;
    let mut alice = connect_private(&server, "alice").await;
    let mut bob = connect_private(&server, "bob").await;

    let frame = json!({
        "id": "c1",
        "type": 3,
        "timestamp": 1_700_000_000_000_i64,
        "body": {"from": "alice", "to": "bob", "text": "hello bob"}
    });
    alice
        .send(WsMessage::Text(frame.to_string()))
        .await
        .unwrap();

    let to_bob = recv_envelope(&mut bob).await;
    assert_eq!(to_bob["ID"], "c1");
    assert_eq!(to_bob["Content"]["text"], "hello bob");
    // 发送方也是接收者 / the sender is a recipient too
    let to_alice = recv_envelope(&mut alice).await;
    assert_eq!(to_alice["ID"], "c1");
}

#[tokio::test]
async fn malformed_chat_room_frame_closes_the_connection() {
    let server = start_server(ListenerKind::Private, ConnectionConfig::default()).await;
    let mut alice = connect_private(&server, "alice").await;

    let frame = json!({
        "id": "bad1",
        "type": 3,
        "timestamp": 1_700_000_000_000_i64,
        "body": {"from": "alice"}
    });
    alice
        .send(WsMessage::Text(frame.to_string()))
        .await
        .unwrap();

    expect_close(&mut alice).await;
    // 违规帧未入库，连接已从注册表摘除
    // Nothing was persisted and the actor is gone from the registry
    assert!(server.service.get_by_id("bad1").await.is_err());
    for _ in 0..100 {
        if server.registry.get("alice").is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("alice still registered after protocol violation");
}

#[tokio::test]
async fn silent_client_is_disconnected_by_the_read_deadline() {
    let connection = ConnectionConfig {
        read_timeout_ms: 300,
        ..ConnectionConfig::default()
    };
    let server = start_server(ListenerKind::Private, connection).await;
    let _dave = connect_private(&server, "dave").await;

    // 不读也不写：客户端从不回pong，读限期触发断开
    // Never read or write: no pong ever arrives, the read deadline fires
    for _ in 0..100 {
        if server.registry.get("dave").is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("dave was not disconnected by the read deadline");
}

#[tokio::test]
async fn reconnect_evicts_the_previous_connection() {
    let server = start_server(ListenerKind::Private, ConnectionConfig::default()).await;
    let mut first = connect_private(&server, "eve").await;
    let first_conn_id = server.registry.get("eve").unwrap().conn_id().to_string();

    let mut second = connect_private(&server, "eve").await;

    // 旧连接收到关闭帧，注册表只保留新连接
    // The old socket gets a close frame; only the new actor stays registered
    expect_close(&mut first).await;
    for _ in 0..100 {
        let current = server.registry.get("eve").expect("eve must stay registered");
        if current.conn_id() != first_conn_id {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.registry.len(), 1);

    ingest(&server, "m9", &["eve"], json!({"n": 9})).await;
    assert_eq!(recv_envelope(&mut second).await["ID"], "m9");
}

#[tokio::test]
async fn public_listener_authenticates_via_introspection() {
    let server = start_server(ListenerKind::Public, ConnectionConfig::default()).await;

    // 带鉴权头的握手成功 / handshake with the auth header succeeds
    let mut request = format!("ws://127.0.0.1:{}/ws/public", server.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer frank".parse().unwrap());
    let (mut frank, _) = connect_async(request).await.unwrap();
    wait_until_online(&server, "frank").await;

    ingest(&server, "m1", &["frank"], json!({"text": "hi"})).await;
    assert_eq!(recv_envelope(&mut frank).await["ID"], "m1");

    // 缺少鉴权头的连接被立即关闭 / a connection without the header is closed at once
    let url = format!("ws://127.0.0.1:{}/ws/public", server.port);
    let (mut anon, _) = connect_async(url).await.unwrap();
    expect_close(&mut anon).await;
    assert_eq!(server.registry.len(), 1);
}
