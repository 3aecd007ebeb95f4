//! 推送引擎 / Delivery engine
//!
//! 两个互不共享可变状态的工作协程：新消息扇出与登录补发。二者只依赖
//! 存储与连接注册表，信号只负责唤醒，权威状态始终从存储重新推导，
//! 因此重复或乱序的信号是无害的。
//! Two workers sharing no mutable state: new-message fan-out and per-login
//! backlog drain. Both lean only on the store and the registry; signals
//! merely wake them, the authoritative state is always re-derived from the
//! store, so duplicate or re-ordered signals are harmless.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, warn};

use crate::config::DeliveryConfig;
use crate::domain::message::{Message, PushStatus};
use crate::registry::ConnectionRegistry;
use crate::service::message::MessageService;
use crate::signal::SignalQueue;

pub struct DeliveryEngine {
    service: Arc<MessageService>,
    registry: Arc<ConnectionRegistry>,
    new_message: SignalQueue<()>,
    user_login: SignalQueue<String>,
    /// 限制并发补发任务数 / Caps concurrent drain tasks
    drain_permits: Arc<Semaphore>,
}

impl DeliveryEngine {
    /// 构建引擎并启动两个工作协程，随 shutdown 信号退出
    /// Build the engine and start both workers; they exit on the shutdown signal
    pub fn start(
        service: Arc<MessageService>,
        registry: Arc<ConnectionRegistry>,
        cfg: &DeliveryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (new_message, new_message_rx) = SignalQueue::bounded(
            "new_message",
            cfg.new_message_signal_capacity,
            cfg.signal_overflow,
        );
        let (user_login, user_login_rx) = SignalQueue::bounded(
            "user_login",
            cfg.user_login_signal_capacity,
            cfg.signal_overflow,
        );
        let engine = Arc::new(Self {
            service,
            registry,
            new_message,
            user_login,
            drain_permits: Arc::new(Semaphore::new(cfg.max_concurrent_drains)),
        });
        tokio::spawn(
            engine
                .clone()
                .new_message_worker(new_message_rx, shutdown.clone()),
        );
        tokio::spawn(engine.clone().user_login_worker(user_login_rx, shutdown));
        engine
    }

    /// 有新消息落库 / A new message has been stored
    pub async fn notify_new_message(&self) {
        self.new_message.raise(()).await;
    }

    /// 用户刚建立连接 / A user has just connected
    pub async fn notify_user_login(&self, user_id: &str) {
        self.user_login.raise(user_id.to_string()).await;
    }

    async fn new_message_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                signal = rx.recv() => {
                    match signal {
                        Some(()) => self.dispatch_pending().await,
                        None => break,
                    }
                }
            }
        }
        debug!("new-message worker exited");
    }

    /// 扇出所有尚未处理过的消息，直到存储报告没有剩余
    /// Fan out every message whose pass has not run yet, until none remain
    async fn dispatch_pending(&self) {
        loop {
            let (message, user_ids) = match self.service.oldest_undispatched().await {
                Ok(found) => found,
                Err(e) if e.is_not_found() => return,
                Err(e) => {
                    error!("get pending message error: {}", e);
                    return;
                }
            };
            self.fan_out(&message, &user_ids).await;
            if let Err(e) = self.service.mark_dispatched(&message.id).await {
                // 标记失败时退出本轮，等下一个信号重推导，避免空转
                // Bail out of this pass on failure; the next signal re-derives
                error!("mark message {} dispatched error: {}", message.id, e);
                return;
            }
        }
    }

    /// 单条消息对其接收者集合的扇出。单个接收者的失败只记录日志，
    /// 不影响其余接收者（无本轮重试，留待后续信号）。
    /// One message's fan-out over its recipients. A failure for one
    /// recipient is logged and does not abort the rest (no same-pass retry).
    async fn fan_out(&self, message: &Message, user_ids: &[String]) {
        let payload = match MessageService::encode(message) {
            Ok(p) => p,
            Err(e) => {
                error!("encode message {} error: {}", message.id, e);
                return;
            }
        };
        for user_id in user_ids {
            let Some(conn) = self.registry.get(user_id) else {
                debug!(
                    "user {} offline, message {} left pending",
                    user_id, message.id
                );
                continue;
            };
            if !conn.send(payload.clone()) {
                debug!(
                    "user {} unreachable, message {} left pending",
                    user_id, message.id
                );
                continue;
            }
            if let Err(e) = self
                .service
                .update_status(user_id, &message.id, PushStatus::Success)
                .await
            {
                error!(
                    "update status error, user {} message {}: {}",
                    user_id, message.id, e
                );
            }
        }
    }

    async fn user_login_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                signal = rx.recv() => {
                    let Some(user_id) = signal else { break };
                    // 每个登录独立补发，任何一个用户的慢补发不得阻塞其他用户
                    // Each login drains independently; one user's slow drain
                    // must not block another's
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = engine.drain_permits.clone().acquire_owned().await
                        else {
                            return;
                        };
                        engine.drain_user(&user_id).await;
                    });
                }
            }
        }
        debug!("user-login worker exited");
    }

    /// 按创建时间升序分批补发该用户的积压，直到取空；用户掉线则中止
    /// Drain the user's backlog in creation-time order, batch by batch,
    /// until a fetch comes back empty; abort if the user went offline
    pub async fn drain_user(&self, user_id: &str) {
        loop {
            let batch = match self.service.pending_for_user(user_id).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("get pending messages for user {} error: {}", user_id, e);
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            let Some(conn) = self.registry.get(user_id) else {
                debug!("user {} went offline during drain", user_id);
                return;
            };
            let mut delivered = 0usize;
            for message in &batch {
                let payload = match MessageService::encode(message) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("encode message {} error: {}", message.id, e);
                        return;
                    }
                };
                if !conn.send(payload) {
                    break;
                }
                if let Err(e) = self
                    .service
                    .update_status(user_id, &message.id, PushStatus::Success)
                    .await
                {
                    error!(
                        "update status error, user {} message {}: {}",
                        user_id, message.id, e
                    );
                    return;
                }
                delivered += 1;
            }
            if delivered == 0 {
                // 出站队列满且无进展，停止本轮，等下次登录重试
                // No progress (outbound queue saturated); stop and let the
                // next login signal retry
                warn!("drain for user {} made no progress, stopping", user_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::domain::message::{MessageType, PushMessageRequest, UserInfo};
    use crate::storage::memory::MemoryStore;
    use crate::ws::connection::{ConnPumps, WsConn};
    use serde_json::json;

    struct Harness {
        service: Arc<MessageService>,
        registry: Arc<ConnectionRegistry>,
        engine: Arc<DeliveryEngine>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let service = Arc::new(MessageService::new(
            Arc::new(MemoryStore::new()),
            &DeliveryConfig::default(),
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = DeliveryEngine::start(
            service.clone(),
            registry.clone(),
            &DeliveryConfig::default(),
            shutdown_rx,
        );
        Harness {
            service,
            registry,
            engine,
            _shutdown: shutdown_tx,
        }
    }

    fn online_user(h: &Harness, id: &str) -> (Arc<WsConn>, ConnPumps) {
        let user = UserInfo {
            id: id.to_string(),
            org_id: String::new(),
            name: id.to_string(),
        };
        let (conn, pumps) = WsConn::new(user, 64);
        h.registry.add(conn.clone());
        (conn, pumps)
    }

    async fn recv_envelope(pumps: &mut ConnPumps) -> serde_json::Value {
        let payload = timeout(Duration::from_secs(1), pumps.outbound_rx.recv())
            .await
            .expect("delivery timed out")
            .expect("outbound queue closed");
        serde_json::from_str(&payload).unwrap()
    }

    async fn ingest(h: &Harness, id: &str, user_ids: &[&str]) {
        let request = PushMessageRequest {
            user_ids: user_ids.iter().map(|s| s.to_string()).collect(),
            content: json!({"n": id}),
            id: Some(id.to_string()),
            timestamp: None,
        };
        h.service.ingest(&request).await.unwrap();
        h.engine.notify_new_message().await;
    }

    #[tokio::test]
    async fn fan_out_delivers_online_and_leaves_offline_pending() {
        let h = harness();
        let (_a_conn, mut a_pumps) = online_user(&h, "a");

        // b 不在线 / b is offline
        ingest(&h, "m1", &["a", "b"]).await;

        let envelope = recv_envelope(&mut a_pumps).await;
        assert_eq!(envelope["ID"], "m1");
        assert_eq!(envelope["Type"], u8::from(MessageType::ToUsers));

        // a 已推送成功，b 保持待处理 / a delivered, b still pending
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.service.pending_for_user("a").await.unwrap().is_empty());
        assert_eq!(h.service.pending_for_user("b").await.unwrap().len(), 1);

        // b 上线后由补发协程送达 / b's login drain delivers it
        let (_b_conn, mut b_pumps) = online_user(&h, "b");
        h.engine.notify_user_login("b").await;
        let envelope = recv_envelope(&mut b_pumps).await;
        assert_eq!(envelope["ID"], "m1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.service.pending_for_user("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_drain_is_ordered_and_loops_past_the_batch_limit() {
        let h = harness();

        // 默认批大小为5，7条消息需要两轮 / default batch is 5, 7 messages need two rounds
        for i in 0..7 {
            ingest(&h, &format!("m{}", i), &["c"]).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_conn, mut pumps) = online_user(&h, "c");
        h.engine.notify_user_login("c").await;

        for i in 0..7 {
            let envelope = recv_envelope(&mut pumps).await;
            assert_eq!(envelope["ID"], format!("m{}", i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.service.pending_for_user("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_aborts_when_the_user_goes_offline() {
        let h = harness();
        ingest(&h, "m1", &["d"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 未注册连接，补发应立即中止且状态保持待处理
        // No live actor: the drain aborts and the record stays pending
        h.engine.drain_user("d").await;
        assert_eq!(h.service.pending_for_user("d").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_signals_do_not_duplicate_deliveries() {
        let h = harness();
        let (_conn, mut pumps) = online_user(&h, "e");
        ingest(&h, "m1", &["e"]).await;

        let envelope = recv_envelope(&mut pumps).await;
        assert_eq!(envelope["ID"], "m1");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 状态已落库后，重复或乱序的信号只会重推导出"无待处理"
        // Once the status has settled, duplicate or re-ordered signals just
        // re-derive "nothing pending"
        h.engine.notify_new_message().await;
        h.engine.notify_user_login("e").await;
        assert!(
            timeout(Duration::from_millis(200), pumps.outbound_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn concurrent_logins_drain_independently() {
        let h = harness();
        for user in ["u1", "u2", "u3"] {
            ingest(&h, &format!("m-{}", user), &[user]).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut pumps: Vec<ConnPumps> = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let (_conn, p) = online_user(&h, user);
            pumps.push(p);
            h.engine.notify_user_login(user).await;
        }
        for (i, user) in ["u1", "u2", "u3"].iter().enumerate() {
            let envelope = recv_envelope(&mut pumps[i]).await;
            assert_eq!(envelope["ID"], format!("m-{}", user));
        }
    }
}
