//! 连接注册表 / Connection registry
//!
//! 进程级 用户ID -> 连接actor 映射。设计约束：同一用户同一时刻至多一个
//! 存活 actor，替换必须先关闭旧连接。
//! Process-wide user id -> connection actor mapping. Invariant: at most one
//! live actor per user; replacement must close the previous actor.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::ws::connection::WsConn;

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<String, Arc<WsConn>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 安装用户的当前连接。原子替换，旧连接（如有）随即触发关闭，
    /// 之后任何并发 Get 只能看到新连接。
    /// Install the user's current actor. Atomic swap; the previous actor
    /// (if any) is closed, and concurrent Get only ever sees the new one.
    pub fn add(&self, conn: Arc<WsConn>) {
        let user_id = conn.user.id.clone();
        if let Some(prev) = self.conns.insert(user_id, conn) {
            warn!("replacing live connection for user {}", prev.user.id);
            prev.close();
        }
    }

    /// 不在线返回 None，属正常情况（消息保持待处理）
    /// None means not reachable, a normal condition (messages stay pending)
    pub fn get(&self, user_id: &str) -> Option<Arc<WsConn>> {
        self.conns.get(user_id).map(|entry| entry.value().clone())
    }

    /// 幂等移除 / Idempotent removal
    pub fn remove(&self, user_id: &str) {
        self.conns.remove(user_id);
    }

    /// 仅当映射仍指向该 actor 时移除，防止被替换的旧连接摘掉新条目
    /// Remove only while the mapping still points at this actor, so a
    /// replaced connection cannot take down its successor's entry
    pub fn remove_conn(&self, conn: &WsConn) {
        self.conns
            .remove_if(&conn.user.id, |_, current| {
                current.conn_id() == conn.conn_id()
            });
    }

    /// 关闭所有连接（进程退出路径）/ Close every actor (shutdown path)
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            entry.value().close();
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
