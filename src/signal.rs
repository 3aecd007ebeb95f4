//! 信号队列 / Signal queues
//!
//! 唤醒工作协程的轻量信号，不承载投递保证，持久状态始终从存储重新推导。
//! Lightweight wakeups for the workers; they carry no delivery guarantee of
//! their own, durable state is always re-derived from the store.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::OverflowPolicy;

/// 有界信号发送端 / Bounded signal sender
#[derive(Clone)]
pub struct SignalQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    policy: OverflowPolicy,
}

impl<T: Send + 'static> SignalQueue<T> {
    pub fn bounded(
        name: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { name, tx, policy }, rx)
    }

    /// 触发一次信号。队列满时按策略阻塞或丢弃；工作协程已退出时静默忽略。
    /// Raise one signal. When the queue is full, block or drop per policy;
    /// ignored silently once the worker has exited.
    pub async fn raise(&self, value: T) {
        match self.policy {
            OverflowPolicy::Block => {
                if self.tx.send(value).await.is_err() {
                    debug!("signal queue {} closed, worker gone", self.name);
                }
            }
            OverflowPolicy::Drop => match self.tx.try_send(value) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("signal queue {} full, dropping signal", self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("signal queue {} closed, worker gone", self.name);
                }
            },
        }
    }
}
