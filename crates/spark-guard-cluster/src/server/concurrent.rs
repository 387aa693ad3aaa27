//! 并发租约管理。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 集群并发数限制无法靠滑动窗口表达：客户端在调用开始时申请租约、结束时归还，
//!   服务端据此维护每条规则的在途数量；
//! - 客户端崩溃或网络分区会让租约永远不被归还，因此每个租约都带有存活时间，
//!   由后台回收任务强制过期。
//!
//! ## 逻辑 (How)
//! - 每个 `flow_id` 一个 `parking_lot::Mutex<i64>` 记录在途数量，申请时在锁内完成
//!   “比较阈值 + 递增”，保证不会超发；
//! - 租约以 `token_id` 为键存入 `DashMap`；归还、过期回收、连接断开时的批量释放都通过
//!   `remove` 取出租约，`remove` 只会成功一次，因此在途数量只会被递减一次。
//!
//! ## 契约 (What)
//! - 租约状态只有 `Acquired → Released` 一次转换；重复归还返回 `ALREADY_RELEASE`；
//! - `token_id` 从 1 开始单调递增，0 保留为“无租约”。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use spark_guard_core::clock::current_time_millis;
use spark_guard_core::{TokenResult, TokenResultStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 一份已发放的并发租约。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub token_id: i64,
    pub flow_id: i64,
    pub client_address: String,
    pub acquire_count: i64,
    pub acquired_at: i64,
    pub timeout_ms: i64,
}

impl Lease {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now - self.acquired_at >= self.timeout_ms
    }
}

#[derive(Debug)]
pub struct LeaseManager {
    next_id: AtomicI64,
    leases: DashMap<i64, Lease>,
    in_flight: DashMap<i64, Arc<Mutex<i64>>>,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            leases: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, flow_id: i64) -> Arc<Mutex<i64>> {
        self.in_flight.entry(flow_id).or_default().clone()
    }

    pub fn acquire(
        &self,
        client_address: &str,
        flow_id: i64,
        count: u32,
        threshold: f64,
        timeout_ms: u64,
    ) -> TokenResult {
        self.acquire_at(
            current_time_millis(),
            client_address,
            flow_id,
            count,
            threshold,
            timeout_ms,
        )
    }

    pub(crate) fn acquire_at(
        &self,
        now: i64,
        client_address: &str,
        flow_id: i64,
        count: u32,
        threshold: f64,
        timeout_ms: u64,
    ) -> TokenResult {
        let acquire = i64::from(count);
        let counter = self.counter(flow_id);
        let mut current = counter.lock();
        if (*current + acquire) as f64 > threshold {
            return TokenResult::blocked();
        }
        *current += acquire;
        let token_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.leases.insert(
            token_id,
            Lease {
                token_id,
                flow_id,
                client_address: client_address.to_owned(),
                acquire_count: acquire,
                acquired_at: now,
                timeout_ms: i64::try_from(timeout_ms).unwrap_or(i64::MAX),
            },
        );
        TokenResult::ok((threshold - *current as f64) as i32).with_token_id(token_id)
    }

    pub fn release(&self, token_id: i64) -> TokenResult {
        match self.take(token_id) {
            Some(_) => TokenResult::new(TokenResultStatus::ReleaseOk),
            None => TokenResult::new(TokenResultStatus::AlreadyRelease),
        }
    }

    fn take(&self, token_id: i64) -> Option<Lease> {
        let (_, lease) = self.leases.remove(&token_id)?;
        if let Some(counter) = self.in_flight.get(&lease.flow_id).map(|c| c.clone()) {
            let mut current = counter.lock();
            *current = (*current - lease.acquire_count).max(0);
        }
        Some(lease)
    }

    /// 回收在 `now` 时刻已过期的租约，返回回收数量。
    pub fn reap_expired_at(&self, now: i64) -> usize {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|lease| lease.is_expired_at(now))
            .map(|lease| lease.token_id)
            .collect();
        let reaped = expired
            .into_iter()
            .filter_map(|token_id| self.take(token_id))
            .count();
        if reaped > 0 {
            debug!(target: "spark.guard.cluster.server", reaped, "expired leases reclaimed");
        }
        reaped
    }

    /// 释放某个客户端持有的全部租约（连接断开时调用）。
    pub fn release_client(&self, client_address: &str) -> usize {
        let owned: Vec<i64> = self
            .leases
            .iter()
            .filter(|lease| lease.client_address == client_address)
            .map(|lease| lease.token_id)
            .collect();
        owned
            .into_iter()
            .filter_map(|token_id| self.take(token_id))
            .count()
    }

    pub fn lease(&self, token_id: i64) -> Option<Lease> {
        self.leases.get(&token_id).map(|lease| lease.clone())
    }

    pub fn in_flight(&self, flow_id: i64) -> i64 {
        self.in_flight
            .get(&flow_id)
            .map_or(0, |counter| *counter.lock())
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// 启动后台回收任务，`shutdown` 变为 `true` 或发送端关闭时退出。
    pub fn spawn_reaper(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap_expired_at(current_time_millis());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(target: "spark.guard.cluster.server", "lease reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_round_trip_restores_capacity() {
        let leases = LeaseManager::new();
        let first = leases.acquire_at(0, "c1", 7, 1, 2.0, 2000);
        let second = leases.acquire_at(0, "c1", 7, 1, 2.0, 2000);
        assert!(first.is_ok() && second.is_ok());
        assert_ne!(first.token_id, second.token_id);
        assert_eq!(
            leases.acquire_at(0, "c1", 7, 1, 2.0, 2000).status,
            TokenResultStatus::Blocked
        );

        assert_eq!(
            leases.release(first.token_id).status,
            TokenResultStatus::ReleaseOk
        );
        assert_eq!(
            leases.release(first.token_id).status,
            TokenResultStatus::AlreadyRelease,
            "重复归还不得再次递减"
        );
        assert_eq!(leases.in_flight(7), 1);
        assert!(leases.acquire_at(0, "c1", 7, 1, 2.0, 2000).is_ok());
    }

    #[test]
    fn concurrent_acquire_never_exceeds_threshold() {
        let leases = Arc::new(LeaseManager::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let leases = leases.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| leases.acquire_at(0, &format!("c{i}"), 3, 1, 10.0, 2000).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
        assert_eq!(leases.in_flight(3), 10);
    }

    #[test]
    fn expired_leases_are_reaped_once() {
        let leases = LeaseManager::new();
        let lease = leases.acquire_at(1_000, "c1", 9, 2, 5.0, 2000);
        assert_eq!(leases.reap_expired_at(2_999), 0);
        assert_eq!(leases.reap_expired_at(3_000), 1);
        assert_eq!(leases.in_flight(9), 0);
        assert_eq!(
            leases.release(lease.token_id).status,
            TokenResultStatus::AlreadyRelease,
            "过期回收后客户端归还视为已释放"
        );
    }

    #[test]
    fn disconnect_releases_only_that_clients_leases() {
        let leases = LeaseManager::new();
        leases.acquire_at(0, "c1", 1, 1, 10.0, 2000);
        leases.acquire_at(0, "c1", 1, 1, 10.0, 2000);
        let other = leases.acquire_at(0, "c2", 1, 1, 10.0, 2000);
        assert_eq!(leases.release_client("c1"), 2);
        assert_eq!(leases.in_flight(1), 1);
        assert!(leases.lease(other.token_id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_expires_leases_on_its_interval() {
        let leases = Arc::new(LeaseManager::new());
        leases.acquire_at(current_time_millis() - 5_000, "c1", 4, 1, 1.0, 2000);
        let (tx, rx) = watch::channel(false);
        let reaper = leases.clone().spawn_reaper(Duration::from_millis(1000), rx);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(leases.is_empty());

        tx.send(true).unwrap();
        reaper.await.unwrap();
    }
}
