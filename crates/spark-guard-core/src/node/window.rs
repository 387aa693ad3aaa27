//! 环形滑动窗口计数器。
//!
//! # 教案式注释
//! - **意图 (Why)**：准入判定需要“最近 N 毫秒内发生了多少次某事件”，并要求多写者并发递增时
//!   不使用全局锁；
//! - **逻辑 (How)**：窗口被切成 `sample_count` 个等长桶，桶按 `time / bucket_len % n` 复用；
//!   桶起始时间过期时，由抢到桶内 `try_lock` 的线程重置计数，其余线程让出后重试；
//! - **契约 (What)**：求和只统计 `now - start < interval` 的有效桶；计数允许为负以支持补偿回退；
//! - **风险 (Trade-offs)**：重置与并发写之间存在极小窗口，可能丢失一次写入，精度换吞吐。

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::clock::current_time_millis;

/// 窗口内统计的事件类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    Pass,
    Block,
    Exception,
    Success,
    Rt,
    /// 借用下一窗口额度的请求。
    OccupiedPass,
}

impl MetricEvent {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            MetricEvent::Pass => 0,
            MetricEvent::Block => 1,
            MetricEvent::Exception => 2,
            MetricEvent::Success => 3,
            MetricEvent::Rt => 4,
            MetricEvent::OccupiedPass => 5,
        }
    }
}

const EMPTY_START: i64 = i64::MIN;

#[derive(Debug)]
struct Bucket {
    start: AtomicI64,
    counters: [AtomicI64; MetricEvent::COUNT],
    reset: Mutex<()>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            start: AtomicI64::new(EMPTY_START),
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            reset: Mutex::new(()),
        }
    }

    fn is_valid_at(&self, now: i64, interval_ms: i64) -> bool {
        let start = self.start.load(Ordering::Acquire);
        start != EMPTY_START && start <= now && now - start < interval_ms
    }
}

#[derive(Debug)]
pub struct WindowCounter {
    bucket_len_ms: i64,
    interval_ms: i64,
    buckets: Box<[Bucket]>,
}

impl WindowCounter {
    /// 创建窗口；`interval_ms` 不能整除 `sample_count` 时，桶长向下取整。
    pub fn new(sample_count: u32, interval_ms: u32) -> Self {
        let sample_count = sample_count.max(1);
        let interval_ms = i64::from(interval_ms.max(1));
        let bucket_len_ms = (interval_ms / i64::from(sample_count)).max(1);
        Self {
            bucket_len_ms,
            interval_ms: bucket_len_ms * i64::from(sample_count),
            buckets: (0..sample_count).map(|_| Bucket::new()).collect(),
        }
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub fn bucket_len_ms(&self) -> i64 {
        self.bucket_len_ms
    }

    pub fn interval_secs(&self) -> f64 {
        self.interval_ms as f64 / 1000.0
    }

    fn current_bucket(&self, now: i64) -> &Bucket {
        let idx = (now / self.bucket_len_ms) as usize % self.buckets.len();
        let window_start = now - now % self.bucket_len_ms;
        let bucket = &self.buckets[idx];
        loop {
            let start = bucket.start.load(Ordering::Acquire);
            if start == window_start {
                return bucket;
            }
            if start != EMPTY_START && start > window_start {
                // 时钟来自单调源，理论上不会发生；直接复用当前桶。
                return bucket;
            }
            if let Some(_guard) = bucket.reset.try_lock() {
                if bucket.start.load(Ordering::Acquire) != window_start {
                    for counter in &bucket.counters {
                        counter.store(0, Ordering::Relaxed);
                    }
                    bucket.start.store(window_start, Ordering::Release);
                }
                return bucket;
            }
            std::thread::yield_now();
        }
    }

    pub fn add(&self, event: MetricEvent, n: i64) {
        self.add_at(current_time_millis(), event, n);
    }

    pub fn add_at(&self, now: i64, event: MetricEvent, n: i64) {
        self.current_bucket(now).counters[event.index()].fetch_add(n, Ordering::AcqRel);
    }

    pub fn sum(&self, event: MetricEvent) -> i64 {
        self.sum_at(current_time_millis(), event)
    }

    pub fn sum_at(&self, now: i64, event: MetricEvent) -> i64 {
        self.buckets
            .iter()
            .filter(|bucket| bucket.is_valid_at(now, self.interval_ms))
            .map(|bucket| bucket.counters[event.index()].load(Ordering::Acquire))
            .sum()
    }

    /// 每秒速率。
    pub fn rate_at(&self, now: i64, event: MetricEvent) -> f64 {
        self.sum_at(now, event) as f64 / self.interval_secs()
    }

    pub fn rate(&self, event: MetricEvent) -> f64 {
        self.rate_at(current_time_millis(), event)
    }

    /// 计算在下一个桶边界时刻仍有效的事件总数。
    pub fn sum_at_next_boundary(&self, now: i64, event: MetricEvent) -> (i64, i64) {
        let wait = self.bucket_len_ms - now % self.bucket_len_ms;
        (self.sum_at(now + wait, event), wait)
    }

    /// 清空全部桶。
    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            let _guard = bucket.reset.lock();
            for counter in &bucket.counters {
                counter.store(0, Ordering::Relaxed);
            }
            bucket.start.store(EMPTY_START, Ordering::Release);
        }
    }
}
