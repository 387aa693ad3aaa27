//! 单调毫秒时钟。
//!
//! 所有窗口统计、熔断重试时间与响应时间均以本模块返回的毫秒值为基准；
//! 值来自进程内首次调用时锁定的 [`Instant`]，不受系统时间回拨影响。

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// 返回自时钟初始化以来经过的毫秒数。
pub fn current_time_millis() -> i64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    i64::try_from(origin.elapsed().as_millis()).unwrap_or(i64::MAX)
}
