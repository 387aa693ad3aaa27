//! 服务端自我保护：限制每秒处理的请求数。
//!
//! 超出 `max_allowed_qps` 的请求不进入处理器，直接回复 `TOO_MANY_REQUEST`，
//! 客户端据此走规则的回退策略。

use std::fmt;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota};

pub struct RequestLimiter {
    limiter: DefaultDirectRateLimiter,
    max_qps: NonZeroU32,
}

impl RequestLimiter {
    pub fn new(max_qps: NonZeroU32) -> Self {
        Self {
            limiter: DefaultDirectRateLimiter::direct(Quota::per_second(max_qps)),
            max_qps,
        }
    }

    /// 尝试占用一个请求配额。
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn max_qps(&self) -> NonZeroU32 {
        self.max_qps
    }
}

impl fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("max_qps", &self.max_qps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_beyond_quota_is_rejected() {
        let limiter = RequestLimiter::new(NonZeroU32::new(3).unwrap());
        let granted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 3);
    }
}
