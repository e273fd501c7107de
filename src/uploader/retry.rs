//! 重试退避策略
//!
//! 指数退避 + 随机抖动；429 限流使用更长的最低等待。
//! 合并调用不适用本策略（失败直接上报，重试可能导致重复落定）

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::api::UploadError;

/// 默认最大重试次数（不含首次尝试）
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 初始退避时长（毫秒）
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避时长（毫秒）
pub const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的最低退避时长（毫秒）
pub const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 初始退避（毫秒）
    pub initial_backoff_ms: u64,
    /// 退避上限（毫秒）
    pub max_backoff_ms: u64,
    /// 限流时的最低退避（毫秒）
    pub rate_limit_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            rate_limit_backoff_ms: RATE_LIMIT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// 计算第 retry 次重试前的等待时长
    ///
    /// 基础值为 initial * 2^retry，封顶 max_backoff_ms；
    /// 限流错误至少等待 rate_limit_backoff_ms；
    /// 最终在 [一半, 全额] 区间内取随机值，错开并发重试的时间点
    pub fn backoff_delay(&self, retry: u32, error: &UploadError) -> Duration {
        let base = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry));
        let capped = base.min(self.max_backoff_ms);
        let floored = if error.is_rate_limited() {
            capped.max(self.rate_limit_backoff_ms)
        } else {
            capped
        };

        let jittered = if floored == 0 {
            0
        } else {
            rand::thread_rng().gen_range(floored / 2..=floored)
        };
        Duration::from_millis(jittered)
    }

    /// 单次调用在最坏情况下的总耗时（毫秒）
    ///
    /// 全部尝试都按单次超时用满、每次退避都取限流下限计算，
    /// 用于校验预签名地址的有效期能否覆盖整个重试窗口
    pub fn worst_case_duration_ms(&self, per_attempt_timeout_ms: u64) -> u64 {
        let mut total =
            per_attempt_timeout_ms.saturating_mul(self.max_retries as u64 + 1);
        for retry in 0..self.max_retries {
            let base = self
                .initial_backoff_ms
                .saturating_mul(2u64.saturating_pow(retry));
            let delay = base.min(self.max_backoff_ms).max(self.rate_limit_backoff_ms);
            total = total.saturating_add(delay);
        }
        total
    }
}
