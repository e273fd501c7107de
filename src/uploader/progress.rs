//! 进度计量与事件回调
//!
//! 对外报告的字节数必须单调不减：重试会丢弃一次尝试中已流出的字节，
//! 因此实际送达量可能回落，这里用「已确认 + 在途」的历史高水位对外报告。
//! 进度回调经节流器限频，终态强制推送一次

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::uploader::task::{TaskState, UploadOutcome};

/// 默认进度事件最小间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 原子 CAS 限频，多个分片工作者并发汇报时无锁竞争。
/// 间隔为 0 时完全放行（测试用）
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点（同一实例内所有线程共享，避免不同线程基线不一致）
    origin: Instant,
    /// 上次放行的时间点（相对起点的纳秒；0 表示从未放行）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval_ms.saturating_mul(1_000_000),
        }
    }

    /// 是否放行本次事件
    ///
    /// 首次调用总是放行；之后距上次放行超过间隔才放行，
    /// CAS 失败说明别的线程抢先放行，本次吞掉
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制记录一次放行（终态推送后重置计时）
    pub fn force_emit(&self) {
        let now = self.elapsed_nanos();
        self.last_emit_nanos.store(now.max(1), Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL_MS)
    }
}

/// 单任务字节进度
///
/// committed 只在分片确认后增长；in_flight 随请求体流出增长、
/// 尝试失败时整体回退。对外的 bytes_sent 取两者之和的历史最大值
#[derive(Debug)]
pub struct TaskProgress {
    total_bytes: u64,
    committed: AtomicU64,
    in_flight: AtomicU64,
    high_water: AtomicU64,
}

impl TaskProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            committed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
        }
    }

    /// 请求体流出若干字节
    pub fn add_in_flight(&self, delta: u64) {
        self.in_flight.fetch_add(delta, Ordering::Relaxed);
    }

    /// 一次失败尝试的在途字节整体回退
    pub fn rollback_in_flight(&self, attempt_bytes: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(attempt_bytes))
            });
    }

    /// 分片确认送达：在途字节转为已确认字节
    ///
    /// attempt_bytes 是该次尝试实际流出的量，part_length 是分片应有的长度
    pub fn commit(&self, attempt_bytes: u64, part_length: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(attempt_bytes))
            });
        self.committed.fetch_add(part_length, Ordering::Relaxed);
    }

    /// 当前对外报告的字节数（单调不减，封顶 total_bytes）
    pub fn bytes_sent(&self) -> u64 {
        let committed = self.committed.load(Ordering::Relaxed);
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        let current = committed.saturating_add(in_flight).min(self.total_bytes);
        let previous = self.high_water.fetch_max(current, Ordering::Relaxed);
        previous.max(current)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// 任务完成后把进度钉在总量上
    pub fn finish(&self) {
        self.high_water.fetch_max(self.total_bytes, Ordering::Relaxed);
    }
}

/// 批次聚合进度
///
/// 聚合值 = 各任务 bytes_sent 之和的历史最大值；
/// 速率按两次采样间的字节增量计算
#[derive(Debug)]
pub struct BatchProgress {
    origin: Instant,
    grand_total: u64,
    high_water: AtomicU64,
    last_sample_nanos: AtomicU64,
    last_sample_bytes: AtomicU64,
}

impl BatchProgress {
    pub fn new(grand_total: u64) -> Self {
        Self {
            origin: Instant::now(),
            grand_total,
            high_water: AtomicU64::new(0),
            last_sample_nanos: AtomicU64::new(0),
            last_sample_bytes: AtomicU64::new(0),
        }
    }

    /// 汇入最新的各任务字节总和，返回应对外报告的聚合值
    pub fn update(&self, summed_bytes: u64) -> u64 {
        let capped = summed_bytes.min(self.grand_total);
        let previous = self.high_water.fetch_max(capped, Ordering::Relaxed);
        previous.max(capped)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }

    pub fn grand_total(&self) -> u64 {
        self.grand_total
    }

    /// 采样当前速率（字节/秒）
    ///
    /// 距上次采样不足 1ms 时直接返回 0，避免除零与极端抖动
    pub fn sample_speed(&self) -> u64 {
        let now = self.origin.elapsed().as_nanos() as u64;
        let bytes = self.high_water.load(Ordering::Relaxed);
        let last_nanos = self.last_sample_nanos.swap(now, Ordering::Relaxed);
        let last_bytes = self.last_sample_bytes.swap(bytes, Ordering::Relaxed);

        let elapsed = now.saturating_sub(last_nanos);
        if elapsed < 1_000_000 {
            return 0;
        }
        let delta = bytes.saturating_sub(last_bytes);
        ((delta as u128).saturating_mul(1_000_000_000) / elapsed as u128) as u64
    }
}

/// 上传过程回调接口
///
/// 由 UI 层或 CLI 实现；全部方法提供空默认实现，按需覆写。
/// 回调在上传工作者线程上同步执行，实现方不应阻塞
pub trait UploadListener: Send + Sync {
    /// 单任务字节进度（节流后）
    fn on_progress(&self, _task_id: &str, _bytes_sent: u64, _total_bytes: u64) {}

    /// 批次聚合进度（节流后）
    fn on_batch_progress(&self, _bytes_sent: u64, _total_bytes: u64, _speed_bps: u64) {}

    /// 任务状态变更
    fn on_state_changed(&self, _task_id: &str, _state: TaskState) {}

    /// 任务终态
    fn on_outcome(&self, _task_id: &str, _outcome: &UploadOutcome) {}
}

/// 空回调实现
#[derive(Debug, Default)]
pub struct NoopListener;

impl UploadListener for NoopListener {}
