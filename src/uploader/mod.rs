// 上传编排模块
//
// 分层结构：
// - chunk: 分片规划（字节范围计算）
// - storage: 对象存储客户端（流式 PUT / 表单 POST）
// - task: 任务状态机与分片结果集
// - retry: 指数退避重试策略
// - progress: 进度统计、节流与监听器
// - engine: 单任务执行器（意图 → 上传 → 合并）
// - scheduler: 批量调度、并发控制与取消分发

pub mod chunk;
pub mod engine;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod task;

#[cfg(test)]
pub(crate) mod testkit;

pub use chunk::{plan_parts, PartRange};
pub use engine::UploadEngine;
pub use progress::{
    BatchProgress, NoopListener, ProgressThrottler, TaskProgress, UploadListener,
    DEFAULT_PROGRESS_INTERVAL_MS,
};
pub use retry::RetryPolicy;
pub use scheduler::{BatchHandle, TaskHandle, TaskTicket, UploadScheduler};
pub use storage::{PartStore, ProgressFn, StorageClient};
pub use task::{
    build_requests, PartResult, PartResultSet, SharedTask, TaskOutcome, TaskState, UploadOutcome,
    UploadRequest, UploadTask,
};
