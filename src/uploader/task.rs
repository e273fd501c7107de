// 上传任务定义
//
// 一个任务对应一个本地文件，贯穿 意图请求 → 传输 → 合并 的完整生命周期

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::{TaskError, UploadError};

/// 引擎与调度器之间共享的任务快照
pub type SharedTask = Arc<Mutex<UploadTask>>;

/// 上传请求（任务创建后不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 目标图库 ID
    pub gallery_id: String,
    /// 图库内分区（可选）
    pub section: Option<String>,
    /// 展示名称（默认取文件名）
    pub display_name: String,
    /// 文件字节数
    pub content_length: u64,
}

impl UploadRequest {
    /// 从本地路径构造请求
    ///
    /// stat 文件获取大小，文件名作为展示名；路径不可读时立即返回本地文件错误
    pub async fn from_path(
        path: impl Into<PathBuf>,
        gallery_id: &str,
        section: Option<String>,
    ) -> Result<Self, UploadError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| UploadError::LocalFile(format!("无法读取文件信息 {:?}: {}", path, e)))?;
        if !metadata.is_file() {
            return Err(UploadError::LocalFile(format!("不是普通文件: {:?}", path)));
        }

        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());

        Ok(Self {
            content_length: metadata.len(),
            local_path: path,
            gallery_id: gallery_id.to_string(),
            section,
            display_name,
        })
    }
}

/// 批量构造上传请求
///
/// 不可读的路径不会中断整批构造，而是与错误一起返回，由调用方决定如何上报
pub async fn build_requests(
    gallery_id: &str,
    section: Option<String>,
    paths: &[PathBuf],
) -> (Vec<UploadRequest>, Vec<(PathBuf, UploadError)>) {
    let mut requests = Vec::with_capacity(paths.len());
    let mut failures = Vec::new();
    for path in paths {
        match UploadRequest::from_path(path.clone(), gallery_id, section.clone()).await {
            Ok(request) => requests.push(request),
            Err(error) => failures.push((path.clone(), error)),
        }
    }
    (requests, failures)
}

/// 任务状态机
///
/// 终态为 Completed / Failed / Cancelled；
/// Failed 与 Cancelled 可从任意非终态进入
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 等待调度
    Pending,
    /// 正在请求上传意图
    RequestingIntent,
    /// 单次整文件上传中
    Uploading,
    /// 分片上传中
    ChunkingAndUploading,
    /// 合并分片中
    Completing,
    /// 已完成
    Completed,
    /// 已失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 上传请求
    pub request: UploadRequest,
    /// 任务状态
    pub state: TaskState,
    /// 已送达字节数（快照值，实时值见进度计数器）
    pub bytes_sent: u64,
    /// 总字节数
    pub total_bytes: u64,
    /// 远端资产 ID（意图创建后填入）
    pub asset_id: Option<String>,
    /// 失败原因
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(request: UploadRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            total_bytes: request.content_length,
            request,
            state: TaskState::Pending,
            bytes_sent: 0,
            asset_id: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 进入意图请求阶段（调度器派发时）
    pub fn mark_requesting_intent(&mut self) {
        self.state = TaskState::RequestingIntent;
        self.started_at = Some(chrono::Utc::now().timestamp());
    }

    /// 进入单次上传阶段
    pub fn mark_uploading(&mut self) {
        self.state = TaskState::Uploading;
    }

    /// 进入分片上传阶段
    pub fn mark_chunking_and_uploading(&mut self) {
        self.state = TaskState::ChunkingAndUploading;
    }

    /// 进入合并阶段
    pub fn mark_completing(&mut self) {
        self.state = TaskState::Completing;
    }

    /// 标记完成
    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.bytes_sent = self.total_bytes;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记失败（已处于终态时不覆盖）
    pub fn mark_failed(&mut self, error: &TaskError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记取消（已处于终态时不覆盖）
    pub fn mark_cancelled(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 上传进度百分比
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.state == TaskState::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (self.bytes_sent as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// 单个分片的上传结果
///
/// 随分片完成逐个收集，每个编号只写入一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    /// 分片编号
    pub part_number: u32,
    /// 存储端返回的内容标识（ETag 等）
    pub content_identifier: String,
    /// 分片字节数
    pub byte_length: u64,
}

/// 分片结果集合
///
/// 并发写入按编号分区（每个编号只属于一个工作者），无须互斥；
/// 导出时排空集合，使合并请求的材料只能被取走一次
#[derive(Debug)]
pub struct PartResultSet {
    expected: u32,
    results: DashMap<u32, PartResult>,
}

impl PartResultSet {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            results: DashMap::with_capacity(expected as usize),
        }
    }

    /// 记录一个分片结果
    pub fn record(&self, result: PartResult) {
        let part_number = result.part_number;
        if self.results.insert(part_number, result).is_some() {
            // 编号分区保证同一编号只有一个写入者，命中此分支说明引擎存在缺陷
            tracing::error!("分片 {} 的结果被重复写入", part_number);
        }
    }

    /// 已记录的分片数
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// 全部分片是否都已有结果
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.expected as usize
    }

    /// 校验完整性并按编号升序取走全部结果
    ///
    /// 任何编号缺失即返回 `Incomplete`；成功后集合被排空，
    /// 第二次调用必然失败，合并请求因此只能构造一次
    pub fn take_sorted(&self) -> Result<Vec<PartResult>, UploadError> {
        let mut parts: Vec<PartResult> = Vec::with_capacity(self.expected as usize);
        for part_number in 1..=self.expected {
            match self.results.remove(&part_number) {
                Some((_, result)) => parts.push(result),
                None => {
                    return Err(UploadError::Incomplete {
                        missing: part_number,
                        total: self.expected,
                    })
                }
            }
        }
        Ok(parts)
    }
}

/// 任务终态结果
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// 上传成功
    Completed { asset_id: String },
    /// 重试耗尽或遇到永久错误
    Failed { error: TaskError },
    /// 被取消
    Cancelled,
}

impl UploadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, UploadOutcome::Completed { .. })
    }
}

/// 终态流中的元素：任务标识 + 原始请求 + 结果
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub request: UploadRequest,
    pub outcome: UploadOutcome,
}
