//! 上传错误分类
//!
//! 区分瞬时错误（可重试）与永久错误（立即失败），
//! 任务终态携带的错误附带失败阶段标记

use thiserror::Error;

/// 上传过程中的错误分类
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// 网络传输失败（连接失败、超时等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 后端 REST 接口返回非 2xx
    #[error("后端接口错误 (HTTP {status}): {message}")]
    Backend { status: u16, message: String },

    /// 预签名存储地址返回非 2xx
    #[error("存储服务错误 (HTTP {status})")]
    Storage { status: u16 },

    /// 响应内容无法解析
    #[error("响应解析失败: {0}")]
    Decode(String),

    /// 合并前缺少分片结果（引擎不变量被破坏，不可重试）
    #[error("分片结果不完整: 缺少分片 {missing}，共 {total} 个")]
    Incomplete { missing: u32, total: u32 },

    /// 本地文件不可读或已被移动
    #[error("本地文件错误: {0}")]
    LocalFile(String),
}

impl UploadError {
    /// 是否为可重试的瞬时错误
    ///
    /// 网络错误、后端/存储的 5xx 与 429 视为瞬时，其余一律永久
    pub fn is_transient(&self) -> bool {
        match self {
            UploadError::Network(_) => true,
            UploadError::Backend { status, .. } | UploadError::Storage { status } => {
                *status == 429 || (500..=599).contains(status)
            }
            UploadError::Decode(_) | UploadError::Incomplete { .. } | UploadError::LocalFile(_) => {
                false
            }
        }
    }

    /// 是否为限流错误（退避时使用更长的最低等待）
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            UploadError::Backend { status: 429, .. } | UploadError::Storage { status: 429 }
        )
    }
}

/// 任务失败发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// 请求上传意图
    Intent,
    /// 单次整文件上传
    Upload,
    /// 指定编号的分片上传
    Part(u32),
    /// 分片合并
    Completion,
}

impl std::fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPhase::Intent => write!(f, "意图请求"),
            ErrorPhase::Upload => write!(f, "文件上传"),
            ErrorPhase::Part(n) => write!(f, "分片上传({})", n),
            ErrorPhase::Completion => write!(f, "分片合并"),
        }
    }
}

/// 任务终态携带的错误：重试耗尽后的最终错误与其发生阶段
#[derive(Debug, Clone, Error)]
#[error("{phase}阶段失败: {source}")]
pub struct TaskError {
    /// 失败阶段
    pub phase: ErrorPhase,
    /// 最终错误
    #[source]
    pub source: UploadError,
}

impl TaskError {
    pub fn new(phase: ErrorPhase, source: UploadError) -> Self {
        Self { phase, source }
    }
}
