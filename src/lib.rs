// Gallery Uploader Rust Library
// 图库批量上传客户端核心库

// 图库后端API模块
pub mod api;

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use api::{
    CompleteMultipartRequest, CompletedPart, CreateAssetRequest, ErrorPhase, GalleryBackend,
    GalleryClient, TaskError, UploadError, UploadIntent, UploadMode,
};
pub use config::{ApiConfig, AppConfig, LogConfig, UploadConfig};
pub use logging::{init_logging, LogGuard};
pub use uploader::{
    BatchHandle, NoopListener, TaskOutcome, TaskState, UploadEngine, UploadListener, UploadOutcome,
    UploadRequest, UploadScheduler, UploadTask,
};
