// 图库后端交互模块

mod client;
mod error;
mod types;

pub use client::{GalleryBackend, GalleryClient};
pub use error::{ErrorPhase, TaskError, UploadError};
pub use types::{
    ApiErrorBody, CompleteMultipartRequest, CompletedPart, CreateAssetRequest,
    CreateAssetResponse, PartUrl, UploadIntent, UploadMode,
};
