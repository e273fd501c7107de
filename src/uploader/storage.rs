//! 对象存储传输层
//!
//! 分片走预签名地址的 PUT，内容标识从 ETag 响应头提取；
//! 单次上传走表单 POST（字段在前，文件字段必须最后）。
//! 请求体按固定缓冲流式读取，整个文件永远不会一次性载入内存；
//! 重试时重新打开文件读取同一范围，幂等

use std::collections::HashMap;
use std::error::Error;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::api::UploadError;
use crate::uploader::chunk::PartRange;

/// 流式读取缓冲大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 建连超时（秒）
const CONNECT_TIMEOUT_SECS: u64 = 15;

/// 字节进度回调：每流出一块请求体调用一次，参数为本块字节数
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 存储层接口
///
/// 引擎只依赖该接口，测试可注入脚本化实现
#[async_trait]
pub trait PartStore: Send + Sync {
    /// 上传一个分片，返回存储端内容标识
    ///
    /// 精确流出 `range.length` 字节（从 `range.start` 起），
    /// 标识取自响应的 ETag 头（两侧引号会被去除）
    async fn upload_part(
        &self,
        path: &Path,
        range: PartRange,
        url: &str,
        progress: ProgressFn,
    ) -> Result<String, UploadError>;

    /// 单次表单上传整个文件，2xx 即成功，无须内容标识
    async fn upload_form(
        &self,
        path: &Path,
        form_fields: &HashMap<String, String>,
        url: &str,
        display_name: &str,
        content_length: u64,
        progress: ProgressFn,
    ) -> Result<(), UploadError>;
}

/// 预签名地址存储客户端
///
/// 不携带任何鉴权头，授权信息已包含在预签名地址与表单字段里
pub struct StorageClient {
    client: reqwest::Client,
}

impl StorageClient {
    /// 创建客户端
    ///
    /// `part_timeout_secs` 是单次传输的整体超时，应按最大分片在慢速
    /// 链路上的耗时配置，超时会被归类为瞬时错误进入重试
    pub fn new(part_timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(part_timeout_secs))
            .build()
            .context("构建存储 HTTP 客户端失败")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PartStore for StorageClient {
    async fn upload_part(
        &self,
        path: &Path,
        range: PartRange,
        url: &str,
        progress: ProgressFn,
    ) -> Result<String, UploadError> {
        let reader = open_range_reader(path, range.start, range.length).await?;
        let body = reqwest::Body::wrap_stream(counting_stream(reader, progress));

        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, range.length)
            .body(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("分片 {} PUT 返回 HTTP {}", range.part_number, status);
            return Err(UploadError::Storage {
                status: status.as_u16(),
            });
        }

        let identifier = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(normalize_etag);
        match identifier {
            Some(tag) if !tag.is_empty() => Ok(tag),
            _ => Err(UploadError::Decode(
                "存储响应缺少 ETag 头，无法获得分片内容标识".to_string(),
            )),
        }
    }

    async fn upload_form(
        &self,
        path: &Path,
        form_fields: &HashMap<String, String>,
        url: &str,
        display_name: &str,
        content_length: u64,
        progress: ProgressFn,
    ) -> Result<(), UploadError> {
        let mut form = reqwest::multipart::Form::new();
        for (name, value) in form_fields {
            form = form.text(name.clone(), value.clone());
        }

        // 文件字段必须位于全部表单字段之后，存储端的 POST 策略才会生效
        let reader = open_range_reader(path, 0, content_length).await?;
        let body = reqwest::Body::wrap_stream(counting_stream(reader, progress));
        let file_part = reqwest::multipart::Part::stream_with_length(body, content_length)
            .file_name(display_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| UploadError::Decode(format!("构造文件表单字段失败: {}", e)))?;
        let form = form.part("file", file_part);

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            tracing::warn!("表单上传返回 HTTP {}", status);
            Err(UploadError::Storage {
                status: status.as_u16(),
            })
        }
    }
}

/// 打开文件并定位到范围起点，限长读取
async fn open_range_reader(
    path: &Path,
    start: u64,
    length: u64,
) -> Result<tokio::io::Take<File>, UploadError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| UploadError::LocalFile(format!("打开文件失败 {:?}: {}", path, e)))?;
    if start > 0 {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| UploadError::LocalFile(format!("定位到偏移 {} 失败: {}", start, e)))?;
    }
    Ok(file.take(length))
}

/// 把读取器包装成边流出边汇报的字节流
fn counting_stream<R>(
    reader: R,
    progress: ProgressFn,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    ReaderStream::with_capacity(reader, READ_BUFFER_SIZE).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            progress(bytes.len() as u64);
        }
    })
}

/// 传输层错误归类
///
/// 超时与建连失败是网络错误；请求体流中冒出的文件读取错误
/// （文件被移动或权限变化）是本地文件错误，不参与重试
fn classify_transport(err: reqwest::Error) -> UploadError {
    if err.is_timeout() || err.is_connect() {
        return UploadError::Network(err.to_string());
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) {
                return UploadError::LocalFile(io_err.to_string());
            }
        }
        source = cause.source();
    }
    UploadError::Network(err.to_string())
}

/// 去掉 ETag 值两侧的引号与空白
fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
        assert_eq!(normalize_etag(" \"d41d8cd98f\" "), "d41d8cd98f");
        assert_eq!(normalize_etag("\"\""), "");
    }

    #[tokio::test]
    async fn test_range_stream_reads_exact_window() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let path = dir.path().join("sample.bin");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.expect("写入测试文件失败");

        let reported = Arc::new(AtomicU64::new(0));
        let reported_in_callback = reported.clone();
        let progress: ProgressFn = Arc::new(move |delta| {
            reported_in_callback.fetch_add(delta, Ordering::Relaxed);
        });

        let reader = open_range_reader(&path, 100, 300)
            .await
            .expect("打开范围读取器失败");
        let mut stream = Box::pin(counting_stream(reader, progress));

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("读取不应失败"));
        }

        assert_eq!(collected.len(), 300);
        assert_eq!(&collected[..], &data[100..400]);
        assert_eq!(reported.load(Ordering::Relaxed), 300);
    }

    #[tokio::test]
    async fn test_range_stream_from_start() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let path = dir.path().join("small.bin");
        tokio::fs::write(&path, b"hello world").await.expect("写入测试文件失败");

        let progress: ProgressFn = Arc::new(|_| {});
        let reader = open_range_reader(&path, 0, 5).await.expect("打开范围读取器失败");
        let mut stream = Box::pin(counting_stream(reader, progress));

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("读取不应失败"));
        }
        assert_eq!(&collected[..], b"hello");
    }

    #[tokio::test]
    async fn test_open_missing_file_is_local_error() {
        let result = open_range_reader(Path::new("/nonexistent/file.bin"), 0, 10).await;
        assert!(matches!(result, Err(UploadError::LocalFile(_))));
    }
}
