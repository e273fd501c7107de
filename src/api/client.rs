//! 图库后端客户端
//!
//! 负责两个 REST 调用：创建上传意图、合并分片。
//! 鉴权方式为 Bearer 令牌 + 租户头，预签名存储请求不经过本客户端

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::error::UploadError;
use super::types::{
    ApiErrorBody, CompleteMultipartRequest, CreateAssetRequest, CreateAssetResponse, UploadIntent,
};

/// 租户标识头
const TENANT_HEADER: &str = "X-Tenant-Id";

/// 后端交互接口
///
/// 引擎只依赖该接口，测试可注入脚本化实现
#[async_trait]
pub trait GalleryBackend: Send + Sync {
    /// 创建资产并获取上传意图
    ///
    /// 副作用：后端会创建待定资产记录。分片意图创建后必须最终调用
    /// `complete_multipart`；单片意图由存储侧表单上传直接落定，无须后续调用
    async fn request_intent(
        &self,
        request: &CreateAssetRequest,
    ) -> Result<UploadIntent, UploadError>;

    /// 合并分片，使资产在存储侧最终落定
    ///
    /// 每个任务至多调用一次，重复调用由引擎的状态机与结果集排空机制阻止
    async fn complete_multipart(
        &self,
        asset_id: &str,
        request: &CompleteMultipartRequest,
    ) -> Result<(), UploadError>;
}

/// 图库后端 REST 客户端
pub struct GalleryClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    tenant_id: String,
}

impl GalleryClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `base_url` - 后端地址，末尾斜杠会被去除
    /// * `access_token` - Bearer 令牌（由外部认证层提供）
    /// * `tenant_id` - 租户 ID，空字符串表示不携带租户头
    /// * `request_timeout_secs` - 单次请求超时
    pub fn new(
        base_url: &str,
        access_token: &str,
        tenant_id: &str,
        request_timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .context("构建后端 HTTP 客户端失败")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            tenant_id: tenant_id.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 附加鉴权信息
    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.bearer_auth(&self.access_token);
        if self.tenant_id.is_empty() {
            builder
        } else {
            builder.header(TENANT_HEADER, &self.tenant_id)
        }
    }

    /// 非 2xx 响应转为 `BackendError`，尽力从响应体提取错误信息
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UploadError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|parsed| parsed.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        Err(UploadError::Backend {
            status: status.as_u16(),
            message,
        })
    }

    /// reqwest 传输层错误归类到网络错误
    fn transport_error(err: reqwest::Error) -> UploadError {
        UploadError::Network(err.to_string())
    }
}

#[async_trait]
impl GalleryBackend for GalleryClient {
    async fn request_intent(
        &self,
        request: &CreateAssetRequest,
    ) -> Result<UploadIntent, UploadError> {
        let url = self.endpoint("/v1/assets");
        tracing::debug!(
            "请求上传意图: name={} size={} gallery={}",
            request.name,
            request.content_length,
            request.gallery_id
        );

        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let response = Self::check_status(response).await?;

        let text = response.text().await.map_err(Self::transport_error)?;
        let raw: CreateAssetResponse = serde_json::from_str(&text)
            .map_err(|e| UploadError::Decode(format!("上传意图响应解析失败: {}", e)))?;

        let intent = UploadIntent::try_from(raw)?;
        tracing::debug!(
            "获得上传意图: asset={} 分片数={}",
            intent.asset_id(),
            intent.part_count()
        );
        Ok(intent)
    }

    async fn complete_multipart(
        &self,
        asset_id: &str,
        request: &CompleteMultipartRequest,
    ) -> Result<(), UploadError> {
        let url = self.endpoint(&format!("/v1/assets/{}/complete-multipart", asset_id));
        tracing::debug!(
            "合并分片: asset={} upload_id={} parts={}",
            asset_id,
            request.upload_id,
            request.parts.len()
        );

        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::check_status(response).await?;

        tracing::info!("✓ 分片合并完成: asset={}", asset_id);
        Ok(())
    }
}
