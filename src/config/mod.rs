// 配置管理模块

use crate::uploader::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 图库后端配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 图库后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 后端基地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer 访问令牌
    #[serde(default)]
    pub access_token: String,
    /// 租户标识，空字符串表示不携带租户头
    #[serde(default)]
    pub tenant_id: String,
    /// 后端接口请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:9800".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_token: String::new(),
            tenant_id: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 单任务最大并发分片数
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 限流时的退避下限（毫秒）
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    /// 单次存储请求超时（秒）
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    /// 单任务硬性时限（秒），0 表示不限
    #[serde(default)]
    pub task_deadline_secs: u64,
    /// 预签名地址有效期（秒），0 表示不校验
    #[serde(default = "default_part_url_validity_secs")]
    pub part_url_validity_secs: u64,
    /// 向后端提示分片上传的文件大小阈值（MB）
    #[serde(default = "default_multipart_hint_threshold_mb")]
    pub multipart_hint_threshold_mb: u64,
    /// 进度回调节流间隔（毫秒），0 表示不节流
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_concurrent_parts() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_rate_limit_backoff_ms() -> u64 {
    10000
}

fn default_part_timeout_secs() -> u64 {
    300
}

fn default_part_url_validity_secs() -> u64 {
    3600
}

fn default_multipart_hint_threshold_mb() -> u64 {
    16
}

fn default_progress_interval_ms() -> u64 {
    200
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_concurrent_parts: default_max_concurrent_parts(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            part_timeout_secs: default_part_timeout_secs(),
            task_deadline_secs: 0,
            part_url_validity_secs: default_part_url_validity_secs(),
            multipart_hint_threshold_mb: default_multipart_hint_threshold_mb(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl UploadConfig {
    /// 按配置构造重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            rate_limit_backoff_ms: self.rate_limit_backoff_ms,
        }
    }

    /// 单任务硬性时限
    pub fn task_deadline(&self) -> Option<Duration> {
        if self.task_deadline_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.task_deadline_secs))
        }
    }

    /// 分片提示阈值（字节）
    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_hint_threshold_mb.saturating_mul(1024 * 1024)
    }

    /// 校验上传配置
    ///
    /// 预签名地址有效期必须覆盖单个分片的最坏重试耗时，
    /// 否则重试到一半地址就会过期，重试只会炸出一串 403。
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            anyhow::bail!("upload.max_concurrent_tasks 必须至少为 1");
        }
        if self.max_concurrent_parts == 0 {
            anyhow::bail!("upload.max_concurrent_parts 必须至少为 1");
        }

        let validity_ms = self.part_url_validity_secs.saturating_mul(1000);
        if validity_ms > 0 {
            let worst_case_ms = self
                .retry_policy()
                .worst_case_duration_ms(self.part_timeout_secs.saturating_mul(1000));
            if worst_case_ms > validity_ms {
                anyhow::bail!(
                    "预签名地址有效期不足以覆盖分片重试: 有效期 {}ms < 最坏耗时 {}ms，\
                     请减小 max_retries/part_timeout_secs 或增大 part_url_validity_secs",
                    validity_ms,
                    worst_case_ms
                );
            }
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            upload: UploadConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 校验整份配置
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            anyhow::bail!("api.base_url 不能为空");
        }
        self.upload.validate()
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 加载失败时回落到默认配置并尝试写回文件，方便用户修改。
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::warn!("写入默认配置文件失败: {}", e);
                }
                default_config
            }
        }
    }
}
