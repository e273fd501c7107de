// 引擎与调度器测试共用的假后端、假存储与记录监听器

use crate::api::{
    CompleteMultipartRequest, CreateAssetRequest, GalleryBackend, PartUrl, UploadError,
    UploadIntent,
};
use crate::config::{AppConfig, UploadConfig};
use crate::uploader::chunk::PartRange;
use crate::uploader::progress::UploadListener;
use crate::uploader::storage::{PartStore, ProgressFn};
use crate::uploader::task::{TaskState, UploadOutcome, UploadRequest};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =====================================================
// 并发水位计
// =====================================================

/// 记录同时在途的操作数峰值
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            gauge: self.clone(),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    gauge: Arc<ConcurrencyGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// =====================================================
// 假后端
// =====================================================

/// 按文件名登记意图脚本的假图库后端
pub struct FakeBackend {
    /// 文件名 → 返回的意图
    intents: Mutex<HashMap<String, UploadIntent>>,
    /// 文件名 → 先失败几次（503）再返回意图
    intent_failures: Mutex<HashMap<String, u32>>,
    /// 合并接口的脚本化错误（每次调用都返回同一错误）
    completion_error: Mutex<Option<UploadError>>,
    pub intent_calls: AtomicUsize,
    pub complete_calls: Mutex<Vec<CompleteMultipartRequest>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            intents: Mutex::new(HashMap::new()),
            intent_failures: Mutex::new(HashMap::new()),
            completion_error: Mutex::new(None),
            intent_calls: AtomicUsize::new(0),
            complete_calls: Mutex::new(Vec::new()),
        })
    }

    /// 登记单片意图
    pub fn stage_single(&self, name: &str, asset_id: &str) {
        let storage_key = format!("galleries/g-100/{}", name);
        let mut form_fields = HashMap::new();
        form_fields.insert("key".to_string(), storage_key.clone());
        form_fields.insert("policy".to_string(), "signed-policy".to_string());
        self.intents.lock().unwrap().insert(
            name.to_string(),
            UploadIntent::SinglePart {
                asset_id: asset_id.to_string(),
                storage_key,
                target_url: format!("https://storage.test/{}/form", asset_id),
                form_fields,
            },
        );
    }

    /// 登记分片意图，预签名地址编号从 1 开始连续
    pub fn stage_multi(&self, name: &str, asset_id: &str, part_count: u32) {
        let part_urls = (1..=part_count)
            .map(|n| PartUrl {
                part_number: n,
                url: format!("https://storage.test/{}/part/{}", asset_id, n),
            })
            .collect();
        self.intents.lock().unwrap().insert(
            name.to_string(),
            UploadIntent::MultiPart {
                asset_id: asset_id.to_string(),
                storage_key: format!("galleries/g-100/{}", name),
                upload_id: format!("mp-{}", asset_id),
                part_urls,
            },
        );
    }

    pub fn fail_intent_times(&self, name: &str, times: u32) {
        self.intent_failures
            .lock()
            .unwrap()
            .insert(name.to_string(), times);
    }

    pub fn fail_completion(&self, error: UploadError) {
        *self.completion_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl GalleryBackend for FakeBackend {
    async fn request_intent(
        &self,
        request: &CreateAssetRequest,
    ) -> Result<UploadIntent, UploadError> {
        self.intent_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.intent_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&request.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(UploadError::Backend {
                        status: 503,
                        message: "服务暂时不可用".to_string(),
                    });
                }
            }
        }
        self.intents
            .lock()
            .unwrap()
            .get(&request.name)
            .cloned()
            .ok_or_else(|| UploadError::Backend {
                status: 404,
                message: format!("图库中不存在: {}", request.name),
            })
    }

    async fn complete_multipart(
        &self,
        _asset_id: &str,
        request: &CompleteMultipartRequest,
    ) -> Result<(), UploadError> {
        self.complete_calls.lock().unwrap().push(request.clone());
        match self.completion_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// =====================================================
// 假存储
// =====================================================

/// 不碰磁盘的假对象存储
///
/// 默认全部成功并返回 `etag-{分片号}`；可按分片号脚本化失败，
/// 失败的尝试会先上报一半字节再返回错误，用于验证进度回退。
pub struct FakeStore {
    /// 分片号 → 依次弹出的错误（弹空后成功）
    part_scripts: Mutex<HashMap<u32, VecDeque<UploadError>>>,
    form_errors: Mutex<VecDeque<UploadError>>,
    /// 每次分片尝试的分片号（含重试）
    pub part_attempts: Mutex<Vec<u32>>,
    pub form_calls: AtomicUsize,
    gauge: Option<Arc<ConcurrencyGauge>>,
    op_delay: Duration,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            part_scripts: Mutex::new(HashMap::new()),
            form_errors: Mutex::new(VecDeque::new()),
            part_attempts: Mutex::new(Vec::new()),
            form_calls: AtomicUsize::new(0),
            gauge: None,
            op_delay: Duration::ZERO,
        })
    }

    /// 带并发水位计和固定操作耗时的假存储
    pub fn with_gauge(gauge: Arc<ConcurrencyGauge>, op_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            part_scripts: Mutex::new(HashMap::new()),
            form_errors: Mutex::new(VecDeque::new()),
            part_attempts: Mutex::new(Vec::new()),
            form_calls: AtomicUsize::new(0),
            gauge: Some(gauge),
            op_delay,
        })
    }

    /// 让指定分片接下来 `times` 次尝试都返回同一错误
    pub fn fail_part(&self, part_number: u32, error: UploadError, times: u32) {
        let mut scripts = self.part_scripts.lock().unwrap();
        let queue = scripts.entry(part_number).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn fail_form_once(&self, error: UploadError) {
        self.form_errors.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl PartStore for FakeStore {
    async fn upload_part(
        &self,
        _path: &Path,
        range: PartRange,
        _url: &str,
        progress: ProgressFn,
    ) -> Result<String, UploadError> {
        let _guard = self.gauge.as_ref().map(|g| g.enter());
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
        self.part_attempts.lock().unwrap().push(range.part_number);
        let scripted = self
            .part_scripts
            .lock()
            .unwrap()
            .get_mut(&range.part_number)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(error) => {
                // 失败前已流出一半字节
                progress(range.length / 2);
                Err(error)
            }
            None => {
                progress(range.length);
                Ok(format!("etag-{}", range.part_number))
            }
        }
    }

    async fn upload_form(
        &self,
        _path: &Path,
        _form_fields: &HashMap<String, String>,
        _url: &str,
        _display_name: &str,
        content_length: u64,
        progress: ProgressFn,
    ) -> Result<(), UploadError> {
        let _guard = self.gauge.as_ref().map(|g| g.enter());
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
        self.form_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.form_errors.lock().unwrap().pop_front();
        match scripted {
            Some(error) => {
                progress(content_length / 2);
                Err(error)
            }
            None => {
                progress(content_length);
                Ok(())
            }
        }
    }
}

// =====================================================
// 记录监听器
// =====================================================

/// 记录全部回调的监听器，断言回调顺序与单调性时使用
#[derive(Default)]
pub struct RecordingListener {
    pub progress_events: Mutex<Vec<(String, u64)>>,
    pub batch_events: Mutex<Vec<(u64, u64)>>,
    pub states: Mutex<Vec<(String, TaskState)>>,
    pub outcomes: Mutex<Vec<(String, UploadOutcome)>>,
}

impl UploadListener for RecordingListener {
    fn on_progress(&self, task_id: &str, bytes_sent: u64, _total_bytes: u64) {
        self.progress_events
            .lock()
            .unwrap()
            .push((task_id.to_string(), bytes_sent));
    }

    fn on_batch_progress(&self, bytes_sent: u64, total_bytes: u64, _speed_bps: u64) {
        self.batch_events
            .lock()
            .unwrap()
            .push((bytes_sent, total_bytes));
    }

    fn on_state_changed(&self, task_id: &str, state: TaskState) {
        self.states
            .lock()
            .unwrap()
            .push((task_id.to_string(), state));
    }

    fn on_outcome(&self, task_id: &str, outcome: &UploadOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .push((task_id.to_string(), outcome.clone()));
    }
}

// =====================================================
// 构造辅助
// =====================================================

/// 不读磁盘的上传请求，路径仅作占位
pub fn test_request(name: &str, content_length: u64) -> UploadRequest {
    UploadRequest {
        local_path: PathBuf::from(format!("/tmp/gallery-tests/{}", name)),
        gallery_id: "g-100".to_string(),
        section: None,
        display_name: name.to_string(),
        content_length,
    }
}

/// 退避压到毫秒级的上传配置，测试不必等真实退避
pub fn fast_upload_config() -> UploadConfig {
    UploadConfig {
        max_concurrent_tasks: 2,
        max_concurrent_parts: 4,
        max_retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        rate_limit_backoff_ms: 2,
        part_timeout_secs: 30,
        task_deadline_secs: 0,
        part_url_validity_secs: 3600,
        multipart_hint_threshold_mb: 16,
        progress_interval_ms: 0,
    }
}

pub fn fast_app_config() -> AppConfig {
    AppConfig {
        upload: fast_upload_config(),
        ..AppConfig::default()
    }
}
