// 上传引擎
//
// 核心功能：
// 1. 驱动单个任务走完整个状态机（意图 → 上传 → 合并）
// 2. 分片并发上传（Semaphore 控制并发，JoinSet 管理任务）
// 3. 错误分类和指数退避重试
// 4. 合并请求结构性保证至多一次
//
// 并发上传策略：
// - 使用 Semaphore 控制最大并发分片数
// - 使用 JoinSet 管理并发分片任务
// - 原子计数器追踪进度，失败尝试按量回退
// - 任一分片最终失败立即取消兄弟分片

use crate::api::{
    CompleteMultipartRequest, CompletedPart, CreateAssetRequest, ErrorPhase, GalleryBackend,
    TaskError, UploadError, UploadIntent, UploadMode,
};
use crate::config::UploadConfig;
use crate::uploader::chunk::{plan_parts, PartRange};
use crate::uploader::progress::{ProgressThrottler, TaskProgress, UploadListener};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::storage::{PartStore, ProgressFn};
use crate::uploader::task::{
    PartResult, PartResultSet, SharedTask, TaskState, UploadOutcome, UploadRequest,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 上传引擎
// =====================================================

/// 上传引擎
///
/// 无状态的任务执行器，可被调度器的多个并发任务共享。
/// 任务自身的可变状态保存在 `SharedTask` 快照里。
pub struct UploadEngine {
    backend: Arc<dyn GalleryBackend>,
    store: Arc<dyn PartStore>,
    retry: RetryPolicy,
    max_concurrent_parts: usize,
    task_deadline: Option<Duration>,
    multipart_threshold_bytes: u64,
    progress_interval_ms: u64,
}

/// 单个任务执行期间不变的上下文
struct TaskContext {
    task_id: String,
    request: UploadRequest,
    progress: Arc<TaskProgress>,
    cancel: CancellationToken,
    listener: Arc<dyn UploadListener>,
    throttler: Arc<ProgressThrottler>,
}

/// 单个分片上传所需的全部材料
///
/// 分片任务被 spawn 到独立的 tokio 任务，不能借用引擎，
/// 所需句柄全部克隆进来。
struct PartUploadJob {
    store: Arc<dyn PartStore>,
    retry: RetryPolicy,
    path: PathBuf,
    range: PartRange,
    url: String,
    task_id: String,
    progress: Arc<TaskProgress>,
    cancel: CancellationToken,
    throttler: Arc<ProgressThrottler>,
    listener: Arc<dyn UploadListener>,
}

impl UploadEngine {
    pub fn new(
        backend: Arc<dyn GalleryBackend>,
        store: Arc<dyn PartStore>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            backend,
            store,
            retry: config.retry_policy(),
            max_concurrent_parts: config.max_concurrent_parts.max(1),
            task_deadline: config.task_deadline(),
            multipart_threshold_bytes: config.multipart_threshold_bytes(),
            progress_interval_ms: config.progress_interval_ms,
        }
    }

    /// 执行一个上传任务直到进入终态
    ///
    /// 把终态写回共享快照并返回任务结局。
    /// 完成、失败、取消三种结局都会触发监听器回调。
    pub async fn run_task(
        &self,
        shared: SharedTask,
        progress: Arc<TaskProgress>,
        cancel: CancellationToken,
        listener: Arc<dyn UploadListener>,
    ) -> UploadOutcome {
        let (task_id, request) = {
            let task = shared.lock().await;
            (task.id.clone(), task.request.clone())
        };

        let ctx = TaskContext {
            task_id,
            request,
            progress: progress.clone(),
            cancel: cancel.clone(),
            listener: listener.clone(),
            throttler: Arc::new(ProgressThrottler::new(self.progress_interval_ms)),
        };

        let driven = match self.task_deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.drive(&shared, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        // 时限到期，按任务当前所处阶段归因
                        let phase = {
                            let task = shared.lock().await;
                            phase_of_state(task.state)
                        };
                        Err(TaskError::new(
                            phase,
                            UploadError::Network(format!(
                                "任务超过硬性时限 {}s",
                                deadline.as_secs()
                            )),
                        ))
                    }
                }
            }
            None => self.drive(&shared, &ctx).await,
        };

        let (outcome, final_state) = {
            let mut task = shared.lock().await;
            let outcome = match driven {
                Ok(asset_id) => {
                    progress.finish();
                    task.mark_completed();
                    info!("✓ 任务 {} 上传完成: {}", ctx.task_id, asset_id);
                    UploadOutcome::Completed { asset_id }
                }
                Err(_) if cancel.is_cancelled() => {
                    task.mark_cancelled();
                    info!("任务 {} 已取消", ctx.task_id);
                    UploadOutcome::Cancelled
                }
                Err(task_error) => {
                    error!("🔥 任务 {} 失败: {}", ctx.task_id, task_error);
                    task.bytes_sent = progress.bytes_sent();
                    task.mark_failed(&task_error);
                    UploadOutcome::Failed { error: task_error }
                }
            };
            (outcome, task.state)
        };

        listener.on_state_changed(&ctx.task_id, final_state);
        // 终态强制补发一次进度，保证观察者看到最终字节数
        listener.on_progress(&ctx.task_id, progress.bytes_sent(), progress.total_bytes());
        listener.on_outcome(&ctx.task_id, &outcome);
        outcome
    }

    /// 状态机主体：意图 → (整文件上传 | 分片上传 → 合并)
    async fn drive(&self, shared: &SharedTask, ctx: &TaskContext) -> Result<String, TaskError> {
        self.transition(shared, ctx, TaskState::RequestingIntent)
            .await;
        let intent = self
            .request_intent_with_retry(ctx)
            .await
            .map_err(|e| TaskError::new(ErrorPhase::Intent, e))?;

        {
            let mut task = shared.lock().await;
            task.asset_id = Some(intent.asset_id().to_string());
        }

        // 上传方式以后端响应的形态为准，本地大小只作为意图提示
        match intent {
            UploadIntent::SinglePart {
                asset_id,
                target_url,
                form_fields,
                ..
            } => {
                self.transition(shared, ctx, TaskState::Uploading).await;
                self.upload_single_with_retry(ctx, &form_fields, &target_url)
                    .await
                    .map_err(|e| TaskError::new(ErrorPhase::Upload, e))?;
                Ok(asset_id)
            }
            UploadIntent::MultiPart {
                asset_id,
                storage_key,
                upload_id,
                part_urls,
            } => {
                self.transition(shared, ctx, TaskState::ChunkingAndUploading)
                    .await;
                let ranges = plan_parts(ctx.request.content_length, part_urls.len() as u32)
                    .map_err(|e| TaskError::new(ErrorPhase::Intent, e))?;

                debug!(
                    "任务 {} 分为 {} 个分片上传: {}",
                    ctx.task_id,
                    ranges.len(),
                    ctx.request.display_name
                );

                let urls = part_urls.into_iter().map(|p| p.url).collect();
                let parts = self.upload_parts(shared, ctx, ranges, urls).await?;

                self.transition(shared, ctx, TaskState::Completing).await;
                let completion = CompleteMultipartRequest {
                    key: storage_key,
                    upload_id,
                    parts: parts
                        .iter()
                        .map(|p| CompletedPart {
                            part_number: p.part_number,
                            content_identifier: p.content_identifier.clone(),
                        })
                        .collect(),
                };
                // 合并不重试：结果未知时重发可能造成重复落定
                with_cancel(
                    &ctx.cancel,
                    self.backend.complete_multipart(&asset_id, &completion),
                )
                .await
                .map_err(|e| TaskError::new(ErrorPhase::Completion, e))?;
                Ok(asset_id)
            }
        }
    }

    /// 带重试的意图请求
    async fn request_intent_with_retry(
        &self,
        ctx: &TaskContext,
    ) -> Result<UploadIntent, UploadError> {
        let desired_mode = if ctx.request.content_length >= self.multipart_threshold_bytes {
            UploadMode::Multipart
        } else {
            UploadMode::Single
        };
        let payload = CreateAssetRequest {
            gallery_id: ctx.request.gallery_id.clone(),
            section: ctx.request.section.clone(),
            name: ctx.request.display_name.clone(),
            content_length: ctx.request.content_length,
            desired_mode,
        };

        let mut attempt = 0u32;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            match with_cancel(&ctx.cancel, self.backend.request_intent(&payload)).await {
                Ok(intent) => return Ok(intent),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff_delay(attempt, &e);
                    warn!(
                        "任务 {} 意图请求第 {} 次尝试失败，{}ms 后重试: {}",
                        ctx.task_id,
                        attempt + 1,
                        delay.as_millis(),
                        e
                    );
                    backoff_sleep(&ctx.cancel, delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 带重试的整文件表单上传
    async fn upload_single_with_retry(
        &self,
        ctx: &TaskContext,
        form_fields: &HashMap<String, String>,
        target_url: &str,
    ) -> Result<(), UploadError> {
        let mut attempt = 0u32;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled_error());
            }

            // 本次尝试流出的字节数，失败时按该值回退在途统计
            let attempt_sent = Arc::new(AtomicU64::new(0));
            let progress_fn = attempt_progress_fn(ctx, &attempt_sent);

            let uploaded = with_cancel(
                &ctx.cancel,
                self.store.upload_form(
                    &ctx.request.local_path,
                    form_fields,
                    target_url,
                    &ctx.request.display_name,
                    ctx.request.content_length,
                    progress_fn,
                ),
            )
            .await;

            match uploaded {
                Ok(()) => {
                    ctx.progress.commit(
                        attempt_sent.load(Ordering::Relaxed),
                        ctx.request.content_length,
                    );
                    return Ok(());
                }
                Err(e) => {
                    ctx.progress
                        .rollback_in_flight(attempt_sent.load(Ordering::Relaxed));
                    if e.is_transient()
                        && attempt < self.retry.max_retries
                        && !ctx.cancel.is_cancelled()
                    {
                        let delay = self.retry.backoff_delay(attempt, &e);
                        warn!(
                            "任务 {} 整文件上传第 {} 次尝试失败，{}ms 后重试: {}",
                            ctx.task_id,
                            attempt + 1,
                            delay.as_millis(),
                            e
                        );
                        backoff_sleep(&ctx.cancel, delay).await?;
                        attempt += 1;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// 并发上传全部分片
    ///
    /// 全部成功时返回按分片号升序排列的结果；
    /// 任一分片最终失败时取消其余分片，已成功的结果随之丢弃。
    async fn upload_parts(
        &self,
        shared: &SharedTask,
        ctx: &TaskContext,
        ranges: Vec<PartRange>,
        part_urls: Vec<String>,
    ) -> Result<Vec<PartResult>, TaskError> {
        let expected = ranges.len() as u32;
        let results = Arc::new(PartResultSet::new(expected));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_parts));
        // 子令牌：外层取消会传导进来，兄弟失败只打断本任务的分片
        let sibling_cancel = ctx.cancel.child_token();
        let mut workers: JoinSet<Result<u32, (ErrorPhase, UploadError)>> = JoinSet::new();

        // 分片号与 URL 的对齐在意图解码时已校验
        for (range, url) in ranges.into_iter().zip(part_urls.into_iter()) {
            let job = PartUploadJob {
                store: self.store.clone(),
                retry: self.retry.clone(),
                path: ctx.request.local_path.clone(),
                range,
                url,
                task_id: ctx.task_id.clone(),
                progress: ctx.progress.clone(),
                cancel: sibling_cancel.clone(),
                throttler: ctx.throttler.clone(),
                listener: ctx.listener.clone(),
            };
            let semaphore = semaphore.clone();
            let results = results.clone();

            workers.spawn(async move {
                let part_number = job.range.part_number;
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| (ErrorPhase::Part(part_number), cancelled_error()))?;
                if job.cancel.is_cancelled() {
                    return Err((ErrorPhase::Part(part_number), cancelled_error()));
                }

                let byte_length = job.range.length;
                let identifier = upload_one_part(&job)
                    .await
                    .map_err(|e| (ErrorPhase::Part(part_number), e))?;
                results.record(PartResult {
                    part_number,
                    content_identifier: identifier,
                    byte_length,
                });
                Ok(part_number)
            });
        }

        let mut first_failure: Option<(ErrorPhase, UploadError)> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(part_number)) => {
                    debug!("任务 {} 分片 {} 上传完成", ctx.task_id, part_number);
                    let mut task = shared.lock().await;
                    task.bytes_sent = ctx.progress.bytes_sent();
                }
                Ok(Err(failure)) => {
                    if first_failure.is_none() {
                        // 首个最终失败生效，立即打断在途的兄弟分片
                        sibling_cancel.cancel();
                        first_failure = Some(failure);
                    }
                }
                Err(join_error) => {
                    if first_failure.is_none() {
                        sibling_cancel.cancel();
                        first_failure = Some((
                            ErrorPhase::Upload,
                            UploadError::Network(format!("分片任务异常退出: {}", join_error)),
                        ));
                    }
                }
            }
        }

        if let Some((phase, e)) = first_failure {
            // 已成功分片的结果不进入合并，随任务失败整体作废
            return Err(TaskError::new(phase, e));
        }

        results
            .take_sorted()
            .map_err(|e| TaskError::new(ErrorPhase::Completion, e))
    }

    /// 推进任务状态并通知监听器
    async fn transition(&self, shared: &SharedTask, ctx: &TaskContext, state: TaskState) {
        {
            let mut task = shared.lock().await;
            match state {
                TaskState::RequestingIntent => task.mark_requesting_intent(),
                TaskState::Uploading => task.mark_uploading(),
                TaskState::ChunkingAndUploading => task.mark_chunking_and_uploading(),
                TaskState::Completing => task.mark_completing(),
                // 终态由 run_task 统一落定
                _ => {}
            }
        }
        ctx.listener.on_state_changed(&ctx.task_id, state);
    }
}

// =====================================================
// 分片上传
// =====================================================

/// 上传单个分片，带指数退避重试
async fn upload_one_part(job: &PartUploadJob) -> Result<String, UploadError> {
    let mut attempt = 0u32;
    loop {
        if job.cancel.is_cancelled() {
            return Err(cancelled_error());
        }

        let attempt_sent = Arc::new(AtomicU64::new(0));
        let progress_fn: ProgressFn = {
            let attempt_sent = attempt_sent.clone();
            let progress = job.progress.clone();
            let throttler = job.throttler.clone();
            let listener = job.listener.clone();
            let task_id = job.task_id.clone();
            Arc::new(move |delta| {
                attempt_sent.fetch_add(delta, Ordering::Relaxed);
                progress.add_in_flight(delta);
                if throttler.should_emit() {
                    listener.on_progress(&task_id, progress.bytes_sent(), progress.total_bytes());
                }
            })
        };

        let uploaded = with_cancel(
            &job.cancel,
            job.store
                .upload_part(&job.path, job.range, &job.url, progress_fn),
        )
        .await;

        match uploaded {
            Ok(identifier) => {
                job.progress
                    .commit(attempt_sent.load(Ordering::Relaxed), job.range.length);
                if attempt > 0 {
                    info!(
                        "分片 {} 在第 {} 次尝试后上传成功",
                        job.range.part_number,
                        attempt + 1
                    );
                }
                return Ok(identifier);
            }
            Err(e) => {
                // 失败尝试流出的字节全部回退，重试从零计
                job.progress
                    .rollback_in_flight(attempt_sent.load(Ordering::Relaxed));
                if e.is_transient()
                    && attempt < job.retry.max_retries
                    && !job.cancel.is_cancelled()
                {
                    let delay = job.retry.backoff_delay(attempt, &e);
                    warn!(
                        "分片 {} 第 {} 次尝试失败，{}ms 后重试: {}",
                        job.range.part_number,
                        attempt + 1,
                        delay.as_millis(),
                        e
                    );
                    backoff_sleep(&job.cancel, delay).await?;
                    attempt += 1;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

/// 构造单次尝试的进度回调
fn attempt_progress_fn(ctx: &TaskContext, attempt_sent: &Arc<AtomicU64>) -> ProgressFn {
    let attempt_sent = attempt_sent.clone();
    let progress = ctx.progress.clone();
    let throttler = ctx.throttler.clone();
    let listener = ctx.listener.clone();
    let task_id = ctx.task_id.clone();
    Arc::new(move |delta| {
        attempt_sent.fetch_add(delta, Ordering::Relaxed);
        progress.add_in_flight(delta);
        if throttler.should_emit() {
            listener.on_progress(&task_id, progress.bytes_sent(), progress.total_bytes());
        }
    })
}

// =====================================================
// 取消与退避
// =====================================================

fn cancelled_error() -> UploadError {
    UploadError::Network("任务已取消".to_string())
}

/// 把任务当前状态映射为错误归因阶段
fn phase_of_state(state: TaskState) -> ErrorPhase {
    match state {
        TaskState::Uploading | TaskState::ChunkingAndUploading => ErrorPhase::Upload,
        TaskState::Completing => ErrorPhase::Completion,
        _ => ErrorPhase::Intent,
    }
}

/// 包装一次网络操作，取消信号到达时立即放弃在途请求
async fn with_cancel<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, UploadError>>,
) -> Result<T, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled_error()),
        result = operation => result,
    }
}

/// 可被取消打断的退避等待
async fn backoff_sleep(cancel: &CancellationToken, delay: Duration) -> Result<(), UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled_error()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

// =====================================================
// 测试
// =====================================================
