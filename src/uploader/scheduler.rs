// 上传调度器
//
// 功能：
// - 批量提交任务，按完成顺序产出有限的结局流
// - 文件级并发控制（Semaphore 限制同时执行的任务数）
// - 批次进度聚合（单调不减）与速度采样
// - 协作式取消（单任务、整批或全部在册任务）
// - 任务注册表与快照查询

use crate::api::{GalleryBackend, GalleryClient};
use crate::config::AppConfig;
use crate::uploader::engine::UploadEngine;
use crate::uploader::progress::{BatchProgress, ProgressThrottler, TaskProgress, UploadListener};
use crate::uploader::storage::{PartStore, StorageClient};
use crate::uploader::task::{
    SharedTask, TaskOutcome, TaskState, UploadOutcome, UploadRequest, UploadTask,
};
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =====================================================
// 任务句柄与批次句柄
// =====================================================

/// 注册表中单个任务的控制句柄
pub struct TaskHandle {
    pub shared: SharedTask,
    pub progress: Arc<TaskProgress>,
    pub cancel: CancellationToken,
}

/// 提交批次后返回的任务凭据
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub task_id: String,
    pub request: UploadRequest,
}

/// 一次批量提交的句柄
///
/// 结局按完成顺序到达，批次内全部任务落定后流自然结束。
pub struct BatchHandle {
    tickets: Vec<TaskTicket>,
    outcomes: mpsc::Receiver<TaskOutcome>,
    cancel: CancellationToken,
    aggregate: Arc<BatchProgress>,
}

impl BatchHandle {
    pub fn tickets(&self) -> &[TaskTicket] {
        &self.tickets
    }

    pub fn task_count(&self) -> usize {
        self.tickets.len()
    }

    /// 下一个落定的任务结局；批次全部结束后返回 None
    pub async fn next_outcome(&mut self) -> Option<TaskOutcome> {
        self.outcomes.recv().await
    }

    /// 等待批次内全部任务落定，按完成顺序返回
    pub async fn wait_all(mut self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(self.tickets.len());
        while let Some(outcome) = self.outcomes.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// 取消整个批次，在途任务尽快停止，未开始的任务不再启动
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 批次聚合进度 (已发送字节, 总字节)
    pub fn aggregate_bytes(&self) -> (u64, u64) {
        (self.aggregate.bytes_sent(), self.aggregate.grand_total())
    }

    /// 把结局接收端转成 Stream
    pub fn into_stream(self) -> impl futures::Stream<Item = TaskOutcome> {
        futures::stream::unfold(self.outcomes, |mut rx| async move {
            rx.recv().await.map(|outcome| (outcome, rx))
        })
    }
}

// =====================================================
// 批次进度聚合监听器
// =====================================================

/// 包装用户监听器，把成员任务进度汇总成批次进度
///
/// 单任务回调原样转发；批次进度按节流间隔发布，
/// 任务落定时强制刷新一次。
struct BatchListener {
    inner: Arc<dyn UploadListener>,
    members: Vec<Arc<TaskProgress>>,
    aggregate: Arc<BatchProgress>,
    throttler: ProgressThrottler,
}

impl BatchListener {
    fn emit_batch(&self, force: bool) {
        let summed: u64 = self.members.iter().map(|p| p.bytes_sent()).sum();
        let bytes = self.aggregate.update(summed);
        if force || self.throttler.should_emit() {
            let speed = self.aggregate.sample_speed();
            self.inner
                .on_batch_progress(bytes, self.aggregate.grand_total(), speed);
        }
    }
}

impl UploadListener for BatchListener {
    fn on_progress(&self, task_id: &str, bytes_sent: u64, total_bytes: u64) {
        self.inner.on_progress(task_id, bytes_sent, total_bytes);
        self.emit_batch(false);
    }

    fn on_state_changed(&self, task_id: &str, state: TaskState) {
        self.inner.on_state_changed(task_id, state);
    }

    fn on_outcome(&self, task_id: &str, outcome: &UploadOutcome) {
        // 先刷新批次进度，观察者拿到结局时聚合值已是最新
        self.emit_batch(true);
        self.inner.on_outcome(task_id, outcome);
    }
}

// =====================================================
// 调度器
// =====================================================

/// 上传调度器
///
/// 持有引擎与任务注册表，负责批次提交、并发控制和取消分发。
pub struct UploadScheduler {
    engine: Arc<UploadEngine>,
    registry: Arc<DashMap<String, TaskHandle>>,
    max_concurrent_tasks: usize,
    progress_interval_ms: u64,
    listener: Arc<dyn UploadListener>,
}

impl UploadScheduler {
    pub fn new(
        backend: Arc<dyn GalleryBackend>,
        store: Arc<dyn PartStore>,
        config: &AppConfig,
        listener: Arc<dyn UploadListener>,
    ) -> Self {
        info!(
            "创建上传调度器: 最大并发任务数={}, 最大并发分片数={}",
            config.upload.max_concurrent_tasks, config.upload.max_concurrent_parts
        );
        Self {
            engine: Arc::new(UploadEngine::new(backend, store, &config.upload)),
            registry: Arc::new(DashMap::new()),
            max_concurrent_tasks: config.upload.max_concurrent_tasks.max(1),
            progress_interval_ms: config.upload.progress_interval_ms,
            listener,
        }
    }

    /// 按配置构造真实后端与存储客户端
    pub fn from_config(config: &AppConfig, listener: Arc<dyn UploadListener>) -> Result<Self> {
        let backend = Arc::new(GalleryClient::new(
            &config.api.base_url,
            &config.api.access_token,
            &config.api.tenant_id,
            config.api.request_timeout_secs,
        )?);
        let store = Arc::new(StorageClient::new(config.upload.part_timeout_secs)?);
        Ok(Self::new(backend, store, config, listener))
    }

    /// 提交一批上传请求
    ///
    /// 立即返回批次句柄，任务在后台按并发上限执行。
    /// 每个请求恰好产生一个结局，接收顺序即完成顺序。
    pub fn submit(&self, batch: Vec<UploadRequest>) -> BatchHandle {
        let batch_cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = mpsc::channel(batch.len().max(1));
        let grand_total: u64 = batch.iter().map(|r| r.content_length).sum();
        let aggregate = Arc::new(BatchProgress::new(grand_total));

        info!(
            "提交上传批次: {} 个文件，共 {} 字节",
            batch.len(),
            grand_total
        );

        // 先建好全部任务句柄并登记，再统一启动
        let mut tickets = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());
        let mut members = Vec::with_capacity(batch.len());
        for request in batch {
            let task = UploadTask::new(request.clone());
            let task_id = task.id.clone();
            let shared: SharedTask = Arc::new(Mutex::new(task));
            let progress = Arc::new(TaskProgress::new(request.content_length));
            let cancel = batch_cancel.child_token();
            self.registry.insert(
                task_id.clone(),
                TaskHandle {
                    shared: shared.clone(),
                    progress: progress.clone(),
                    cancel: cancel.clone(),
                },
            );
            members.push(progress.clone());
            tickets.push(TaskTicket {
                task_id: task_id.clone(),
                request: request.clone(),
            });
            pending.push((task_id, request, shared, progress, cancel));
        }

        let batch_listener = Arc::new(BatchListener {
            inner: self.listener.clone(),
            members,
            aggregate: aggregate.clone(),
            throttler: ProgressThrottler::new(self.progress_interval_ms),
        });

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_tasks));
        for (task_id, request, shared, progress, cancel) in pending {
            let engine = self.engine.clone();
            let semaphore = semaphore.clone();
            let listener: Arc<dyn UploadListener> = batch_listener.clone();
            let tx = outcome_tx.clone();

            tokio::spawn(async move {
                // 排队等待并发许可，取消时不再等待
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    acquired = semaphore.acquire_owned() => acquired.ok(),
                };

                let outcome = if let Some(_permit) = permit {
                    engine
                        .run_task(shared.clone(), progress, cancel, listener.clone())
                        .await
                } else {
                    // 未开始执行即被取消
                    let state = {
                        let mut task = shared.lock().await;
                        task.mark_cancelled();
                        task.state
                    };
                    let outcome = UploadOutcome::Cancelled;
                    listener.on_state_changed(&task_id, state);
                    listener.on_outcome(&task_id, &outcome);
                    outcome
                };

                // 接收端先行关闭时丢弃结局
                let _ = tx
                    .send(TaskOutcome {
                        task_id,
                        request,
                        outcome,
                    })
                    .await;
            });
        }
        // 发送端全部随任务结束而释放后，接收端自然收尾
        drop(outcome_tx);

        BatchHandle {
            tickets,
            outcomes: outcome_rx,
            cancel: batch_cancel,
            aggregate,
        }
    }

    /// 上传单个文件并等待其落定
    pub async fn upload_file(&self, request: UploadRequest) -> Result<TaskOutcome> {
        let mut handle = self.submit(vec![request]);
        match handle.next_outcome().await {
            Some(outcome) => Ok(outcome),
            None => anyhow::bail!("上传任务提前结束且未产生结局"),
        }
    }

    /// 请求取消单个任务，任务不存在时返回 false
    pub fn cancel_task(&self, task_id: &str) -> bool {
        match self.registry.get(task_id) {
            Some(handle) => {
                handle.cancel.cancel();
                info!("上传任务 {} 已请求取消", task_id);
                true
            }
            None => false,
        }
    }

    /// 向全部在册任务发送取消信号
    pub fn cancel_all(&self) {
        for entry in self.registry.iter() {
            entry.value().cancel.cancel();
        }
        info!("已向全部在册任务发送取消信号");
    }

    /// 单个任务的只读快照，进行中任务附带最新进度
    pub async fn task_snapshot(&self, task_id: &str) -> Option<UploadTask> {
        let (shared, progress) = {
            let handle = self.registry.get(task_id)?;
            (handle.shared.clone(), handle.progress.clone())
        };
        let mut task = shared.lock().await.clone();
        if !task.state.is_terminal() {
            task.bytes_sent = progress.bytes_sent();
        }
        Some(task)
    }

    /// 全部在册任务的快照，按创建时间排序
    pub async fn all_snapshots(&self) -> Vec<UploadTask> {
        let handles: Vec<(SharedTask, Arc<TaskProgress>)> = self
            .registry
            .iter()
            .map(|entry| (entry.value().shared.clone(), entry.value().progress.clone()))
            .collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for (shared, progress) in handles {
            let mut task = shared.lock().await.clone();
            if !task.state.is_terminal() {
                task.bytes_sent = progress.bytes_sent();
            }
            snapshots.push(task);
        }
        snapshots.sort_by_key(|t| t.created_at);
        snapshots
    }

    /// 从注册表清理终态任务，返回清理数量
    pub async fn clear_finished(&self) -> usize {
        let candidates: Vec<(String, SharedTask)> = self
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().shared.clone()))
            .collect();

        let mut removed = 0;
        for (task_id, shared) in candidates {
            let terminal = { shared.lock().await.state.is_terminal() };
            if terminal && self.registry.remove(&task_id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("已清理 {} 个终态任务", removed);
        }
        removed
    }

    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }
}

// =====================================================
// 测试
// =====================================================
