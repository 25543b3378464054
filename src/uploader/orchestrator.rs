// 上传编排器
//
// 上传流程：
// 1. 校验输入并规划分片（不涉及网络）
// 2. 创建上传会话
// 3. 有界并发上传所有分片（每个分片：预签名 → 传输，整体带重试）
// 4. 按分片序号排序后合并
//
// 会话创建后的任何失败都会先取消会话（只取消一次，取消失败仅记录日志），
// 再把原始错误返回给调用方。

use crate::config::UploadConfig;
use crate::uploader::chunk::{guess_video_mime, validate_upload_input, ChunkPlan, PartDescriptor, UploadLimits};
use crate::uploader::coordinator::{
    BackendCoordinator, FinalizedObject, PartResult, UploadMetadata, UploadSession,
};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::progress::{ProgressAggregator, ProgressCallback, UploadProgress};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::scheduler::{ConcurrencyScheduler, DEFAULT_MAX_CONCURRENCY};
use crate::uploader::task::UploadTask;
use crate::uploader::transport::{ByteProgress, PartTransporter};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 编排器参数
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub limits: UploadLimits,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            limits: UploadLimits::default(),
        }
    }
}

impl UploadOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.base_delay_ms),
                config.backoff_factor,
            ),
            limits: UploadLimits {
                min_file_size: config.min_file_size,
                max_file_size: config.max_file_size,
                allowed_mime_types: config.allowed_mime_types.clone(),
            },
        }
    }
}

/// 上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub title: String,
    pub description: Option<String>,
    pub duration: Option<f64>,
    /// 其他业务字段
    pub extra: Map<String, Value>,
}

impl UploadRequest {
    pub fn new(
        source: impl Into<PathBuf>,
        file_size: u64,
        mime_type: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        Self {
            source,
            file_name,
            mime_type: mime_type.into(),
            file_size,
            title: title.into(),
            description: None,
            duration: None,
            extra: Map::new(),
        }
    }

    /// 从本地文件构造请求，MIME 类型按扩展名推断
    pub async fn from_file(
        source: impl Into<PathBuf>,
        title: impl Into<String>,
    ) -> UploadResult<Self> {
        let source = source.into();
        let metadata = tokio::fs::metadata(&source).await?;
        if !metadata.is_file() {
            return Err(UploadError::Validation(format!(
                "不是普通文件: {:?}",
                source
            )));
        }

        let mime_type = guess_video_mime(&source).unwrap_or("application/octet-stream");
        Ok(Self::new(source, metadata.len(), mime_type, title))
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    fn metadata(&self, plan: &ChunkPlan) -> UploadMetadata {
        UploadMetadata {
            title: self.title.clone(),
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            file_size: self.file_size,
            part_size: plan.part_size,
            total_parts: plan.total_parts(),
            description: self.description.clone(),
            duration: self.duration,
            extra: self.extra.clone(),
        }
    }
}

/// 上传成功的结果
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub task: UploadTask,
    pub session: UploadSession,
    /// 提交给 complete 的分片列表（按序号升序）
    pub parts: Vec<PartResult>,
    pub object: FinalizedObject,
}

/// 分片任务共享的只读上下文
struct PartContext {
    coordinator: Arc<dyn BackendCoordinator>,
    transporter: Arc<dyn PartTransporter>,
    session: UploadSession,
    source: PathBuf,
    retry: RetryPolicy,
    progress: Arc<ProgressAggregator>,
    task: Arc<Mutex<UploadTask>>,
    cancel_token: CancellationToken,
}

/// 上传编排器
pub struct UploadOrchestrator {
    coordinator: Arc<dyn BackendCoordinator>,
    transporter: Arc<dyn PartTransporter>,
    options: UploadOptions,
    cancel_token: CancellationToken,
    current_task: Mutex<Option<Arc<Mutex<UploadTask>>>>,
}

impl UploadOrchestrator {
    pub fn new(
        coordinator: Arc<dyn BackendCoordinator>,
        transporter: Arc<dyn PartTransporter>,
        options: UploadOptions,
    ) -> Self {
        Self {
            coordinator,
            transporter,
            options,
            cancel_token: CancellationToken::new(),
            current_task: Mutex::new(None),
        }
    }

    /// 使用外部提供的取消令牌
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 取消上传：停止派发新分片，执行中的分片结束后取消会话
    pub fn cancel(&self) {
        info!("收到取消上传请求");
        self.cancel_token.cancel();
    }

    /// 最近一次上传任务的快照
    pub fn task_snapshot(&self) -> Option<UploadTask> {
        self.current_task.lock().as_ref().map(|t| t.lock().clone())
    }

    /// 执行上传
    ///
    /// # 参数
    /// * `request` - 上传请求
    /// * `on_progress` - 进度回调（在聚合器内同步调用，不能阻塞）
    pub async fn upload(
        &self,
        request: UploadRequest,
        on_progress: Option<ProgressCallback>,
    ) -> UploadResult<CompletedUpload> {
        let task = Arc::new(Mutex::new(UploadTask::new(
            request.source.clone(),
            request.file_name.clone(),
            request.file_size,
        )));
        *self.current_task.lock() = Some(task.clone());

        info!(
            "开始上传: file={:?}, size={}, mime={}",
            request.source, request.file_size, request.mime_type
        );

        // 1. 校验与分片规划，失败时会话尚不存在
        let plan = match self.prepare(&request) {
            Ok(plan) => plan,
            Err(e) => return Err(fail_before_session(&task, e)),
        };
        if let Err(e) = verify_source_size(&request).await {
            return Err(fail_before_session(&task, e));
        }

        // 2. 创建会话
        let session = match self.coordinator.initiate(&request.metadata(&plan)).await {
            Ok(session) => session,
            Err(e) => {
                error!("创建上传会话失败: {}", e);
                return Err(fail_before_session(&task, e));
            }
        };

        // 3-4. 上传并合并，任何失败都要取消会话
        match self.run_session(&plan, &request, &session, &task, on_progress).await {
            Ok((parts, object)) => {
                task.lock().mark_completed()?;
                info!(
                    "上传完成: session={}, key={}, parts={}",
                    session.session_id,
                    session.storage_key,
                    parts.len()
                );
                let task = task.lock().clone();
                Ok(CompletedUpload {
                    task,
                    session,
                    parts,
                    object,
                })
            }
            Err(e) => Err(self.abort_session(&session, &task, e).await),
        }
    }

    fn prepare(&self, request: &UploadRequest) -> UploadResult<ChunkPlan> {
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        validate_upload_input(request.file_size, &request.mime_type, &self.options.limits)?;
        ChunkPlan::for_file(request.file_size, self.options.limits.max_file_size)
    }

    async fn run_session(
        &self,
        plan: &ChunkPlan,
        request: &UploadRequest,
        session: &UploadSession,
        task: &Arc<Mutex<UploadTask>>,
        on_progress: Option<ProgressCallback>,
    ) -> UploadResult<(Vec<PartResult>, FinalizedObject)> {
        task.lock()
            .mark_initiated(session.session_id.clone(), plan.total_parts())?;
        task.lock().mark_uploading()?;

        let progress = Arc::new(ProgressAggregator::new(
            plan.file_size,
            plan.parts.len(),
            Some(progress_sink(task.clone(), on_progress)),
        ));

        let ctx = Arc::new(PartContext {
            coordinator: self.coordinator.clone(),
            transporter: self.transporter.clone(),
            session: session.clone(),
            source: request.source.clone(),
            retry: self.options.retry.clone(),
            progress,
            task: task.clone(),
            cancel_token: self.cancel_token.clone(),
        });

        let scheduler =
            ConcurrencyScheduler::new(self.options.max_concurrency, self.cancel_token.clone());
        let results = scheduler
            .run_bounded(plan.parts.clone(), |part| upload_part(ctx.clone(), part))
            .await?;

        let parts = collect_part_results(results, plan.total_parts())?;

        task.lock().mark_completing()?;
        let object = self.coordinator.complete(session, &parts).await?;

        Ok((parts, object))
    }

    /// 取消会话，返回原始错误
    async fn abort_session(
        &self,
        session: &UploadSession,
        task: &Arc<Mutex<UploadTask>>,
        cause: UploadError,
    ) -> UploadError {
        match cause.part_number() {
            Some(part_number) => error!(
                "上传失败，取消会话: session={}, 失败分片=#{}, 错误: {}",
                session.session_id, part_number, cause
            ),
            None => error!(
                "上传失败，取消会话: session={}, 错误: {}",
                session.session_id, cause
            ),
        }

        if let Err(e) = task.lock().mark_aborting(cause.to_string()) {
            warn!("{}", e);
        }

        if let Err(e) = self.coordinator.abort(session).await {
            warn!("取消上传会话失败（已忽略）: session={}, {}", session.session_id, e);
        }

        if let Err(e) = task.lock().mark_aborted() {
            warn!("{}", e);
        }

        cause
    }
}

/// 确认源文件长度与请求中的大小一致，分片计划只覆盖 `file_size` 字节
async fn verify_source_size(request: &UploadRequest) -> UploadResult<()> {
    let actual = tokio::fs::metadata(&request.source).await?.len();
    if actual != request.file_size {
        return Err(UploadError::Validation(format!(
            "源文件大小不一致: {:?} 实际 {} bytes, 请求声明 {} bytes",
            request.source, actual, request.file_size
        )));
    }
    Ok(())
}

fn fail_before_session(task: &Arc<Mutex<UploadTask>>, cause: UploadError) -> UploadError {
    if let Err(e) = task.lock().mark_failed(cause.to_string()) {
        warn!("{}", e);
    }
    cause
}

/// 进度回调包装：同步任务记录后转发给调用方
fn progress_sink(task: Arc<Mutex<UploadTask>>, user: Option<ProgressCallback>) -> ProgressCallback {
    Arc::new(move |p: &UploadProgress| {
        task.lock().uploaded_size = p.loaded_bytes;
        if let Some(callback) = &user {
            callback(p);
        }
    })
}

/// 上传单个分片（带重试）
async fn upload_part(ctx: Arc<PartContext>, part: PartDescriptor) -> UploadResult<PartResult> {
    let retry = ctx.retry.clone();
    retry
        .attempt(part.part_number, |attempt| {
            attempt_part(ctx.clone(), part.clone(), attempt)
        })
        .await
}

/// 单次尝试：预签名 → 传输
///
/// 每次尝试都重新获取预签名 URL，避免重试时 URL 已过期
async fn attempt_part(
    ctx: Arc<PartContext>,
    part: PartDescriptor,
    attempt: u32,
) -> UploadResult<PartResult> {
    if ctx.cancel_token.is_cancelled() {
        return Err(UploadError::Cancelled);
    }

    let index = part.index();
    if attempt > 0 {
        // 从头重传，丢弃上一次尝试的进度
        let discarded = ctx.progress.chunk_bytes(index).unwrap_or(0);
        ctx.progress.report_chunk_progress(index, 0);
        debug!(
            "[分片#{}] 第 {} 次重试, 丢弃已发送 {} bytes",
            part.part_number, attempt, discarded
        );
    }

    let url = ctx
        .coordinator
        .presign_part(&ctx.session, part.part_number)
        .await?;

    let progress = ctx.progress.clone();
    let on_bytes: ByteProgress = Arc::new(move |sent| {
        progress.report_chunk_progress(index, sent);
    });

    let token = ctx
        .transporter
        .transport(&url, &ctx.source, &part, on_bytes)
        .await?;

    ctx.progress.report_chunk_progress(index, part.size());

    let (completed, total, percent, eta) = {
        let mut task = ctx.task.lock();
        task.completed_parts += 1;
        (task.completed_parts, task.total_parts, task.progress(), task.eta())
    };
    match eta {
        Some(secs) => info!(
            "[分片#{}] ✓ 上传成功 ({}/{} 完成, {:.1}%, 预计剩余 {}s)",
            part.part_number, completed, total, percent, secs
        ),
        None => info!(
            "[分片#{}] ✓ 上传成功 ({}/{} 完成, {:.1}%)",
            part.part_number, completed, total, percent
        ),
    }

    Ok(PartResult {
        part_number: part.part_number,
        integrity_token: token,
    })
}

/// 按分片序号整理结果，并确认 1..=total_parts 全部到齐
fn collect_part_results(results: Vec<PartResult>, total_parts: u32) -> UploadResult<Vec<PartResult>> {
    // 同一分片只保留一个结果
    let mut by_number: BTreeMap<u32, PartResult> = BTreeMap::new();
    for result in results {
        by_number.insert(result.part_number, result);
    }

    let missing: Vec<u32> = (1..=total_parts)
        .filter(|n| !by_number.contains_key(n))
        .collect();
    if !missing.is_empty() {
        return Err(UploadError::IncompleteUpload(format!(
            "缺少分片: {:?}",
            missing
        )));
    }
    if by_number.len() != total_parts as usize {
        return Err(UploadError::IncompleteUpload(format!(
            "分片数量不一致: 期望 {}, 实际 {}",
            total_parts,
            by_number.len()
        )));
    }

    Ok(by_number.into_values().collect())
}
