// 分片并发调度器
//
// 功能：
// - 固定大小的并发池（Semaphore 限制同时执行的任务数）
// - JoinSet 管理已派发的任务
// - 槽位池为每个执行中的任务分配逻辑线程ID（日志追踪）
// - 失败即停止派发，但等待已派发的任务结束后再返回第一个失败
// - 取消令牌触发后立即停止派发，已派发的任务结果被丢弃

use crate::uploader::error::{UploadError, UploadResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 默认最大并发数
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

// =====================================================
// 线程槽位池
// =====================================================

/// 线程槽位池
///
/// 为每个执行中的任务分配一个唯一的槽位ID（1..=max_slots），
/// 任务结束后归还，保证同一时刻每个槽位只有一个任务
#[derive(Debug)]
struct WorkerSlotPool {
    available_slots: Mutex<Vec<usize>>,
    max_slots: usize,
}

impl WorkerSlotPool {
    fn new(max_slots: usize) -> Self {
        // 从大到小入栈，pop 时先拿到小的
        let slots: Vec<usize> = (1..=max_slots).rev().collect();
        Self {
            available_slots: Mutex::new(slots),
            max_slots,
        }
    }

    /// 获取一个空闲槽位，没有则返回备用ID
    fn acquire(&self) -> usize {
        self.available_slots.lock().pop().unwrap_or(self.max_slots + 1)
    }

    fn release(&self, slot_id: usize) {
        if slot_id <= self.max_slots {
            let mut slots = self.available_slots.lock();
            if !slots.contains(&slot_id) {
                slots.push(slot_id);
            }
        }
    }
}

// =====================================================
// 调度器
// =====================================================

/// 有界并发调度器
#[derive(Debug, Clone)]
pub struct ConcurrencyScheduler {
    max_concurrency: usize,
    cancel_token: CancellationToken,
}

impl ConcurrencyScheduler {
    /// # 参数
    /// * `max_concurrency` - 同时执行的最大任务数（至少为 1）
    /// * `cancel_token` - 外部取消令牌
    pub fn new(max_concurrency: usize, cancel_token: CancellationToken) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            cancel_token,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 以有界并发执行所有任务
    ///
    /// 返回结果按完成顺序排列。出现第一个失败后不再派发新任务，
    /// 等已派发的任务全部结束后返回该失败。
    pub async fn run_bounded<T, R, F, Fut>(&self, tasks: Vec<T>, mut run: F) -> UploadResult<Vec<R>>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = UploadResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let total = tasks.len();
        info!(
            "[并发调度] 开始执行 {} 个任务，并发数: {}",
            total, self.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let slot_pool = Arc::new(WorkerSlotPool::new(self.max_concurrency));
        let mut join_set: JoinSet<UploadResult<R>> = JoinSet::new();
        let mut results = Vec::with_capacity(total);
        let mut first_error: Option<UploadError> = None;
        let mut pending = tasks.into_iter();

        loop {
            if first_error.is_some() {
                break;
            }
            if self.cancel_token.is_cancelled() {
                info!("[并发调度] 收到取消信号，停止派发新任务");
                first_error = Some(UploadError::Cancelled);
                break;
            }

            // 尝试获取许可，池满时等待一个任务结束
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    tokio::select! {
                        joined = join_set.join_next() => {
                            if let Some(joined) = joined {
                                collect_result(joined, &mut results, &mut first_error);
                            }
                        }
                        _ = self.cancel_token.cancelled() => {}
                    }
                    continue;
                }
            };

            let Some(task) = pending.next() else {
                break;
            };

            let fut = run(task);
            let slot_pool = slot_pool.clone();
            join_set.spawn(async move {
                let slot_id = slot_pool.acquire();
                debug!("[线程{}] 开始执行任务", slot_id);

                let result = fut.await;

                debug!("[线程{}] 任务结束, 成功={}", slot_id, result.is_ok());
                slot_pool.release(slot_id);
                drop(permit);
                result
            });

            // 非阻塞收集已完成的任务
            while let Some(joined) = join_set.try_join_next() {
                collect_result(joined, &mut results, &mut first_error);
            }
        }

        // 等待已派发的任务全部结束
        let in_flight = join_set.len();
        if in_flight > 0 && first_error.is_some() {
            info!("[并发调度] 等待 {} 个执行中的任务结束", in_flight);
        }
        while let Some(joined) = join_set.join_next().await {
            collect_result(joined, &mut results, &mut first_error);
        }

        match first_error {
            Some(e) => {
                error!("[并发调度] 执行失败: {}", e);
                Err(e)
            }
            None => {
                info!("[并发调度] 所有 {} 个任务执行完成", results.len());
                Ok(results)
            }
        }
    }
}

/// 处理单个任务的结果，只保留第一个失败
fn collect_result<R>(
    joined: Result<UploadResult<R>, JoinError>,
    results: &mut Vec<R>,
    first_error: &mut Option<UploadError>,
) {
    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(UploadError::Internal(format!("任务异常: {}", e))),
    };

    match outcome {
        Ok(value) => results.push(value),
        Err(e) => {
            if first_error.is_none() {
                *first_error = Some(e);
            } else {
                debug!("[并发调度] 忽略后续失败: {}", e);
            }
        }
    }
}
