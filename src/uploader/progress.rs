//! 上传进度聚合
//!
//! 每个分片只记录"最近一次已知的字节数"，上报时覆盖而不是累加：
//! 分片重试从头开始时，旧的字节数被新值替换，总量不会重复计算。

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// 对外发布的进度快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    /// 已上传字节数（所有分片之和）
    pub loaded_bytes: u64,
    /// 文件总大小
    pub total_bytes: u64,
    /// 百分比（0-100，四舍五入）
    pub percentage: u8,
    /// 触发本次更新的分片下标（从 0 开始）
    pub chunk_index: usize,
    /// 分片总数
    pub total_chunks: usize,
}

/// 进度回调
///
/// 在聚合器锁内同步调用，回调中不能阻塞
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

struct ProgressState {
    last_known_bytes: Vec<u64>,
    total_loaded: u64,
}

/// 进度聚合器
pub struct ProgressAggregator {
    total_bytes: u64,
    state: Mutex<ProgressState>,
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("total_bytes", &self.total_bytes)
            .field("loaded_bytes", &self.loaded_bytes())
            .finish()
    }
}

impl ProgressAggregator {
    /// 创建进度聚合器
    ///
    /// # 参数
    /// * `total_bytes` - 文件总大小
    /// * `total_chunks` - 分片总数
    /// * `callback` - 进度回调（可选）
    pub fn new(total_bytes: u64, total_chunks: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            total_bytes,
            state: Mutex::new(ProgressState {
                last_known_bytes: vec![0; total_chunks],
                total_loaded: 0,
            }),
            callback,
        }
    }

    /// 上报某个分片的已上传字节数（覆盖语义）
    pub fn report_chunk_progress(&self, chunk_index: usize, loaded_bytes: u64) -> UploadProgress {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let total_chunks = state.last_known_bytes.len();

        match state.last_known_bytes.get_mut(chunk_index) {
            Some(slot) => {
                let previous = std::mem::replace(slot, loaded_bytes);
                state.total_loaded = state.total_loaded - previous + loaded_bytes;
            }
            None => {
                warn!(
                    "忽略越界的分片进度: chunk_index={}, total_chunks={}",
                    chunk_index, total_chunks
                );
            }
        }

        let progress = UploadProgress {
            loaded_bytes: state.total_loaded,
            total_bytes: self.total_bytes,
            percentage: percentage(state.total_loaded, self.total_bytes),
            chunk_index,
            total_chunks,
        };

        // 持锁回调，保证回调看到的总量单调对应上报顺序
        if let Some(callback) = &self.callback {
            callback(&progress);
        }

        progress
    }

    /// 当前已上传字节数
    pub fn loaded_bytes(&self) -> u64 {
        self.state.lock().total_loaded
    }

    /// 某个分片最近一次上报的字节数
    pub fn chunk_bytes(&self, chunk_index: usize) -> Option<u64> {
        self.state.lock().last_known_bytes.get(chunk_index).copied()
    }
}

fn percentage(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (loaded as f64 * 100.0 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}
