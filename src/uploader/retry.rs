// 重试策略
//
// 指数退避：第 n 次失败后等待 base_delay * backoff_factor^n
// - 默认 3 次重试，延迟序列 1000ms → 2000ms → 4000ms
// - 只有 Network / Server 错误会重试
// - 重试耗尽后返回 PartFailed，携带分片序号、尝试次数和原始错误

use crate::uploader::error::{UploadError, UploadResult};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认初始退避延迟（毫秒）
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// 默认退避倍数
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            DEFAULT_BACKOFF_FACTOR,
        )
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: u32) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 最多尝试次数（首次 + 重试）
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// 计算第 `attempt_index` 次失败后的退避延迟
    ///
    /// # 延迟序列（默认配置）
    /// - attempt_index=0: 1000ms
    /// - attempt_index=1: 2000ms
    /// - attempt_index=2: 4000ms
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        let multiplier = self.backoff_factor.saturating_pow(attempt_index);
        self.base_delay.saturating_mul(multiplier)
    }

    /// 执行操作，失败时按策略重试
    ///
    /// `op` 接收当前尝试序号（从 0 开始）
    pub async fn attempt<T, F, Fut>(&self, part_number: u32, op: F) -> UploadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        self.attempt_with_sleep(part_number, op, tokio::time::sleep)
            .await
    }

    /// 与 `attempt` 相同，但由调用方提供退避等待的实现
    pub async fn attempt_with_sleep<T, F, Fut, S, SFut>(
        &self,
        part_number: u32,
        mut op: F,
        mut sleep: S,
    ) -> UploadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UploadResult<T>>,
        S: FnMut(Duration) -> SFut,
        SFut: Future<Output = ()>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    error!(
                        "[分片#{}] 上传失败（不可重试）: {}",
                        part_number, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                            part_number,
                            delay.as_millis(),
                            attempt + 1,
                            self.max_retries,
                            e
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        error!(
            "[分片#{}] 上传失败，已达最大重试次数 ({})",
            part_number, self.max_retries
        );

        let cause = last_error.unwrap_or_else(|| UploadError::Network("上传失败".to_string()));
        Err(UploadError::PartFailed {
            part_number,
            attempts: self.max_attempts(),
            cause: Box::new(cause),
        })
    }
}
