// 上传任务记录
//
// 状态流转：
//   Pending → Initiated → Uploading → Completing → Completed
//   Initiated / Uploading / Completing → Aborting → Aborted
//   Pending → Failed（会话创建前失败，无需取消）
//
// Completed / Aborted / Failed 为终态，只能进入一次。

use crate::uploader::error::{UploadError, UploadResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// 等待中（尚未创建会话）
    Pending,
    /// 会话已创建
    Initiated,
    /// 上传中
    Uploading,
    /// 合并分片中
    Completing,
    /// 已完成
    Completed,
    /// 取消会话中
    Aborting,
    /// 已取消
    Aborted,
    /// 会话创建前失败
    Failed,
}

impl UploadState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Completed | UploadState::Aborted | UploadState::Failed
        )
    }

    /// 是否允许转换到 `next`
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (*self, next),
            (Pending, Initiated)
                | (Pending, Failed)
                | (Initiated, Uploading)
                | (Initiated, Aborting)
                | (Uploading, Completing)
                | (Uploading, Aborting)
                | (Completing, Completed)
                | (Completing, Aborting)
                | (Aborting, Aborted)
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件名
    pub file_name: String,
    /// 文件大小
    pub total_size: u64,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 任务状态
    pub status: UploadState,
    /// 会话ID（initiate 成功后才有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// 总分片数
    #[serde(default)]
    pub total_parts: u32,
    /// 已完成分片数
    #[serde(default)]
    pub completed_parts: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始上传时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)，进入终态时设置
    pub finished_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(local_path: PathBuf, file_name: String, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            file_name,
            total_size,
            uploaded_size: 0,
            status: UploadState::Pending,
            session_id: None,
            total_parts: 0,
            completed_parts: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_size as f64 / self.total_size as f64) * 100.0
    }

    /// 估算剩余时间（秒）
    ///
    /// 按开始上传以来的平均速度估算，未开始、无进度或已结束时返回 None
    pub fn eta(&self) -> Option<u64> {
        let started_at = self.started_at?;
        if self.uploaded_size == 0 || self.status.is_terminal() {
            return None;
        }

        let elapsed = (chrono::Utc::now().timestamp() - started_at).max(1) as u64;
        let remaining = self.total_size.saturating_sub(self.uploaded_size);
        Some(remaining.saturating_mul(elapsed) / self.uploaded_size)
    }

    fn transition(&mut self, next: UploadState) -> UploadResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(UploadError::Internal(format!(
                "非法状态转换: {:?} -> {:?} (task={})",
                self.status, next, self.id
            )));
        }

        info!("上传任务 {} 状态: {:?} -> {:?}", self.id, self.status, next);
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }

    /// 标记会话已创建
    pub fn mark_initiated(&mut self, session_id: String, total_parts: u32) -> UploadResult<()> {
        self.transition(UploadState::Initiated)?;
        self.session_id = Some(session_id);
        self.total_parts = total_parts;
        Ok(())
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) -> UploadResult<()> {
        self.transition(UploadState::Uploading)?;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }

    /// 标记为合并中
    pub fn mark_completing(&mut self) -> UploadResult<()> {
        self.transition(UploadState::Completing)
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) -> UploadResult<()> {
        self.transition(UploadState::Completed)?;
        self.uploaded_size = self.total_size;
        self.completed_parts = self.total_parts;
        Ok(())
    }

    /// 标记为取消中，记录触发取消的错误
    pub fn mark_aborting(&mut self, error: String) -> UploadResult<()> {
        self.transition(UploadState::Aborting)?;
        self.error = Some(error);
        Ok(())
    }

    /// 标记为已取消
    pub fn mark_aborted(&mut self) -> UploadResult<()> {
        self.transition(UploadState::Aborted)
    }

    /// 标记为失败（会话创建前）
    pub fn mark_failed(&mut self, error: String) -> UploadResult<()> {
        self.transition(UploadState::Failed)?;
        self.error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> UploadTask {
        UploadTask::new(PathBuf::from("./lecture.mp4"), "lecture.mp4".to_string(), 1000)
    }

    #[test]
    fn test_task_creation() {
        let task = new_task();
        assert_eq!(task.status, UploadState::Pending);
        assert_eq!(task.uploaded_size, 0);
        assert_eq!(task.progress(), 0.0);
        assert!(task.session_id.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = new_task();

        task.mark_initiated("sess-1".to_string(), 4).unwrap();
        assert_eq!(task.status, UploadState::Initiated);
        assert_eq!(task.session_id.as_deref(), Some("sess-1"));

        task.mark_uploading().unwrap();
        assert!(task.started_at.is_some());

        task.uploaded_size = 250;
        assert_eq!(task.progress(), 25.0);

        task.mark_completing().unwrap();
        task.mark_completed().unwrap();
        assert_eq!(task.status, UploadState::Completed);
        assert_eq!(task.uploaded_size, task.total_size);
        assert_eq!(task.completed_parts, 4);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_abort_path() {
        let mut task = new_task();
        task.mark_initiated("sess-1".to_string(), 2).unwrap();
        task.mark_uploading().unwrap();

        task.mark_aborting("分片 #2 上传失败".to_string()).unwrap();
        assert_eq!(task.status, UploadState::Aborting);
        task.mark_aborted().unwrap();
        assert_eq!(task.status, UploadState::Aborted);
        assert_eq!(task.error.as_deref(), Some("分片 #2 上传失败"));
    }

    #[test]
    fn test_terminal_state_entered_once() {
        let mut task = new_task();
        task.mark_initiated("sess-1".to_string(), 1).unwrap();
        task.mark_uploading().unwrap();
        task.mark_completing().unwrap();
        task.mark_completed().unwrap();

        assert!(task.mark_completed().is_err());
        assert!(task.mark_aborting("late".to_string()).is_err());
        assert_eq!(task.status, UploadState::Completed);
    }

    #[test]
    fn test_failed_only_before_session() {
        let mut task = new_task();
        task.mark_failed("文件大小必须大于 0".to_string()).unwrap();
        assert!(task.status.is_terminal());

        let mut task = new_task();
        task.mark_initiated("sess-1".to_string(), 1).unwrap();
        assert!(task.mark_failed("x".to_string()).is_err());
    }

    #[test]
    fn test_eta() {
        let mut task = new_task();
        assert_eq!(task.eta(), None);

        task.mark_initiated("sess-1".to_string(), 4).unwrap();
        task.mark_uploading().unwrap();
        assert_eq!(task.eta(), None);

        task.started_at = Some(chrono::Utc::now().timestamp() - 10);
        task.uploaded_size = 250;
        // 10 秒传了 1/4，剩余约 30 秒（秒级时钟可能跳一格）
        let eta = task.eta().unwrap();
        assert!((30..=33).contains(&eta), "eta={}", eta);

        task.mark_aborting("x".to_string()).unwrap();
        task.mark_aborted().unwrap();
        assert_eq!(task.eta(), None);
    }

    #[test]
    fn test_illegal_skip() {
        let mut task = new_task();
        assert!(task.mark_uploading().is_err());
        assert!(task.mark_completing().is_err());
        assert_eq!(task.status, UploadState::Pending);
    }
}
