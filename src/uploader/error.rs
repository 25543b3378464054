// 上传错误类型
//
// 所有上传路径上的错误都归入 UploadError，各处理点按变体穷举匹配：
// - Network / Server：可重试（由 RetryPolicy 在本地消化）
// - Validation / MissingToken / IncompleteUpload：不可重试
// - PartFailed：重试耗尽后携带分片上下文的包装错误
// - Abort：仅记录日志，不会返回给调用方
// - Cancelled / Io / Internal：不可重试，会话已创建时触发取消

use thiserror::Error;

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 输入非法，或协调服务拒绝创建会话（4xx）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 连接层失败（连接重置、DNS、超时）
    #[error("网络错误: {0}")]
    Network(String),

    /// 非 2xx 响应
    #[error("服务器错误: status={status}, {message}")]
    Server { status: u16, message: String },

    /// 存储返回 2xx 但缺少 ETag 响应头
    #[error("分片 #{part_number} 上传响应缺少 ETag")]
    MissingToken { part_number: u32 },

    /// 协调服务认为提交的分片与其记录不一致
    #[error("分片不完整: {0}")]
    IncompleteUpload(String),

    /// 取消会话失败（只记录，不向上抛出）
    #[error("取消上传会话失败: {0}")]
    Abort(String),

    /// 重试耗尽
    #[error("分片 #{part_number} 上传失败，已尝试 {attempts} 次: {cause}")]
    PartFailed {
        part_number: u32,
        attempts: u32,
        #[source]
        cause: Box<UploadError>,
    },

    /// 外部取消信号
    #[error("上传已取消")]
    Cancelled,

    /// 读取本地源文件失败
    #[error("读取源文件失败: {0}")]
    Io(#[from] std::io::Error),

    /// 分片任务异常退出（panic 或状态机被破坏）
    #[error("内部错误: {0}")]
    Internal(String),
}

impl UploadError {
    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Network(_) | UploadError::Server { .. } => true,
            UploadError::Validation(_)
            | UploadError::MissingToken { .. }
            | UploadError::IncompleteUpload(_)
            | UploadError::Abort(_)
            | UploadError::PartFailed { .. }
            | UploadError::Cancelled
            | UploadError::Io(_)
            | UploadError::Internal(_) => false,
        }
    }

    /// 构造服务器错误
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        UploadError::Server {
            status,
            message: message.into(),
        }
    }

    /// 失败发生的分片序号（仅对分片级错误有意义）
    pub fn part_number(&self) -> Option<u32> {
        match self {
            UploadError::MissingToken { part_number } => Some(*part_number),
            UploadError::PartFailed { part_number, .. } => Some(*part_number),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        // 带状态码的错误来自 error_for_status，其余都是连接层问题
        match e.status() {
            Some(status) => UploadError::server(status.as_u16(), e.to_string()),
            None => UploadError::Network(e.to_string()),
        }
    }
}

/// 上传结果别名
pub type UploadResult<T> = std::result::Result<T, UploadError>;
