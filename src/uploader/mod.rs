// 分片上传模块
//
// - chunk: 分片规划与输入校验
// - coordinator: 协调服务（创建会话 / 预签名 / 合并 / 取消）
// - transport: 分片 PUT 到预签名 URL
// - retry: 指数退避重试
// - scheduler: 有界并发调度
// - progress: 分片进度聚合
// - task: 上传任务状态机
// - orchestrator: 串联以上组件的上传编排器

pub mod chunk;
pub mod coordinator;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod transport;

pub use chunk::{
    compute_part_descriptors, guess_video_mime, select_part_size, validate_upload_input,
    ChunkPlan, PartDescriptor, UploadLimits,
};
pub use coordinator::{
    BackendCoordinator, FinalizedObject, HttpCoordinatorClient, PartResult, UploadMetadata,
    UploadSession,
};
pub use error::{UploadError, UploadResult};
pub use orchestrator::{CompletedUpload, UploadOptions, UploadOrchestrator, UploadRequest};
pub use progress::{ProgressAggregator, ProgressCallback, UploadProgress};
pub use retry::RetryPolicy;
pub use scheduler::ConcurrencyScheduler;
pub use task::{UploadState, UploadTask};
pub use transport::{ByteProgress, HttpPartTransporter, PartTransporter};
