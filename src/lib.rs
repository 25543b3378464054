// Course Video Upload Library
// 课程视频分片上传客户端核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use uploader::{
    BackendCoordinator, CompletedUpload, HttpCoordinatorClient, HttpPartTransporter,
    PartTransporter, UploadError, UploadOptions, UploadOrchestrator, UploadProgress,
    UploadRequest, UploadResult, UploadState, UploadTask,
};
