use clap::Parser;
use course_upload::{
    config::AppConfig,
    logging,
    uploader::{
        HttpCoordinatorClient, HttpPartTransporter, ProgressCallback, UploadOptions,
        UploadOrchestrator, UploadProgress, UploadRequest,
    },
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 课程视频分片上传工具
#[derive(Debug, Parser)]
#[command(name = "course-upload", version, about)]
struct Cli {
    /// 要上传的视频文件
    file: PathBuf,

    /// 课程标题
    #[arg(long)]
    title: String,

    /// MIME 类型（默认按扩展名推断）
    #[arg(long)]
    mime_type: Option<String>,

    /// 视频时长（秒）
    #[arg(long)]
    duration: Option<f64>,

    /// 课程描述
    #[arg(long)]
    description: Option<String>,

    /// 配置文件路径
    #[arg(long, default_value = "config/app.toml")]
    config: String,
}

/// 进度日志：只在整数百分比变化时输出
fn progress_logger() -> ProgressCallback {
    let last = Arc::new(AtomicU8::new(u8::MAX));
    Arc::new(move |p: &UploadProgress| {
        if last.swap(p.percentage, Ordering::Relaxed) != p.percentage {
            info!(
                "上传进度: {}% ({}/{} bytes, 分片 #{} / 共 {} 个)",
                p.percentage,
                p.loaded_bytes,
                p.total_bytes,
                p.chunk_index + 1,
                p.total_chunks
            );
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(&cli.config).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("course-upload v{} 启动", env!("CARGO_PKG_VERSION"));

    let coordinator = Arc::new(HttpCoordinatorClient::new(&config.coordinator)?);
    let transporter = Arc::new(HttpPartTransporter::new(Duration::from_secs(
        config.upload.part_timeout_secs,
    ))?);
    let orchestrator = UploadOrchestrator::new(
        coordinator,
        transporter,
        UploadOptions::from_config(&config.upload),
    );

    // Ctrl+C 触发取消：停止派发，等待执行中的分片后取消会话
    let cancel_token = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消上传...");
            cancel_token.cancel();
        }
    });

    let mut request = UploadRequest::from_file(&cli.file, cli.title).await?;
    if let Some(mime_type) = cli.mime_type {
        request = request.with_mime_type(mime_type);
    }
    if let Some(duration) = cli.duration {
        request = request.with_duration(duration);
    }
    if let Some(description) = cli.description {
        request = request.with_description(description);
    }

    match orchestrator.upload(request, Some(progress_logger())).await {
        Ok(done) => {
            info!(
                "✓ 上传成功: task={}, parts={}",
                done.task.id,
                done.parts.len()
            );
            println!("{}", serde_json::to_string_pretty(&done.object)?);
            Ok(())
        }
        Err(e) => {
            error!("上传失败: {}", e);
            Err(e.into())
        }
    }
}
