//! 日志系统配置
//!
//! 控制台输出 + 文件持久化。日志文件按进程启动时间命名，超过单文件大小上限后
//! 滚动到带序号的新文件，启动时清理超过保留天数的旧文件。
//!
//! 文件名格式：
//! - `course-upload.YYYY-MM-DD-HHMMSS.log`
//! - `course-upload.YYYY-MM-DD-HHMMSS_N.log`

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "course-upload.";

const LOG_FILE_SUFFIX: &str = ".log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动写入状态
struct RotatingState {
    log_dir: PathBuf,
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    started: String,
    /// 0 为基础文件，之后每次滚动加 1
    index: u32,
    file: File,
    written: u64,
    max_file_size: u64,
}

impl RotatingState {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let started = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = open_append(&log_dir.join(log_file_name(&started, 0)))?;
        Ok(Self {
            log_dir,
            started,
            index: 0,
            file,
            written: 0,
            max_file_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = open_append(&self.log_dir.join(log_file_name(&self.started, self.index)))?;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志导致无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn log_file_name(started: &str, index: u32) -> String {
    if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, started, LOG_FILE_SUFFIX)
    } else {
        format!("{}{}_{}{}", LOG_FILE_PREFIX, started, index, LOG_FILE_SUFFIX)
    }
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct RotatingLogWriter {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingLogWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 文件输出不可用时回退到仅控制台输出。
/// `RUST_LOG` 环境变量优先于配置中的日志级别。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        match open_log_writer(config) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("日志文件不可用: {:?}, 错误: {}, 回退到仅控制台输出", config.log_dir, e);
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = writer else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

fn open_log_writer(config: &LogConfig) -> io::Result<RotatingLogWriter> {
    fs::create_dir_all(&config.log_dir)?;
    RotatingLogWriter::new(config.log_dir.clone(), config.max_file_size)
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 只处理本程序的日志文件；文件名里没有日期时按修改时间判断。
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        let expired = match date_from_file_name(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => modified_before(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }

    removed
}

/// 从 `course-upload.YYYY-MM-DD[-HHMMSS][_N].log` 中取出日期
fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn modified_before(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
        return false;
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified) > retention
}
