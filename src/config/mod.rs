// 配置管理模块

use crate::uploader::chunk::{default_video_mime_types, DEFAULT_MAX_FILE_SIZE, DEFAULT_MIN_FILE_SIZE};
use crate::uploader::retry::{DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_RETRIES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 协调服务配置
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024 // 20MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 协调服务配置
///
/// 协调服务负责创建上传会话、签发分片预签名 URL、合并分片
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 服务地址，如 "https://api.example.com/api"
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer Token（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大并发分片数
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 退避倍数
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    /// 单次分片传输超时（秒），超时按网络错误处理
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    /// 最小文件大小（字节）
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,
    /// 最大文件大小（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 允许上传的 MIME 类型
    #[serde(default = "default_video_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_backoff_factor() -> u32 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_part_timeout_secs() -> u64 {
    120
}

fn default_min_file_size() -> u64 {
    DEFAULT_MIN_FILE_SIZE
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            part_timeout_secs: default_part_timeout_secs(),
            min_file_size: default_min_file_size(),
            max_file_size: default_max_file_size(),
            allowed_mime_types: default_video_mime_types(),
        }
    }
}

impl UploadConfig {
    /// 校验配置项组合是否合理
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency 必须大于 0".to_string());
        }
        if self.backoff_factor == 0 {
            return Err("backoff_factor 必须大于 0".to_string());
        }
        if self.part_timeout_secs == 0 {
            return Err("part_timeout_secs 必须大于 0".to_string());
        }
        if self.min_file_size == 0 || self.min_file_size > self.max_file_size {
            return Err(format!(
                "文件大小范围无效: [{}, {}]",
                self.min_file_size, self.max_file_size
            ));
        }
        if self.allowed_mime_types.is_empty() {
            return Err("allowed_mime_types 不能为空".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .map_err(anyhow::Error::msg)
            .context("配置文件中的上传参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .map_err(anyhow::Error::msg)
            .context("保存配置失败：上传参数无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：写出默认配置，便于用户修改
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
