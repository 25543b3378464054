// 分片传输
//
// 将分片字节范围 PUT 到预签名 URL，返回存储层的 ETag。
// 注意：不设置 Content-Type，预签名 URL 的签名中已经约定了请求头，
// 额外的头会导致签名校验失败。

use crate::uploader::chunk::PartDescriptor;
use crate::uploader::error::{UploadError, UploadResult};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, ETAG};
use reqwest::{Body, Client};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 请求体分块大小: 256KB，每发送一块上报一次进度
const BODY_PIECE_SIZE: usize = 256 * 1024;

/// 字节级进度回调，参数为本次尝试已发送的字节数
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// 分片传输接口
#[async_trait]
pub trait PartTransporter: Send + Sync {
    /// 上传 `source` 中 `part` 对应的字节范围，返回 ETag（已去掉引号）
    async fn transport(
        &self,
        url: &str,
        source: &Path,
        part: &PartDescriptor,
        on_progress: ByteProgress,
    ) -> UploadResult<String>;
}

/// 去掉 ETag 的弱校验前缀 `W/` 和两侧的引号
pub fn strip_token_quotes(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix("W/").unwrap_or(raw).trim_matches('"')
}

/// 从响应头中提取 ETag
pub fn extract_integrity_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(ETAG)?.to_str().ok()?;
    let token = strip_token_quotes(raw);
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// 读取分片数据
pub async fn read_part_data(source: &Path, part: &PartDescriptor) -> UploadResult<Vec<u8>> {
    let source: PathBuf = source.to_path_buf();
    let start = part.byte_start;
    let size = part.size() as usize;

    tokio::task::spawn_blocking(move || -> UploadResult<Vec<u8>> {
        let mut file = std::fs::File::open(&source)?;
        file.seek(SeekFrom::Start(start))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    })
    .await
    .map_err(|e| UploadError::Internal(format!("读取分片任务异常: {}", e)))?
}

/// 基于 reqwest 的分片传输
#[derive(Debug, Clone)]
pub struct HttpPartTransporter {
    client: Client,
    timeout: Duration,
}

impl HttpPartTransporter {
    /// # 参数
    /// * `timeout` - 单次传输超时，超时按网络错误处理
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl PartTransporter for HttpPartTransporter {
    async fn transport(
        &self,
        url: &str,
        source: &Path,
        part: &PartDescriptor,
        on_progress: ByteProgress,
    ) -> UploadResult<String> {
        let data = Bytes::from(read_part_data(source, part).await?);
        let size = data.len();

        debug!(
            "[分片#{}] 开始传输 (范围: {}-{}, 大小: {} bytes)",
            part.part_number,
            part.byte_start,
            part.byte_end - 1,
            size
        );

        // 分块发送，按已发送字节数上报进度
        let progress = on_progress.clone();
        let pieces = (0..size).step_by(BODY_PIECE_SIZE).map(move |start| {
            let end = std::cmp::min(start + BODY_PIECE_SIZE, size);
            progress(end as u64);
            Ok::<_, std::io::Error>(data.slice(start..end))
        });
        let body = Body::wrap_stream(futures::stream::iter(pieces));

        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, size)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::server(status.as_u16(), body));
        }

        let token = extract_integrity_token(response.headers()).ok_or(
            UploadError::MissingToken {
                part_number: part.part_number,
            },
        )?;

        on_progress(size as u64);
        debug!("[分片#{}] 传输成功, etag={}", part.part_number, token);

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_strip_token_quotes() {
        assert_eq!(strip_token_quotes("\"etag-1\""), "etag-1");
        assert_eq!(strip_token_quotes("etag-2"), "etag-2");
        assert_eq!(strip_token_quotes(" \"etag-3\" "), "etag-3");
        assert_eq!(strip_token_quotes("W/\"etag-4\""), "etag-4");
    }

    #[test]
    fn test_extract_integrity_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_integrity_token(&headers), None);

        headers.insert(ETAG, HeaderValue::from_static("\"\""));
        assert_eq!(extract_integrity_token(&headers), None);

        headers.insert(ETAG, HeaderValue::from_static("W/\"\""));
        assert_eq!(extract_integrity_token(&headers), None);

        headers.insert(ETAG, HeaderValue::from_static("\"9b2cf535f27731c974343645a3985328\""));
        assert_eq!(
            extract_integrity_token(&headers).as_deref(),
            Some("9b2cf535f27731c974343645a3985328")
        );
    }

    #[tokio::test]
    async fn test_read_part_data() {
        let mut file = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..100u8).collect();
        file.write_all(&content).unwrap();

        let part = PartDescriptor::new(2, 40..70);
        let data = read_part_data(file.path(), &part).await.unwrap();
        assert_eq!(data, content[40..70].to_vec());
    }

    #[tokio::test]
    async fn test_read_part_data_past_end() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 10]).unwrap();

        let part = PartDescriptor::new(1, 0..20);
        let result = read_part_data(file.path(), &part).await;
        assert!(matches!(result, Err(UploadError::Io(_))));
    }
}
