// 上传协调服务客户端
//
// 协调服务的 HTTP 接口：
// - POST   /uploads/initiate                创建上传会话
// - POST   /uploads/{sessionId}/parts/presign  获取分片预签名 URL（支持批量）
// - POST   /uploads/{sessionId}/complete     合并分片
// - DELETE /uploads/{sessionId}              取消会话（尽力而为）

use crate::config::CoordinatorConfig;
use crate::uploader::error::{UploadError, UploadResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 创建会话时提交的元数据
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub title: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub part_size: u64,
    pub total_parts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 视频时长（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// 其他业务字段（如 lectureId），原样透传
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 上传会话
///
/// 由 initiate 创建，之后只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub upload_id: String,
    pub storage_key: String,
    pub bucket: String,
    pub part_size: u64,
    pub total_parts: u32,
}

/// 单个分片的上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartResult {
    pub part_number: u32,
    #[serde(rename = "eTag")]
    pub integrity_token: String,
}

/// 合并完成后的对象描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 协调服务接口
#[async_trait]
pub trait BackendCoordinator: Send + Sync {
    /// 创建上传会话
    async fn initiate(&self, metadata: &UploadMetadata) -> UploadResult<UploadSession>;

    /// 批量获取分片预签名 URL
    async fn presign_parts(
        &self,
        session: &UploadSession,
        part_numbers: &[u32],
    ) -> UploadResult<HashMap<u32, String>>;

    /// 合并分片，`parts` 必须按分片序号升序
    async fn complete(
        &self,
        session: &UploadSession,
        parts: &[PartResult],
    ) -> UploadResult<FinalizedObject>;

    /// 取消会话
    async fn abort(&self, session: &UploadSession) -> UploadResult<()>;

    /// 获取单个分片的预签名 URL
    async fn presign_part(&self, session: &UploadSession, part_number: u32) -> UploadResult<String> {
        let mut urls = self.presign_parts(session, &[part_number]).await?;
        urls.remove(&part_number).ok_or_else(|| {
            UploadError::server(
                StatusCode::OK.as_u16(),
                format!("预签名响应缺少分片 #{}", part_number),
            )
        })
    }
}

// =====================================================
// HTTP 实现
// =====================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    session_id: String,
    upload_id: String,
    key: String,
    bucket: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignRequest<'a> {
    part_numbers: &'a [u32],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignedPart {
    part_number: u32,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    parts: Vec<PresignedPart>,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    parts: &'a [PartResult],
}

/// 协调服务 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpCoordinatorClient {
    /// 创建客户端
    pub fn new(config: &CoordinatorConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化协调服务客户端: base_url={}, token={}",
            config.base_url,
            if config.auth_token.is_some() {
                "已设置"
            } else {
                "未设置"
            }
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn session_path(session: &UploadSession, suffix: &str) -> String {
        format!(
            "/uploads/{}{}",
            urlencoding::encode(&session.session_id),
            suffix
        )
    }
}

/// 读取失败响应的状态码和正文
async fn error_parts(response: Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    (status, body)
}

/// 解析成功响应的 JSON
async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> UploadResult<T> {
    let status = response.status();
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        UploadError::server(
            status.as_u16(),
            format!("解析响应失败: {}, body={}", e, text),
        )
    })
}

#[async_trait]
impl BackendCoordinator for HttpCoordinatorClient {
    async fn initiate(&self, metadata: &UploadMetadata) -> UploadResult<UploadSession> {
        info!(
            "创建上传会话: file={}, size={}, part_size={}, parts={}",
            metadata.file_name, metadata.file_size, metadata.part_size, metadata.total_parts
        );

        let response = self
            .request(Method::POST, "/uploads/initiate")
            .json(metadata)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = error_parts(response).await;
            if status.is_client_error() {
                return Err(UploadError::Validation(format!(
                    "协调服务拒绝创建会话: status={}, {}",
                    status, body
                )));
            }
            return Err(UploadError::server(status.as_u16(), body));
        }

        let body: InitiateResponse = parse_json(response).await?;
        info!(
            "上传会话已创建: session={}, bucket={}, key={}",
            body.session_id, body.bucket, body.key
        );

        Ok(UploadSession {
            session_id: body.session_id,
            upload_id: body.upload_id,
            storage_key: body.key,
            bucket: body.bucket,
            part_size: metadata.part_size,
            total_parts: metadata.total_parts,
        })
    }

    async fn presign_parts(
        &self,
        session: &UploadSession,
        part_numbers: &[u32],
    ) -> UploadResult<HashMap<u32, String>> {
        debug!(
            "请求预签名 URL: session={}, parts={:?}",
            session.session_id, part_numbers
        );

        let response = self
            .request(Method::POST, &Self::session_path(session, "/parts/presign"))
            .json(&PresignRequest { part_numbers })
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = error_parts(response).await;
            return Err(UploadError::server(status.as_u16(), body));
        }

        let body: PresignResponse = parse_json(response).await?;
        Ok(body
            .parts
            .into_iter()
            .map(|p| (p.part_number, p.url))
            .collect())
    }

    async fn complete(
        &self,
        session: &UploadSession,
        parts: &[PartResult],
    ) -> UploadResult<FinalizedObject> {
        info!(
            "合并上传分片: session={}, parts={}",
            session.session_id,
            parts.len()
        );

        let response = self
            .request(Method::POST, &Self::session_path(session, "/complete"))
            .json(&CompleteRequest { parts })
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = error_parts(response).await;
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                    UploadError::IncompleteUpload(format!("status={}, {}", status, body))
                }
                _ => UploadError::server(status.as_u16(), body),
            });
        }

        parse_json(response).await
    }

    async fn abort(&self, session: &UploadSession) -> UploadResult<()> {
        let response = self
            .request(Method::DELETE, &Self::session_path(session, ""))
            .send()
            .await
            .map_err(|e| UploadError::Abort(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            info!("上传会话已取消: session={}", session.session_id);
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            // 会话已被服务端清理
            warn!("取消会话时会话不存在: session={}", session.session_id);
            return Ok(());
        }

        let (status, body) = error_parts(response).await;
        Err(UploadError::Abort(format!("status={}, {}", status, body)))
    }
}
