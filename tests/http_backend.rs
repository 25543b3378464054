// 使用真实 HTTP 客户端对接本地模拟后端的端到端测试
//
// 模拟后端同时扮演协调服务和对象存储：
// - POST   /uploads/initiate
// - POST   /uploads/:id/parts/presign
// - POST   /uploads/:id/complete
// - DELETE /uploads/:id
// - PUT    /storage/:part   （预签名 URL 指向这里）

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, post, put},
    Json, Router,
};
use course_upload::config::CoordinatorConfig;
use course_upload::uploader::{
    ByteProgress, HttpCoordinatorClient, HttpPartTransporter, PartDescriptor, PartTransporter,
    ProgressCallback, RetryPolicy, UploadError, UploadLimits, UploadOptions, UploadOrchestrator,
    UploadProgress, UploadRequest, UploadState,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const MB: usize = 1024 * 1024;

#[derive(Default)]
struct Backend {
    base_url: String,
    /// 首次 PUT 返回 500 的分片
    fail_once: HashSet<u32>,
    /// 首次 PUT 挂起这么久才响应的分片
    stall_once: HashMap<u32, Duration>,
    omit_etag: bool,
    reject_initiate: bool,
    reject_complete: bool,

    initiate_body: Option<Value>,
    auth_header: Option<String>,
    put_attempts: HashMap<u32, u32>,
    stored: BTreeMap<u32, Vec<u8>>,
    completed: Option<Vec<(u32, String)>>,
    abort_calls: u32,
}

type Shared = Arc<Mutex<Backend>>;

fn etag_for(part: u32, len: usize) -> String {
    format!("etag-{}-{}", part, len)
}

async fn initiate(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let mut backend = state.lock();
    backend.auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if backend.reject_initiate {
        return (StatusCode::BAD_REQUEST, "unsupported mime type").into_response();
    }

    let key = format!("videos/{}", body["fileName"].as_str().unwrap_or("unknown"));
    backend.initiate_body = Some(body);

    Json(json!({
        "sessionId": "sess-1",
        "uploadId": "up-1",
        "key": key,
        "bucket": "course-media",
    }))
    .into_response()
}

async fn presign(
    State(state): State<Shared>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    assert_eq!(session_id, "sess-1");
    let backend = state.lock();
    let parts: Vec<Value> = body["partNumbers"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|n| {
            json!({
                "partNumber": n,
                "url": format!("{}/storage/{}", backend.base_url, n),
            })
        })
        .collect();
    Json(json!({ "parts": parts })).into_response()
}

async fn store_part(State(state): State<Shared>, Path(part): Path<u32>, body: Bytes) -> Response {
    let stall = {
        let mut backend = state.lock();
        let a = backend.put_attempts.entry(part).or_insert(0);
        *a += 1;
        let first = *a == 1;
        backend.stall_once.get(&part).copied().filter(|_| first)
    };
    if let Some(stall) = stall {
        tokio::time::sleep(stall).await;
    }

    let mut backend = state.lock();
    let attempts = backend.put_attempts[&part];

    if backend.fail_once.contains(&part) && attempts == 1 {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage hiccup").into_response();
    }

    let etag = etag_for(part, body.len());
    backend.stored.insert(part, body.to_vec());

    if backend.omit_etag {
        return StatusCode::OK.into_response();
    }
    (StatusCode::OK, [(header::ETAG, format!("\"{}\"", etag))]).into_response()
}

async fn complete(
    State(state): State<Shared>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut backend = state.lock();
    let parts: Vec<(u32, String)> = body["parts"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|p| {
            (
                p["partNumber"].as_u64().unwrap_or(0) as u32,
                p["eTag"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    backend.completed = Some(parts.clone());

    if backend.reject_complete {
        return (StatusCode::CONFLICT, "part list does not match").into_response();
    }

    for (n, etag) in &parts {
        let Some(data) = backend.stored.get(n) else {
            return (StatusCode::CONFLICT, format!("part {} missing", n)).into_response();
        };
        if *etag != etag_for(*n, data.len()) {
            return (StatusCode::CONFLICT, format!("part {} etag mismatch", n)).into_response();
        }
    }

    let size: usize = backend.stored.values().map(Vec::len).sum();
    Json(json!({
        "key": "videos/lesson.mp4",
        "location": format!("https://cdn.test/{}/lesson.mp4", session_id),
        "size": size,
        "videoId": "vid-1",
    }))
    .into_response()
}

async fn abort(State(state): State<Shared>, Path(_session_id): Path<String>) -> StatusCode {
    state.lock().abort_calls += 1;
    StatusCode::NO_CONTENT
}

async fn spawn_backend(configure: impl FnOnce(&mut Backend)) -> Shared {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut backend = Backend {
        base_url: format!("http://{}", addr),
        ..Default::default()
    };
    configure(&mut backend);
    let state: Shared = Arc::new(Mutex::new(backend));

    let app = Router::new()
        .route("/uploads/initiate", post(initiate))
        .route("/uploads/:id/parts/presign", post(presign))
        .route("/uploads/:id/complete", post(complete))
        .route("/uploads/:id", delete(abort))
        .route("/storage/:part", put(store_part))
        .layer(DefaultBodyLimit::disable())
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    state
}

fn orchestrator_for(state: &Shared) -> UploadOrchestrator {
    orchestrator_with_timeout(state, Duration::from_secs(10))
}

fn orchestrator_with_timeout(state: &Shared, part_timeout: Duration) -> UploadOrchestrator {
    let config = CoordinatorConfig {
        base_url: format!("{}/", state.lock().base_url),
        auth_token: Some("test-token".to_string()),
        request_timeout_secs: 10,
    };
    let coordinator = Arc::new(HttpCoordinatorClient::new(&config).unwrap());
    let transporter = Arc::new(HttpPartTransporter::new(part_timeout).unwrap());
    let options = UploadOptions {
        max_concurrency: 3,
        retry: RetryPolicy::new(3, Duration::from_millis(10), 2),
        limits: UploadLimits::default(),
    };
    UploadOrchestrator::new(coordinator, transporter, options)
}

/// 11MB 视频文件，按 5MB 分为 3 片（5 + 5 + 1）
fn sample_video(dir: &tempfile::TempDir) -> (std::path::PathBuf, Vec<u8>) {
    sized_video(dir, 11 * MB)
}

fn sized_video(dir: &tempfile::TempDir, size: usize) -> (std::path::PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let path = dir.path().join("lesson.mp4");
    std::fs::write(&path, &content).unwrap();
    (path, content)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uploads_all_parts_and_completes_in_order() {
    let state = spawn_backend(|b| {
        b.fail_once.insert(2);
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (path, content) = sample_video(&dir);

    let request = UploadRequest::from_file(&path, "第三讲：所有权")
        .await
        .unwrap()
        .with_duration(640.0)
        .with_field("lectureId", "lec-3");

    let orchestrator = orchestrator_for(&state);
    let done = orchestrator.upload(request, None).await.unwrap();

    assert_eq!(done.task.status, UploadState::Completed);
    assert_eq!(done.parts.len(), 3);
    assert_eq!(done.object.size, Some(11 * MB as u64));
    assert_eq!(done.object.extra["videoId"], "vid-1");

    let backend = state.lock();
    assert_eq!(backend.auth_header.as_deref(), Some("Bearer test-token"));

    let metadata = backend.initiate_body.as_ref().unwrap();
    assert_eq!(metadata["mimeType"], "video/mp4");
    assert_eq!(metadata["totalParts"], 3);
    assert_eq!(metadata["partSize"], 5 * MB as u64);
    assert_eq!(metadata["lectureId"], "lec-3");

    // 分片 2 第一次失败后重试成功
    assert_eq!(backend.put_attempts[&2], 2);
    assert_eq!(backend.put_attempts[&1], 1);

    let completed = backend.completed.as_ref().unwrap();
    let numbers: Vec<u32> = completed.iter().map(|(n, _)| *n).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(completed[2].1, etag_for(3, MB));

    let reassembled: Vec<u8> = backend.stored.values().flatten().copied().collect();
    assert_eq!(reassembled, content);
    assert_eq!(backend.abort_calls, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_etag_aborts_session() {
    let state = spawn_backend(|b| b.omit_etag = true).await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = sample_video(&dir);

    let request = UploadRequest::from_file(&path, "无 ETag").await.unwrap();
    let err = orchestrator_for(&state).upload(request, None).await.unwrap_err();

    assert!(matches!(err, UploadError::MissingToken { .. }));
    let backend = state.lock();
    assert_eq!(backend.abort_calls, 1);
    assert!(backend.completed.is_none());
    // 缺少 ETag 不重试
    assert!(backend.put_attempts.values().all(|&n| n == 1));
}

#[tokio::test]
async fn initiate_rejection_is_validation_error() {
    let state = spawn_backend(|b| b.reject_initiate = true).await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = sample_video(&dir);

    let request = UploadRequest::from_file(&path, "被拒绝").await.unwrap();
    let err = orchestrator_for(&state).upload(request, None).await.unwrap_err();

    assert!(matches!(err, UploadError::Validation(_)));
    let backend = state.lock();
    assert_eq!(backend.abort_calls, 0);
    assert!(backend.put_attempts.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_conflict_aborts_session() {
    let state = spawn_backend(|b| b.reject_complete = true).await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = sample_video(&dir);

    let request = UploadRequest::from_file(&path, "合并冲突").await.unwrap();
    let orchestrator = orchestrator_for(&state);
    let err = orchestrator.upload(request, None).await.unwrap_err();

    assert!(matches!(err, UploadError::IncompleteUpload(_)));
    assert_eq!(state.lock().abort_calls, 1);
    assert_eq!(orchestrator.task_snapshot().unwrap().status, UploadState::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reports_byte_level_progress() {
    let state = spawn_backend(|_| {}).await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = sample_video(&dir);

    let seen: Arc<Mutex<Vec<UploadProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressCallback = Arc::new(move |p: &UploadProgress| {
        sink.lock().push(p.clone());
    });

    let request = UploadRequest::from_file(&path, "进度").await.unwrap();
    orchestrator_for(&state)
        .upload(request, Some(callback))
        .await
        .unwrap();

    let seen = seen.lock();
    // 11MB / 256KB = 44 个请求体分块，每块至少上报一次
    assert!(seen.len() >= 44, "reports={}", seen.len());
    assert!(seen.windows(2).all(|w| w[0].loaded_bytes <= w[1].loaded_bytes));
    assert!(seen.iter().any(|p| p.percentage > 0 && p.percentage < 100));

    let last = seen.last().unwrap();
    assert_eq!(last.percentage, 100);
    assert_eq!(last.loaded_bytes, 11 * MB as u64);
    assert_eq!(last.total_chunks, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_part_times_out_as_network_error() {
    let state = spawn_backend(|b| {
        b.stall_once.insert(1, Duration::from_secs(5));
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (path, content) = sized_video(&dir, 64 * 1024);

    let transporter = HttpPartTransporter::new(Duration::from_millis(500)).unwrap();
    let url = format!("{}/storage/1", state.lock().base_url);
    let part = PartDescriptor::new(1, 0..content.len() as u64);
    let no_progress: ByteProgress = Arc::new(|_| {});

    let err = transporter
        .transport(&url, &path, &part, no_progress.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Network(_)), "err={:?}", err);
    assert!(err.is_retryable());

    let token = transporter
        .transport(&url, &path, &part, no_progress)
        .await
        .unwrap();
    assert_eq!(token, etag_for(1, content.len()));
    assert_eq!(state.lock().put_attempts[&1], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_part_is_retried_by_orchestrator() {
    let state = spawn_backend(|b| {
        b.stall_once.insert(1, Duration::from_secs(5));
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (path, content) = sized_video(&dir, 64 * 1024);

    let request = UploadRequest::from_file(&path, "超时重试").await.unwrap();
    let done = orchestrator_with_timeout(&state, Duration::from_millis(500))
        .upload(request, None)
        .await
        .unwrap();

    assert_eq!(done.task.status, UploadState::Completed);
    let backend = state.lock();
    assert_eq!(backend.put_attempts[&1], 2);
    assert_eq!(backend.stored[&1], content);
    assert_eq!(backend.abort_calls, 0);
}
