//! HTTP surface: multipart upload in, server-sent batch snapshots out.
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | `GET`  | `/health` | none | `{"status":"ok"}` |
//! | `POST` | `/process-files` | multipart: `files` (repeated), `mode` (`s3`/`minio`), `bucket_name` | `text/event-stream` of [`BatchSnapshot`] JSON |
//!
//! The request is validated before anything is written to disk. Once the
//! stream starts the batch runs on its own task, so a client that disconnects
//! does not stop conversion or cleanup. Each request works in its own
//! [`BatchWorkspace`], so concurrent uploads of the same file name stay apart.

use crate::config::{PipelineConfig, StorageMode};
use crate::convert::ConversionDriver;
use crate::error::Doc2MdError;
use crate::output::BatchSnapshot;
use crate::pipeline::document::DocumentBackend;
use crate::pipeline::layout::LayoutExtractor;
use crate::progress::ChannelProgress;
use crate::storage::{normalize_bucket_name, StorageConnector, StorageError};
use crate::stream::{run_batch, BatchWorkspace, UploadedFile};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub extractor: Arc<dyn LayoutExtractor>,
    pub documents: Arc<dyn DocumentBackend>,
    /// Storage is chosen per request from `mode` and `bucket_name`.
    pub connector: Arc<dyn StorageConnector>,
}

/// Build the router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/process-files", post(process_files))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until the process stops.
pub async fn start_server(addr: &str, state: AppState) -> Result<(), std::io::Error> {
    info!("Starting doc2md server on {addr}");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

struct ProcessRequest {
    files: Vec<(String, Bytes)>,
    mode: StorageMode,
    bucket: String,
}

async fn read_request(mut multipart: Multipart) -> Result<ProcessRequest, ApiError> {
    let mut files = Vec::new();
    let mut mode = None;
    let mut bucket = None;

    while let Some(field) = multipart.next_field().await.map_err(ApiError::multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                let raw = field.file_name().unwrap_or_default().to_string();
                let filename = sanitize_filename(&raw)
                    .ok_or_else(|| ApiError::bad_request(format!("invalid file name '{raw}'")))?;
                let bytes = field.bytes().await.map_err(ApiError::multipart)?;
                files.push((filename, bytes));
            }
            "mode" => mode = Some(field.text().await.map_err(ApiError::multipart)?),
            "bucket_name" => bucket = Some(field.text().await.map_err(ApiError::multipart)?),
            other => debug!(field = other, "ignoring multipart field"),
        }
    }

    if files.is_empty() {
        return Err(ApiError::bad_request("no files uploaded"));
    }
    let mode = mode.ok_or_else(|| ApiError::bad_request("missing field 'mode'"))?;
    let mode = match mode.parse::<StorageMode>() {
        Ok(m @ (StorageMode::S3 | StorageMode::Minio)) => m,
        _ => return Err(ApiError::bad_request(format!("unsupported mode '{mode}'"))),
    };
    let bucket = bucket.ok_or_else(|| ApiError::bad_request("missing field 'bucket_name'"))?;
    let bucket = normalize_bucket_name(&bucket).map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(ProcessRequest {
        files,
        mode,
        bucket,
    })
}

async fn process_files(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let request = read_request(multipart).await?;
    let storage = state.connector.connect(request.mode, &request.bucket).await?;

    let workspace = BatchWorkspace::create(&state.config)?;
    let config = workspace.config();

    let mut uploads = Vec::with_capacity(request.files.len());
    for (filename, bytes) in request.files {
        let path = workspace.upload_dir().join(&filename);
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            ApiError::internal(format!("could not store upload '{filename}': {e}"))
        })?;
        uploads.push(UploadedFile::new(filename, path));
    }
    info!(
        files = uploads.len(),
        mode = %request.mode,
        bucket = %request.bucket,
        workspace = %workspace.upload_dir().display(),
        "accepted batch"
    );

    let driver = ConversionDriver::new(
        config,
        storage,
        Arc::clone(&state.extractor),
        Arc::clone(&state.documents),
    );
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<BatchSnapshot>();
    tokio::spawn(async move {
        let progress = ChannelProgress::new(tx);
        let done = run_batch(&driver, &uploads, &progress).await;
        // Remove the workspace before the stream closes.
        drop(workspace);
        drop(progress);
        debug!(files = done.files.len(), "batch stream closed");
    });

    let events = UnboundedReceiverStream::new(rx).map(|snapshot| Event::default().json_data(&snapshot));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Final path component of a client-supplied name, or `None` if nothing usable remains.
fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// JSON error response: `{"error": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn multipart(e: axum::extract::multipart::MultipartError) -> Self {
        Self {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl From<Doc2MdError> for ApiError {
    fn from(e: Doc2MdError) -> Self {
        match e {
            Doc2MdError::InvalidInput { .. }
            | Doc2MdError::InvalidConfig(_)
            | Doc2MdError::Storage(StorageError::InvalidBucket(_)) => Self::bad_request(e.to_string()),
            other => {
                error!("{other}");
                Self::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnitError;
    use crate::pipeline::document::PageSurface;
    use crate::storage::{LocalStorage, StorageBackend};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use image::DynamicImage;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const BOUNDARY: &str = "doc2md-test-boundary";

    struct EchoExtractor;

    #[async_trait]
    impl LayoutExtractor for EchoExtractor {
        async fn analyze(&self, _path: &Path) -> Result<String, UnitError> {
            Ok("# page\n".into())
        }
    }

    struct NoDocuments;

    impl DocumentBackend for NoDocuments {
        fn page_count(&self, _source: &Path) -> Result<usize, UnitError> {
            Err(UnitError::extraction("not a PDF"))
        }
        fn rewrite_page(
            &self,
            _source: &Path,
            _page_index: usize,
            _dest: &Path,
            _edit: &mut dyn FnMut(&mut dyn PageSurface),
        ) -> Result<(), UnitError> {
            Err(UnitError::extraction("not a PDF"))
        }
        fn render_first_page(&self, _source: &Path, _max: u32) -> Result<DynamicImage, UnitError> {
            Err(UnitError::extraction("not a PDF"))
        }
    }

    struct LocalConnector {
        root: PathBuf,
        calls: Mutex<Vec<(StorageMode, String)>>,
    }

    #[async_trait]
    impl StorageConnector for LocalConnector {
        async fn connect(
            &self,
            mode: StorageMode,
            bucket: &str,
        ) -> Result<Arc<dyn StorageBackend>, Doc2MdError> {
            self.calls.lock().unwrap().push((mode, bucket.to_string()));
            Ok(Arc::new(LocalStorage::new(self.root.join(bucket)).await?))
        }
    }

    fn app(dir: &Path) -> (Router, Arc<LocalConnector>, Arc<PipelineConfig>) {
        let config = PipelineConfig::builder().work_dir(dir.join("work")).build().unwrap();
        config.ensure_roots().unwrap();
        let config = Arc::new(config);
        let connector = Arc::new(LocalConnector {
            root: dir.join("store"),
            calls: Mutex::new(Vec::new()),
        });
        let state = AppState {
            config: Arc::clone(&config),
            extractor: Arc::new(EchoExtractor),
            documents: Arc::new(NoDocuments),
            connector: connector.clone(),
        };
        (build_router(state), connector, config)
    }

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a [u8]),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                            .as_bytes(),
                    );
                }
                Part::File(filename, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post(parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/process-files")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn snapshots(body: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(body)
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| serde_json::from_str(d.trim()).unwrap())
            .collect()
    }

    #[test]
    fn filenames_are_reduced_to_their_last_component() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\docs\\a.pdf").as_deref(), Some("a.pdf"));
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _, _) = app(dir.path());
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (router, connector, config) = app(dir.path());
        let response = router
            .oneshot(post(&[Part::File("a.txt", b"x"), Part::Text("bucket_name", "docs")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(connector.calls.lock().unwrap().is_empty());
        assert!(!config.upload_root.join("a.txt").exists());
    }

    #[tokio::test]
    async fn unknown_mode_and_bad_bucket_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _, _) = app(dir.path());

        let response = router
            .clone()
            .oneshot(post(&[
                Part::File("a.txt", b"x"),
                Part::Text("mode", "ftp"),
                Part::Text("bucket_name", "docs"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(post(&[
                Part::File("a.txt", b"x"),
                Part::Text("mode", "s3"),
                Part::Text("bucket_name", "a"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_streams_snapshots_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let (router, connector, config) = app(dir.path());

        let response = router
            .oneshot(post(&[
                Part::Text("mode", "minio"),
                Part::Text("bucket_name", "My_Docs"),
                Part::File("notes.txt", b"hello"),
                Part::File("blob.xyz", b"?"),
            ]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let snaps = snapshots(&body);
        assert_eq!(snaps[0]["files"][0]["status"], "queued");

        let last = snaps.last().unwrap();
        assert_eq!(last["status"], "done");
        assert_eq!(last["files"][0]["filename"], "notes.txt");
        assert_eq!(last["files"][0]["status"], "success");
        assert_eq!(last["files"][0]["urls"].as_array().unwrap().len(), 1);
        assert_eq!(last["files"][1]["status"], "error");

        assert_eq!(
            connector.calls.lock().unwrap().as_slice(),
            &[(StorageMode::Minio, "my-docs".to_string())]
        );
        for root in [&config.upload_root, &config.md_root, &config.scratch_root] {
            assert_eq!(std::fs::read_dir(root).unwrap().count(), 0, "{}", root.display());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_batches_with_the_same_filename_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _, config) = app(dir.path());

        let request = |bucket: &'static str, content: &'static [u8]| {
            post(&[
                Part::Text("mode", "s3"),
                Part::Text("bucket_name", bucket),
                Part::File("scan.txt", content),
            ])
        };
        let (a, b) = tokio::join!(
            router.clone().oneshot(request("bucket-a", b"USER A CONTENT")),
            router.oneshot(request("bucket-b", b"USER B CONTENT")),
        );
        let (a, b) = tokio::join!(
            to_bytes(a.unwrap().into_body(), usize::MAX),
            to_bytes(b.unwrap().into_body(), usize::MAX),
        );

        for (body, bucket, content) in [
            (a.unwrap(), "bucket-a", "USER A CONTENT"),
            (b.unwrap(), "bucket-b", "USER B CONTENT"),
        ] {
            let last = snapshots(&body).pop().unwrap();
            assert_eq!(last["files"][0]["status"], "success", "{last}");
            let part = dir.path().join("store").join(bucket).join("tmp_md/scan_part_1.md");
            assert!(std::fs::read_to_string(part).unwrap().contains(content));
        }
        assert_eq!(std::fs::read_dir(&config.upload_root).unwrap().count(), 0);
    }
}
