//! HTTP surface for submitting and observing transfers.
//!
//! Thin layer over the dispatcher and progress store: request shaping and
//! status codes live here, all behavior lives below. JSON uses camelCase
//! field names on both directions of the wire.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatcher::{CancelOutcome, DispatchError, JobDispatcher};
use crate::progress::{JobId, ProgressSnapshot, ProgressStore};
use crate::transfer::TransferRequest;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Accepts and cancels jobs.
    pub dispatcher: Arc<JobDispatcher>,

    /// Read path for status queries.
    pub progress: Arc<ProgressStore>,
}

/// Builds the application router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/download", post(start_download))
        .route("/progress", get(all_progress))
        .route("/progress/:download_id", get(one_progress))
        .route("/cancel/:download_id", delete(cancel_download))
        .with_state(state)
}

/// Binds the listener and serves the API until `shutdown` fires.
///
/// Graceful: in-flight HTTP requests finish before this returns. Job
/// draining is the dispatcher's concern, not the server's.
pub async fn serve(
    state: ApiState,
    bind_address: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(address = %bind_address, "http api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Body of `POST /download`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Source object key.
    pub source_key: String,

    /// Destination file name under the base directory.
    pub destination_name: String,

    /// Optional expected SHA-256 digest of the whole object.
    #[serde(default)]
    pub expected_sha256: Option<String>,
}

/// Body of a successful `POST /download`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAccepted {
    download_id: JobId,
    status: &'static str,
    message: &'static str,
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "error": message.into() }))
}

/// Rejects destination names that would escape the base directory.
fn validate_destination(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("destinationName must not be empty");
    }
    if name.starts_with('/') {
        return Err("destinationName must be relative");
    }
    if std::path::Path::new(name)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err("destinationName must not contain '..'");
    }
    Ok(())
}

async fn start_download(
    State(state): State<ApiState>,
    Json(body): Json<DownloadRequest>,
) -> Response {
    if body.source_key.is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("sourceKey must not be empty"))
            .into_response();
    }
    if let Err(reason) = validate_destination(&body.destination_name) {
        return (StatusCode::BAD_REQUEST, error_body(reason)).into_response();
    }

    let request = TransferRequest {
        source_key: body.source_key,
        destination_name: body.destination_name,
        expected_sha256: body.expected_sha256,
    };

    match state.dispatcher.submit(request) {
        Ok(download_id) => {
            info!(%download_id, "download accepted");
            (
                StatusCode::ACCEPTED,
                Json(DownloadAccepted {
                    download_id,
                    status: "STARTED",
                    message: "Download started successfully",
                }),
            )
                .into_response()
        }
        Err(DispatchError::QueueFull) => (
            StatusCode::TOO_MANY_REQUESTS,
            error_body("download queue is full, retry later"),
        )
            .into_response(),
        Err(DispatchError::Shutdown) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("service is shutting down"),
        )
            .into_response(),
    }
}

async fn one_progress(
    State(state): State<ApiState>,
    Path(download_id): Path<String>,
) -> Response {
    let id = JobId::from_string(download_id);
    match state.progress.get(&id) {
        Some(job) => Json(job.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, error_body("unknown download id")).into_response(),
    }
}

async fn all_progress(State(state): State<ApiState>) -> Json<HashMap<JobId, ProgressSnapshot>> {
    let snapshots = state
        .progress
        .list_all()
        .into_iter()
        .map(|(id, job)| {
            let snapshot = job.snapshot();
            (id, snapshot)
        })
        .collect();
    Json(snapshots)
}

async fn cancel_download(
    State(state): State<ApiState>,
    Path(download_id): Path<String>,
) -> Response {
    let id = JobId::from_string(download_id);
    match state.dispatcher.cancel(&id) {
        CancelOutcome::Requested => (
            StatusCode::OK,
            Json(json!({
                "downloadId": id,
                "message": "cancellation requested"
            })),
        )
            .into_response(),
        CancelOutcome::NotFound => {
            (StatusCode::NOT_FOUND, error_body("unknown download id")).into_response()
        }
        CancelOutcome::AlreadyTerminal => (
            StatusCode::CONFLICT,
            error_body("download already finished"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::dispatcher::DispatcherConfig;
    use crate::provider::test_support::MockObjectStore;
    use crate::transfer::{TransferOptions, TransferOrchestrator};

    fn test_state(dir: &tempfile::TempDir) -> ApiState {
        let progress = Arc::new(ProgressStore::new());
        let options =
            TransferOptions::new(dir.path().join("final"), dir.path().join("staging"));
        let orchestrator = Arc::new(TransferOrchestrator::new(
            Arc::new(MockObjectStore::new().with_object("datasets/huge.bin", vec![1u8; 256])),
            Arc::clone(&progress),
            options,
        ));
        let dispatcher = Arc::new(JobDispatcher::start(
            orchestrator,
            Arc::clone(&progress),
            DispatcherConfig::default(),
            CancellationToken::new(),
        ));
        ApiState {
            dispatcher,
            progress,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_post_download_returns_accepted_with_id() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::post("/download")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"sourceKey":"datasets/huge.bin","destinationName":"huge.bin"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "STARTED");

        let id = JobId::from_string(body["downloadId"].as_str().unwrap());
        assert!(state.progress.get(&id).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_post_download_rejects_bad_destination() {
        let dir = tempdir().unwrap();
        let app = router(test_state(&dir));

        let response = app
            .oneshot(
                Request::post("/download")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"sourceKey":"k","destinationName":"../../etc/passwd"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_progress_unknown_id_is_404() {
        let dir = tempdir().unwrap();
        let app = router(test_state(&dir));

        let response = app
            .oneshot(
                Request::get("/progress/no-such-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_progress_returns_snapshot_fields() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let id = JobId::new();
        state
            .progress
            .register(id.clone(), "datasets/huge.bin", "huge.bin", 1000);
        state.progress.update_bytes(&id, 250);

        let response = app
            .oneshot(
                Request::get(format!("/progress/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "DOWNLOADING");
        assert_eq!(body["totalSize"], 1000);
        assert_eq!(body["bytesTransferred"], 250);
        assert_eq!(body["progressPercent"], 25.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_unknown_id_is_404() {
        let dir = tempdir().unwrap();
        let app = router(test_state(&dir));

        let response = app
            .oneshot(
                Request::delete("/cancel/no-such-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_progress_lists_registered_jobs() {
        let dir = tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let id = JobId::new();
        state
            .progress
            .register(id.clone(), "datasets/huge.bin", "huge.bin", 10);

        let response = app
            .oneshot(Request::get("/progress").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body.get(id.as_str()).is_some());
    }
}
