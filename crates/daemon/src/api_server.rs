//! HTTP control API for relaycast
//!
//! Exposes task, relay, settings and capability operations as JSON
//! endpoints for the display layer and scripts.

use crate::capabilities::FfmpegCapabilities;
use crate::command::SynthesisError;
use crate::daemon::{Daemon, DaemonError};
use crate::relay::{RelayError, RtspServerStatus};
use crate::store::StoreError;
use crate::supervisor::SupervisorError;
use crate::task::{NewTask, StreamTask, TaskPatch};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use relaycast_config::{AppSettings, HwAccelPolicy, SettingsPatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Error returned by a handler, rendered as `{ "error": "..." }`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("task '{0}' not found")]
    NotFound(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Supervisor(err) => match err {
                SupervisorError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                SupervisorError::TaskBusy(_) => StatusCode::CONFLICT,
                SupervisorError::InputUnreadable { .. } => StatusCode::BAD_REQUEST,
                SupervisorError::Synthesis(SynthesisError::InvalidTask(_)) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                SupervisorError::Synthesis(SynthesisError::EncoderUnavailable { .. }) => {
                    StatusCode::CONFLICT
                }
                SupervisorError::Store(err) => store_status(err),
                SupervisorError::BinaryNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Daemon(DaemonError::Store(err)) => store_status(err),
            ApiError::Daemon(_) | ApiError::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::PathTaken(_) => StatusCode::CONFLICT,
        StoreError::InvalidInput(_) | StoreError::InvalidSettings(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        StoreError::Io(_) | StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn list_tasks(State(daemon): State<Arc<Daemon>>) -> Json<Vec<StreamTask>> {
    Json(daemon.supervisor().list().await)
}

async fn create_task(
    State(daemon): State<Arc<Daemon>>,
    Json(payload): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<StreamTask>)> {
    let task = daemon.supervisor().create(payload).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<Json<StreamTask>> {
    Ok(Json(daemon.supervisor().update(&id, patch).await?))
}

async fn remove_task(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if daemon.supervisor().remove(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(id))
    }
}

async fn start_task(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamTask>> {
    Ok(Json(daemon.supervisor().start(&id).await?))
}

async fn stop_task(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamTask>> {
    Ok(Json(daemon.supervisor().stop(&id).await?))
}

async fn server_status(State(daemon): State<Arc<Daemon>>) -> Json<RtspServerStatus> {
    Json(daemon.relay().status().await)
}

async fn restart_server(State(daemon): State<Arc<Daemon>>) -> ApiResult<Json<RtspServerStatus>> {
    Ok(Json(daemon.restart_relay().await?))
}

/// Settings as returned to clients; the password is never echoed back
#[derive(Debug, Serialize)]
struct SettingsView {
    host: String,
    port: u16,
    auth_enabled: bool,
    username: String,
    password_set: bool,
    default_hw_accel: HwAccelPolicy,
}

impl From<AppSettings> for SettingsView {
    fn from(settings: AppSettings) -> Self {
        Self {
            password_set: !settings.password.is_empty(),
            host: settings.host,
            port: settings.port,
            auth_enabled: settings.auth_enabled,
            username: settings.username,
            default_hw_accel: settings.default_hw_accel,
        }
    }
}

async fn get_settings(State(daemon): State<Arc<Daemon>>) -> Json<SettingsView> {
    Json(daemon.store().settings().await.into())
}

async fn put_settings(
    State(daemon): State<Arc<Daemon>>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<SettingsView>> {
    Ok(Json(daemon.update_settings(&patch).await?.into()))
}

#[derive(Debug, Deserialize)]
struct CapabilitiesQuery {
    #[serde(default)]
    force: bool,
}

async fn capabilities(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<CapabilitiesQuery>,
) -> Json<FfmpegCapabilities> {
    let snapshot = daemon.detector().scan(query.force).await;
    Json(FfmpegCapabilities::clone(&snapshot))
}

/// Creates the axum Router with all control endpoints
pub fn create_api_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", patch(update_task).delete(remove_task))
        .route("/tasks/:id/start", post(start_task))
        .route("/tasks/:id/stop", post(stop_task))
        .route("/server", get(server_status))
        .route("/server/restart", post(restart_server))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/capabilities", get(capabilities))
        .with_state(daemon)
}

/// Serve the control API on `addr` until the listener fails
pub async fn run_api_server(daemon: Arc<Daemon>, addr: &str) -> Result<(), ServerError> {
    let app = create_api_router(daemon);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "control API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relaycast_config::{DaemonConfig, PathsConfig};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_daemon(dir: &TempDir) -> Arc<Daemon> {
        let config = DaemonConfig {
            paths: PathsConfig {
                data_dir: dir.path().join("data"),
                runtime_dir: dir.path().join("run"),
                bin_dir: dir.path().join("bin"),
                ffmpeg: None,
                relay: None,
            },
            ..DaemonConfig::default()
        };
        Arc::new(Daemon::new(config).await.unwrap())
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_task_crud() {
        let dir = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&dir).await);

        let (status, body) = send(&app, "GET", "/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let payload = json!({ "name": "Lobby", "input": "/media/lobby.mp4", "path": "Demo Room" });
        let (status, task) = send(&app, "POST", "/tasks", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["path"], "demo-room");
        assert_eq!(task["status"], "created");
        let id = task["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "POST", "/tasks", Some(payload)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("demo-room"));

        let (status, task) = send(
            &app,
            "PATCH",
            &format!("/tasks/{}", id),
            Some(json!({ "loop": true, "bitrate_kbps": 2500 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["loop"], true);
        assert_eq!(task["bitrate_kbps"], 2500);

        let (status, _) = send(&app, "PATCH", "/tasks/missing", Some(json!({ "name": "x" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_task_payload() {
        let dir = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&dir).await);

        let (status, body) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({ "name": "x", "input": "/media/a.mp4", "path": "///" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_start_and_stop_without_binary() {
        let dir = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&dir).await);

        let payload = json!({ "name": "cam", "input": "/media/cam.mp4", "path": "cam" });
        let (_, task) = send(&app, "POST", "/tasks", Some(payload)).await;
        let id = task["id"].as_str().unwrap();

        let (status, body) = send(&app, "POST", &format!("/tasks/{}/start", id), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let (status, task) = send(&app, "POST", &format!("/tasks/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "stopped");

        let (status, _) = send(&app, "POST", "/tasks/missing/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_settings_endpoints() {
        let dir = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&dir).await);

        let (status, settings) = send(&app, "GET", "/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settings["port"], 8554);

        let (status, _) = send(&app, "PUT", "/settings", Some(json!({ "port": 0 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&app, "PUT", "/settings", Some(json!({ "auth_enabled": true }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, settings) = send(
            &app,
            "PUT",
            "/settings",
            Some(json!({ "port": 9554, "default_hw_accel": "cpu" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settings["port"], 9554);
        assert_eq!(settings["default_hw_accel"], "cpu");
        assert_eq!(settings["password_set"], false);
    }

    #[tokio::test]
    async fn test_settings_never_echo_password() {
        let dir = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&dir).await);

        let (status, settings) = send(
            &app,
            "PUT",
            "/settings",
            Some(json!({ "auth_enabled": true, "username": "publisher", "password": "s3cret" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settings["password_set"], true);
        assert!(settings.get("password").is_none());

        let (_, settings) = send(&app, "GET", "/settings", None).await;
        assert_eq!(settings["username"], "publisher");
        assert!(!settings.to_string().contains("s3cret"));
    }

    #[tokio::test]
    async fn test_server_and_capabilities() {
        let dir = TempDir::new().unwrap();
        let app = create_api_router(test_daemon(&dir).await);

        let (status, server) = send(&app, "GET", "/server", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(server["state"], "stopped");

        let (status, _) = send(&app, "POST", "/server/restart", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (_, server) = send(&app, "GET", "/server", None).await;
        assert_eq!(server["state"], "error");

        let (status, caps) = send(&app, "GET", "/capabilities?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(caps["available"], false);
        assert!(caps["error"].is_string());
    }
}
