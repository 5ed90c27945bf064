use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::stats::host_stats;
use super::types::{
    ActionKind, AppState, BackupRequest, ContainerAction, ErrorResponse, ForceQuery, Liveness,
    LogsQuery, LogsResponse, OperationResponse, ServiceUpdate, StatusResponse, SystemInfo,
};
use crate::lib::backup::{BackupArchive, BackupSelection};
use crate::lib::containers::{ContainerInfo, ServiceConfig};
use crate::lib::error::{OrchestratorError, Result};
use crate::lib::health::{HealthVerdict, OverallHealth};
use crate::lib::scheduler::TaskInfo;

type SharedState = State<Arc<AppState>>;

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::InvalidSchedule(_) | OrchestratorError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::OperationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/info", get(system_info))
        .route("/containers", get(list_containers))
        .route("/containers/{name}", get(get_container))
        .route("/containers/{name}/status", get(container_status))
        .route("/containers/{name}/logs", get(container_logs))
        .route("/containers/{name}/stats", get(container_stats))
        .route("/containers/{name}/action", post(container_action))
        .route(
            "/services/{name}",
            post(create_service).put(update_service).delete(remove_service),
        )
        .route("/health", get(overall_health))
        .route("/health/unhealthy", get(unhealthy_services))
        .route("/health/{name}", get(service_health))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(remove_task))
        .route("/tasks/{id}/enable", post(enable_task))
        .route("/tasks/{id}/disable", post(disable_task))
        .route("/backups", get(list_backups).post(create_backup))
        .route("/backups/{filename}", delete(delete_backup))
        .route("/backups/{filename}/restore", post(restore_backup));

    Router::new()
        .route("/health", get(liveness))
        .nest("/api/v1", api)
        .with_state(state)
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(
    state: Arc<AppState>,
    bind: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(address = %bind, "api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn liveness() -> Json<Liveness> {
    Json(Liveness {
        status: "healthy",
        timestamp: Utc::now(),
    })
}

async fn system_info(State(state): SharedState) -> Json<SystemInfo> {
    let host = host_stats(&mut *state.sysinfo.lock().await);
    Json(SystemInfo {
        name: state.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        uptime_secs: state.started.elapsed().as_secs(),
        managed_containers: state.manager.managed_count().await,
        scheduled_tasks: state.scheduler.get_tasks().await.len(),
        host,
    })
}

async fn list_containers(State(state): SharedState) -> Result<Json<Vec<ContainerInfo>>> {
    state.manager.list_containers().await.map(Json)
}

async fn get_container(
    State(state): SharedState,
    Path(name): Path<String>,
) -> Result<Json<ContainerInfo>> {
    state
        .manager
        .list_containers()
        .await?
        .into_iter()
        .find(|c| c.service == name)
        .map(Json)
        .ok_or_else(|| OrchestratorError::not_found(format!("service {name}")))
}

async fn container_status(
    State(state): SharedState,
    Path(name): Path<String>,
) -> Json<StatusResponse> {
    let status = state.manager.get_container_status(&name).await;
    Json(StatusResponse {
        service: name,
        status,
    })
}

async fn container_logs(
    State(state): SharedState,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>> {
    let logs = state
        .manager
        .get_container_logs(&name, query.tail)
        .await
        .ok_or_else(|| OrchestratorError::not_found(format!("logs for {name}")))?;
    Ok(Json(LogsResponse {
        service: name,
        logs,
    }))
}

async fn container_stats(
    State(state): SharedState,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state
        .manager
        .get_container_stats(&name)
        .await
        .map(Json)
        .ok_or_else(|| OrchestratorError::not_found(format!("stats for {name}")))
}

async fn container_action(
    State(state): SharedState,
    Path(name): Path<String>,
    Json(request): Json<ContainerAction>,
) -> Result<Json<OperationResponse>> {
    let manager = &state.manager;
    let timeout = request.timeout_or(manager.stop_timeout());
    let verb = match request.action {
        ActionKind::Start => {
            manager.start_container(&name).await?;
            "started"
        }
        ActionKind::Stop => {
            manager.stop_container(&name, timeout).await?;
            "stopped"
        }
        ActionKind::Restart => {
            manager.restart_container(&name, timeout).await?;
            "restarted"
        }
        ActionKind::Remove => {
            manager.remove_container(&name, request.force).await?;
            "removed"
        }
    };
    Ok(Json(OperationResponse::ok(format!("Container {name} {verb}"))))
}

async fn create_service(
    State(state): SharedState,
    Path(name): Path<String>,
    Json(config): Json<ServiceConfig>,
) -> Result<(StatusCode, Json<OperationResponse>)> {
    state.manager.pull_image(&config.image).await?;
    state.manager.create_container(&name, config).await?;
    Ok((
        StatusCode::CREATED,
        Json(OperationResponse::ok(format!("Service {name} created"))),
    ))
}

async fn update_service(
    State(state): SharedState,
    Path(name): Path<String>,
    Json(update): Json<ServiceUpdate>,
) -> Result<Json<OperationResponse>> {
    let stored = state.manager.service_config(&name).await;
    let mut config = match (stored, update.image.as_deref()) {
        (Some(config), _) => config,
        (None, Some(image)) => ServiceConfig::new(image),
        (None, None) => {
            return Err(OrchestratorError::InvalidConfig(format!(
                "service {name} has no stored configuration, an image is required"
            )));
        }
    };
    if let Some(image) = update.image {
        config.image = image;
    }
    if let Some(policy) = update.restart_policy {
        config.restart_policy = policy;
    }
    if let Some(environment) = update.environment {
        config.environment.extend(environment);
    }

    state.manager.update_container(&name, config).await?;
    Ok(Json(OperationResponse::ok(format!("Service {name} updated"))))
}

async fn remove_service(
    State(state): SharedState,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<OperationResponse>> {
    state.manager.remove_container(&name, query.force).await?;
    Ok(Json(OperationResponse::ok(format!("Service {name} removed"))))
}

async fn overall_health(State(state): SharedState) -> Json<OverallHealth> {
    Json(state.monitor.get_overall_health().await)
}

async fn unhealthy_services(State(state): SharedState) -> Json<Vec<HealthVerdict>> {
    Json(state.monitor.get_unhealthy_services().await)
}

async fn service_health(
    State(state): SharedState,
    Path(name): Path<String>,
) -> Result<Json<HealthVerdict>> {
    state
        .monitor
        .get_service_health(&name)
        .await
        .map(Json)
        .ok_or_else(|| OrchestratorError::not_found(format!("health for {name}")))
}

async fn list_tasks(State(state): SharedState) -> Json<Vec<TaskInfo>> {
    Json(state.scheduler.get_tasks().await)
}

async fn get_task(State(state): SharedState, Path(id): Path<String>) -> Result<Json<TaskInfo>> {
    state
        .scheduler
        .get_task(&id)
        .await
        .map(Json)
        .ok_or_else(|| OrchestratorError::not_found(format!("task {id}")))
}

async fn enable_task(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>> {
    state.scheduler.enable_task(&id).await?;
    Ok(Json(OperationResponse::ok(format!("Task {id} enabled"))))
}

async fn disable_task(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>> {
    state.scheduler.disable_task(&id).await?;
    Ok(Json(OperationResponse::ok(format!("Task {id} disabled"))))
}

async fn remove_task(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>> {
    state.scheduler.remove_task(&id).await?;
    Ok(Json(OperationResponse::ok(format!("Task {id} removed"))))
}

async fn list_backups(State(state): SharedState) -> Result<Json<Vec<BackupArchive>>> {
    state.backups.list_backups().await.map(Json)
}

/// The body is optional; an empty one requests a full backup.
async fn create_backup(
    State(state): SharedState,
    body: Bytes,
) -> Result<(StatusCode, Json<BackupArchive>)> {
    let request: BackupRequest = if body.is_empty() {
        BackupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| OrchestratorError::InvalidConfig(format!("malformed backup request: {e}")))?
    };

    let selection = BackupSelection::from_services(request.services);
    let archive = state.backups.create_backup(selection).await?;
    Ok((StatusCode::CREATED, Json(archive)))
}

async fn restore_backup(
    State(state): SharedState,
    Path(filename): Path<String>,
) -> Result<Json<OperationResponse>> {
    state.backups.restore_backup(&filename).await?;
    Ok(Json(OperationResponse::ok(format!("Backup {filename} restored"))))
}

async fn delete_backup(
    State(state): SharedState,
    Path(filename): Path<String>,
) -> Result<Json<OperationResponse>> {
    state.backups.delete_backup(&filename).await?;
    Ok(Json(OperationResponse::ok(format!("Backup {filename} deleted"))))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::lib::backup::{BackupCoordinator, BackupPaths};
    use crate::lib::containers::LifecycleManager;
    use crate::lib::containers::fake::FakeRuntime;
    use crate::lib::health::HealthMonitor;
    use crate::lib::scheduler::Scheduler;

    struct Harness {
        _dir: TempDir,
        app: Router,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let manager = Arc::new(LifecycleManager::new(
            runtime,
            "homie_network",
            Duration::from_secs(1),
        ));
        manager.initialize().await.unwrap();
        let monitor = Arc::new(HealthMonitor::new(manager.clone(), Duration::from_secs(30)));
        let scheduler = Arc::new(Scheduler::new());
        let backups = Arc::new(BackupCoordinator::new(
            BackupPaths {
                backup_dir: dir.path().join("backups"),
                config_dir: dir.path().join("config"),
                data_dir: dir.path().join("data"),
            },
            30,
        ));

        let state = AppState::new("test", manager, monitor, scheduler, backups);
        Harness {
            _dir: dir,
            app: router(Arc::new(state)),
        }
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn liveness_is_served_at_the_root() {
        let h = harness().await;
        let (status, body) = call(&h.app, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn service_lifecycle_over_http() {
        let h = harness().await;

        let (status, _) = call(
            &h.app,
            Method::POST,
            "/api/v1/services/web",
            Some(json!({ "image": "nginx:1.27", "ports": ["8080:80"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = call(&h.app, Method::GET, "/api/v1/containers/web/status", None).await;
        assert_eq!(body["status"], "created");

        let (status, _) = call(
            &h.app,
            Method::POST,
            "/api/v1/containers/web/action",
            Some(json!({ "action": "start" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&h.app, Method::GET, "/api/v1/containers/web", None).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["image"], "nginx:1.27");

        let (status, _) = call(
            &h.app,
            Method::PUT,
            "/api/v1/services/web",
            Some(json!({ "image": "nginx:1.28" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&h.app, Method::GET, "/api/v1/containers", None).await;
        assert_eq!(body[0]["image"], "nginx:1.28");

        let (status, _) = call(&h.app, Method::DELETE, "/api/v1/services/web?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&h.app, Method::GET, "/api/v1/containers/web/status", None).await;
        assert_eq!(body["status"], "unknown");
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let h = harness().await;
        let config = json!({ "image": "nginx" });
        call(&h.app, Method::POST, "/api/v1/services/web", Some(config.clone())).await;

        let (status, body) = call(&h.app, Method::POST, "/api/v1/services/web", Some(config)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &h.app,
            Method::POST,
            "/api/v1/services/db",
            Some(json!({ "image": "postgres", "memory_limit": "lots" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &h.app,
            Method::POST,
            "/api/v1/containers/ghost/action",
            Some(json!({ "action": "stop" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&h.app, Method::GET, "/api/v1/containers/ghost/logs", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.app, Method::GET, "/api/v1/tasks/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.app, Method::POST, "/api/v1/tasks/nope/enable", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.app, Method::GET, "/api/v1/health/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_info_report_the_fleet() {
        let h = harness().await;
        let (status, body) = call(&h.app, Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["summary"]["total"], 0);

        let (_, body) = call(&h.app, Method::GET, "/api/v1/health/unhealthy", None).await;
        assert_eq!(body, json!([]));

        let (status, body) = call(&h.app, Method::GET, "/api/v1/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "test");
        assert_eq!(body["managed_containers"], 0);
    }

    #[tokio::test]
    async fn backups_over_http() {
        let h = harness().await;

        let (status, body) = call(&h.app, Method::POST, "/api/v1/backups", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let filename = body["filename"].as_str().unwrap().to_string();

        let (_, body) = call(&h.app, Method::GET, "/api/v1/backups", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(
            &h.app,
            Method::POST,
            &format!("/api/v1/backups/{filename}/restore"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&h.app, Method::DELETE, "/api/v1/backups/not-a-backup", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.app, Method::DELETE, &format!("/api/v1/backups/{filename}"), None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
