//! REST front of the relational backend. This is what `RemoteBackend` talks to.

pub mod db;

use crate::error::BackendError;
use crate::model::{AppSettings, PriorityUpdate, Task, TaskPatch, UserSettings};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use db::TaskTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

// ── Shared state ───────────────────────────────────────────────

pub struct AppState {
    pub tasks: TaskTable,
}

pub type SharedState = Arc<AppState>;

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn reject(e: BackendError) -> (StatusCode, String) {
    let status = match &e {
        BackendError::NotFound(_) => StatusCode::NOT_FOUND,
        BackendError::Sql(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed");
    }
    (status, e.to_string())
}

// ── Router ─────────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task).delete(clear_tasks))
        .route("/api/tasks/priorities", put(update_priorities))
        .route("/api/tasks/import", post(import_tasks))
        .route("/api/tasks/:id", get(get_task).patch(update_task).delete(delete_task))
        .route("/api/settings/user", get(user_settings).put(set_user_settings))
        .route("/api/settings/app", get(app_settings).put(set_app_settings))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// ── Handlers ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok".to_string() })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: Option<Uuid>,
}

async fn list_tasks(State(state): State<SharedState>, Query(q): Query<ListQuery>) -> ApiResult<Json<Vec<Task>>> {
    state.tasks.list(q.user_id).map(Json).map_err(reject)
}

async fn get_task(State(state): State<SharedState>, Path(id): Path<Uuid>) -> ApiResult<Json<Task>> {
    match state.tasks.get(id).map_err(reject)? {
        Some(task) => Ok(Json(task)),
        None => Err((StatusCode::NOT_FOUND, format!("task {id} not found"))),
    }
}

async fn create_task(State(state): State<SharedState>, Json(task): Json<Task>) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.tasks.upsert(&task).map_err(reject)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<Json<Task>> {
    state.tasks.update(id, &patch).map(Json).map_err(reject)
}

async fn delete_task(State(state): State<SharedState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.tasks.delete(id).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_priorities(
    State(state): State<SharedState>,
    Json(items): Json<Vec<PriorityUpdate>>,
) -> ApiResult<StatusCode> {
    state.tasks.set_priorities(&items).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn import_tasks(State(state): State<SharedState>, Json(tasks): Json<Vec<Task>>) -> ApiResult<StatusCode> {
    state.tasks.import(&tasks).map_err(reject)?;
    tracing::info!(count = tasks.len(), "tasks imported");
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_tasks(State(state): State<SharedState>) -> ApiResult<StatusCode> {
    state.tasks.clear().map_err(reject)?;
    tracing::warn!("all tasks cleared");
    Ok(StatusCode::NO_CONTENT)
}

async fn user_settings(State(state): State<SharedState>) -> ApiResult<Json<UserSettings>> {
    state.tasks.user_settings().map(Json).map_err(reject)
}

async fn set_user_settings(State(state): State<SharedState>, Json(s): Json<UserSettings>) -> ApiResult<StatusCode> {
    state.tasks.set_user_settings(&s).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn app_settings(State(state): State<SharedState>) -> ApiResult<Json<AppSettings>> {
    state.tasks.app_settings().map(Json).map_err(reject)
}

async fn set_app_settings(State(state): State<SharedState>, Json(s): Json<AppSettings>) -> ApiResult<StatusCode> {
    state.tasks.set_app_settings(&s).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Bind `addr` and serve until the future is dropped. Returns the bound
/// address (useful with port 0) and the serving future.
pub async fn bind(
    addr: &str,
    state: SharedState,
) -> std::io::Result<(std::net::SocketAddr, impl std::future::Future<Output = std::io::Result<()>>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = router(state);
    Ok((local, async move { axum::serve(listener, app).await }))
}
