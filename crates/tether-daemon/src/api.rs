//! REST control API
//!
//! Collaborator-facing operations: target listing and selection, log
//! mapping, snapshots, preview, pending queue, visibility and audit. Every
//! mutating route records an audit entry with the caller's IP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use tether_core::audit::{AuditAction, AuditLog};
use tether_core::correlate::LogCorrelator;
use tether_core::hub::RelayHub;
use tether_core::poll::PeriodicTask;
use tether_core::snapshot::{CaptureOutcome, CaptureTrigger, SnapshotService};
use tether_core::target::Target;
use tether_core::Error;

const DEFAULT_AUDIT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub correlator: Arc<LogCorrelator>,
    pub snapshots: Arc<SnapshotService>,
    pub audit: Arc<AuditLog>,
    pub health_poller: Arc<PeriodicTask>,
}

impl AppState {
    /// Pane a request addresses: the given one, else the resolved target
    async fn target_pane(&self, pane_id: Option<String>) -> Result<String, ApiError> {
        match pane_id {
            Some(id) => Ok(id),
            None => Ok(self.current_target().await?.pane_id),
        }
    }

    async fn current_target(&self) -> Result<Target, ApiError> {
        let hub = &self.hub;
        let (target, _) = hub.resolver().attach_target(hub.state()).await?;
        Ok(target)
    }
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::StaleTarget { .. } | Error::TargetMismatch { .. } | Error::EpochChanged { .. } => StatusCode::CONFLICT,
        Error::CapacityExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
        Error::SnapshotNotFound(_) | Error::NoLogCandidate(_) | Error::NoTarget(_) => StatusCode::NOT_FOUND,
        Error::PreviewActive(_) => StatusCode::LOCKED,
        Error::Multiplexer(_) | Error::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let mut body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        match &self.0 {
            Error::TargetMismatch { expected, received } => {
                body["expected"] = json!(expected);
                body["received"] = json!(received);
            }
            Error::StaleTarget { pane_id } => body["pane_id"] = json!(pane_id),
            Error::EpochChanged { captured, current } => {
                body["captured"] = json!(captured);
                body["current"] = json!(current);
            }
            Error::CapacityExhausted { capacity } => body["capacity"] = json!(capacity),
            Error::PreviewActive(id) => body["snapshot_id"] = json!(id),
            _ => {}
        }
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn actor(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/targets", get(list_targets))
        .route("/api/targets/active", get(active_target).delete(clear_target))
        .route("/api/targets/select", post(select_target))
        .route("/api/resolve", get(resolve))
        .route("/api/logs", get(list_logs))
        .route("/api/logs/mapping", get(log_mapping))
        .route("/api/logs/select", post(select_log))
        .route("/api/logs/unpin", post(unpin_log))
        .route("/api/snapshots", get(list_snapshots).post(capture_snapshot))
        .route("/api/snapshots/diff", get(diff_snapshots))
        .route("/api/snapshots/{id}", get(get_snapshot))
        .route("/api/snapshots/{id}/pin", post(pin_snapshot))
        .route("/api/snapshots/{id}/unpin", post(unpin_snapshot))
        .route("/api/snapshots/{id}/export", get(export_snapshot))
        .route("/api/snapshots/{id}/annotate", post(annotate_snapshot))
        .route("/api/preview", get(get_preview).delete(exit_preview))
        .route("/api/preview/{id}", post(enter_preview))
        .route("/api/queue", get(get_queue).put(put_queue))
        .route("/api/visibility", post(set_visibility))
        .route("/api/audit", get(list_audit))
        .with_state(state)
}

// ===== Health & targets =====

async fn health(State(state): State<AppState>) -> Json<Value> {
    let status = state.hub.status().await;
    Json(json!({
        "status": "ok",
        "hub": status,
        "preview": state.snapshots.preview().current(),
        "health_polling": state.health_poller.is_running(),
    }))
}

async fn list_targets(State(state): State<AppState>) -> ApiResult {
    let hub = &state.hub;
    let targets = hub.resolver().list_targets(hub.state()).await?;
    Ok(Json(json!({ "targets": targets, "epoch": hub.state().epoch() })))
}

async fn active_target(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.hub.state().snapshot()))
}

#[derive(Deserialize)]
struct SelectTargetBody {
    pane_id: String,
}

async fn select_target(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SelectTargetBody>,
) -> ApiResult {
    state.snapshots.preview().ensure_writable()?;
    let (target, epoch) = state.hub.select_target(&body.pane_id, &actor(&addr)).await?;
    Ok(Json(json!({ "target": target, "epoch": epoch })))
}

async fn clear_target(State(state): State<AppState>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> ApiResult {
    state.snapshots.preview().ensure_writable()?;
    let epoch = state.hub.clear_target(&actor(&addr)).await;
    Ok(Json(json!({ "cleared": epoch.is_some(), "epoch": state.hub.state().epoch() })))
}

async fn resolve(State(state): State<AppState>) -> ApiResult {
    let hub = &state.hub;
    let resolution = hub.resolver().resolve(hub.state()).await?;
    Ok(Json(json!(resolution)))
}

// ===== Logs =====

async fn list_logs(State(state): State<AppState>) -> ApiResult {
    let target = state.current_target().await?;
    let sessions = state.correlator.list_sessions(&target).await?;
    Ok(Json(json!({
        "pane_id": target.pane_id,
        "working_directory": target.working_directory,
        "sessions": sessions,
        "mapping": state.correlator.mapping(&target.pane_id),
    })))
}

async fn log_mapping(State(state): State<AppState>) -> ApiResult {
    let target = state.current_target().await?;
    let mapping = state.correlator.correlate(&target).await?;
    Ok(Json(json!({ "pane_id": target.pane_id, "mapping": mapping })))
}

#[derive(Deserialize)]
struct SelectLogBody {
    path: PathBuf,
    #[serde(default)]
    pane_id: Option<String>,
}

async fn select_log(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SelectLogBody>,
) -> ApiResult {
    let pane_id = state.target_pane(body.pane_id).await?;
    let mapping = state.correlator.select_manual(&pane_id, &body.path).await?;
    state.audit.record(
        actor(&addr),
        AuditAction::SelectLog,
        Some(&pane_id),
        mapping.log_path.display().to_string(),
    );
    Ok(Json(json!({ "pane_id": pane_id, "mapping": mapping })))
}

#[derive(Deserialize, Default)]
struct UnpinLogBody {
    #[serde(default)]
    pane_id: Option<String>,
}

async fn unpin_log(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<UnpinLogBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let pane_id = state.target_pane(body.pane_id).await?;
    let removed = state.correlator.unpin(&pane_id);
    state.audit.record(
        actor(&addr),
        AuditAction::UnpinLog,
        Some(&pane_id),
        removed
            .as_ref()
            .map(|m| m.log_path.display().to_string())
            .unwrap_or_default(),
    );
    Ok(Json(json!({ "pane_id": pane_id, "removed": removed })))
}

// ===== Snapshots =====

#[derive(Deserialize, Default)]
struct CaptureBody {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    pane_id: Option<String>,
}

async fn capture_snapshot(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<CaptureBody>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = state
        .snapshots
        .capture(CaptureTrigger::Manual, body.label, body.pane_id.as_deref())
        .await?;
    match &outcome {
        CaptureOutcome::Captured(snapshot) => {
            state.audit.record(
                actor(&addr),
                AuditAction::CaptureSnapshot,
                snapshot.pane_id.as_deref(),
                format!("id={}", snapshot.id),
            );
            Ok((StatusCode::CREATED, Json(json!(outcome))))
        }
        CaptureOutcome::Unchanged { .. } => Ok((StatusCode::OK, Json(json!(outcome)))),
    }
}

async fn list_snapshots(State(state): State<AppState>) -> Json<Value> {
    let (snapshots, capacity) = state.snapshots.with_buffer(|b| (b.list(), b.capacity()));
    Json(json!({ "snapshots": snapshots, "capacity": capacity }))
}

async fn get_snapshot(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    let snapshot = state.snapshots.with_buffer(|b| b.get(id).cloned())?;
    Ok(Json(json!(snapshot)))
}

async fn pin_snapshot(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> ApiResult {
    state.snapshots.with_buffer(|b| b.pin(id))?;
    state.audit.record(actor(&addr), AuditAction::PinSnapshot, None, format!("id={}", id));
    Ok(Json(json!({ "id": id, "pinned": true })))
}

async fn unpin_snapshot(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> ApiResult {
    state.snapshots.with_buffer(|b| b.unpin(id))?;
    state.audit.record(actor(&addr), AuditAction::UnpinSnapshot, None, format!("id={}", id));
    Ok(Json(json!({ "id": id, "pinned": false })))
}

async fn export_snapshot(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    Ok(Json(state.snapshots.with_buffer(|b| b.export(id))?))
}

#[derive(Deserialize)]
struct DiffQuery {
    from: u64,
    to: u64,
}

async fn diff_snapshots(State(state): State<AppState>, Query(q): Query<DiffQuery>) -> ApiResult {
    let diff = state.snapshots.with_buffer(|b| b.diff(q.from, q.to))?;
    Ok(Json(json!(diff)))
}

#[derive(Deserialize)]
struct AnnotateBody {
    text: String,
}

async fn annotate_snapshot(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Json(body): Json<AnnotateBody>,
) -> ApiResult {
    state.snapshots.with_buffer(|b| b.annotate(id, &body.text))?;
    state.audit.record(
        actor(&addr),
        AuditAction::AnnotateSnapshot,
        None,
        format!("id={} len={}", id, body.text.len()),
    );
    let annotation = state
        .snapshots
        .with_buffer(|b| b.get(id).map(|s| s.annotation.clone()))?;
    Ok(Json(json!({ "id": id, "annotation": annotation })))
}

// ===== Preview =====

async fn get_preview(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "preview": state.snapshots.preview().current() }))
}

async fn enter_preview(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> ApiResult {
    let preview = state.snapshots.enter_preview(id)?;
    let snapshot = state.snapshots.with_buffer(|b| b.get(id).cloned())?;
    state.audit.record(actor(&addr), AuditAction::EnterPreview, None, format!("id={}", id));
    Ok(Json(json!({ "preview": preview, "snapshot": snapshot })))
}

async fn exit_preview(State(state): State<AppState>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Json<Value> {
    let exited = state.snapshots.preview().exit();
    if let Some(id) = exited {
        state.audit.record(actor(&addr), AuditAction::ExitPreview, None, format!("id={}", id));
    }
    Json(json!({ "exited": exited }))
}

// ===== Queue, visibility, audit =====

async fn get_queue(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.snapshots.queue().snapshot()))
}

#[derive(Deserialize)]
struct QueueBody {
    pending: Vec<String>,
}

async fn put_queue(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<QueueBody>,
) -> Json<Value> {
    let count = body.pending.len();
    let queue = state.snapshots.queue().replace(body.pending);
    state
        .audit
        .record(actor(&addr), AuditAction::UpdateQueue, None, format!("{} pending", count));
    Json(json!(queue))
}

#[derive(Deserialize)]
struct VisibilityBody {
    visible: bool,
}

async fn set_visibility(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<VisibilityBody>,
) -> Json<Value> {
    state.health_poller.set_visible(body.visible);
    state.audit.record(
        actor(&addr),
        AuditAction::SetVisibility,
        None,
        format!("visible={}", body.visible),
    );
    info!(visible = body.visible, "Dashboard visibility changed");
    Json(json!({ "visible": body.visible, "health_polling": state.health_poller.is_running() }))
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

async fn list_audit(State(state): State<AppState>, Query(q): Query<AuditQuery>) -> Json<Value> {
    let entries = state.audit.recent(q.limit.unwrap_or(DEFAULT_AUDIT_LIMIT));
    Json(json!({ "entries": entries, "total": state.audit.len() }))
}
