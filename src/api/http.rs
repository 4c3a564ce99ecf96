//! HTTP API Server
//!
//! Status queries and operator actions for the local daemon.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::check::{self, CheckResult, CheckStatus, CheckThresholds, EventSummary, OutputFormat};
use crate::config::ApiConfig;
use crate::coordination::Coordination;
use crate::error::{Error, Result};
use crate::events::{EventRecord, EventRecorder, EventType};
use crate::lifecycle::{DaemonStatus, Lifecycle};
use crate::monitor::HealthMonitor;
use crate::notifier::{FailoverNotifier, NotifyReport};
use crate::registry::{Node, NodeId, NodeRegistry, NodeType};
use crate::replication::{ReplicationSource, ReplicationStatus};
use crate::state::{CoordinationSnapshot, FollowTarget, SharedState};

/// Shared application state
pub struct AppState {
    pub state: Arc<SharedState>,
    pub monitor: Arc<HealthMonitor>,
    pub lifecycle: Arc<Lifecycle>,
    pub registry: Arc<dyn NodeRegistry>,
    pub replication: Arc<dyn ReplicationSource>,
    pub notifier: Arc<FailoverNotifier>,
    pub events: Arc<EventRecorder>,
    pub thresholds: CheckThresholds,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster", get(handle_cluster))
            .route("/events", get(handle_events))
            .route("/check", get(handle_check))
            // Operator actions
            .route("/pause", post(handle_pause))
            .route("/unpause", post(handle_unpause))
            .route("/admin/rerun-election", post(handle_rerun))
            .route("/admin/follow/:node_id", post(handle_follow))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until `shutdown` turns true
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Self::router(Arc::clone(&self.state));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub paused: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: Node,
    pub coordination: CoordinationSnapshot,
    pub replication: Option<ReplicationStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub primary: Option<NodeId>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub format: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(e: Error) -> Response {
    tracing::warn!("API request failed: {}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e)
}

// ============ Handlers ============

async fn handle_health(State(app): State<Arc<AppState>>) -> Response {
    let node = app.monitor.node().await;
    let daemon: DaemonStatus = match app.lifecycle.status().await {
        Ok(status) => status,
        Err(e) => return internal_error(e),
    };

    let response = HealthResponse {
        healthy: daemon.running,
        node_id: node.id,
        node_type: node.node_type,
        paused: daemon.paused,
    };
    let status = if response.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response)).into_response()
}

async fn local_status(app: &AppState) -> Result<StatusResponse> {
    let node = app.monitor.node().await;
    let coordination = app.state.snapshot().await?;

    let replication = match app.replication.replication_status(&node).await {
        Ok(status) => Some(status.with_coordination(&coordination)),
        Err(e) => {
            tracing::debug!("live replication status unavailable: {}", e);
            app.monitor.last_status().await
        }
    };

    Ok(StatusResponse {
        node,
        coordination,
        replication,
    })
}

async fn handle_status(State(app): State<Arc<AppState>>) -> Response {
    match local_status(&app).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_cluster(State(app): State<Arc<AppState>>) -> Response {
    let nodes = match app.registry.get_all_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, "REGISTRY", e),
    };
    let primary = nodes
        .iter()
        .find(|n| n.active && n.node_type == NodeType::Primary)
        .map(|n| n.id);

    Json(ClusterResponse { primary, nodes }).into_response()
}

async fn handle_events(
    State(app): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<EventRecord>> {
    Json(app.events.recent(query.limit.unwrap_or(50)).await)
}

async fn handle_check(
    State(app): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Response {
    let status = match local_status(&app).await {
        Ok(status) => status,
        Err(e) => return internal_error(e),
    };
    let summary = EventSummary {
        split_brain: app.events.has_recent(EventType::SplitBrain).await,
        failovers: app.events.count(EventType::FailoverPromote).await,
    };
    let checks = check::run_checks(
        &status.node,
        status.replication.as_ref(),
        &status.coordination,
        summary,
        app.thresholds,
    );

    match query.format {
        None => Json(CheckResponse {
            status: check::overall(&checks),
            checks,
        })
        .into_response(),
        Some(format) => match format.parse::<OutputFormat>() {
            Ok(format) => format.render(&status.node, &checks).into_response(),
            Err(e) => error_response(StatusCode::BAD_REQUEST, "BAD_FORMAT", e),
        },
    }
}

async fn handle_pause(State(app): State<Arc<AppState>>) -> Response {
    match app.lifecycle.pause().await {
        Ok(changed) => Json(ActionResponse {
            success: true,
            message: if changed { "failover paused" } else { "already paused" }.to_string(),
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_unpause(State(app): State<Arc<AppState>>) -> Response {
    match app.lifecycle.unpause().await {
        Ok(changed) => Json(ActionResponse {
            success: true,
            message: if changed { "failover resumed" } else { "not paused" }.to_string(),
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_rerun(State(app): State<Arc<AppState>>) -> Response {
    let report: NotifyReport = match app.notifier.notify_all(FollowTarget::Rerun, &[]).await {
        Ok(report) => report,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, "REGISTRY", e),
    };

    Json(ActionResponse {
        success: report.failed.is_empty(),
        message: format!(
            "rerun delivered to {:?}, not delivered to {:?}",
            report.delivered, report.failed
        ),
    })
    .into_response()
}

async fn handle_follow(
    State(app): State<Arc<AppState>>,
    Path(node_id): Path<NodeId>,
) -> Response {
    let local = app.monitor.node().await;
    if node_id == local.id {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_UPSTREAM", Error::InvalidUpstream(node_id));
    }

    match app.registry.get_node(node_id).await {
        Ok(Some(target)) if target.active && target.node_type == NodeType::Primary => {}
        Ok(Some(_)) => {
            return error_response(
                StatusCode::CONFLICT,
                "NOT_PRIMARY",
                format!("node {} is not an active primary", node_id),
            )
        }
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", Error::NodeNotFound(node_id)),
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, "REGISTRY", e),
    }

    if let Err(e) = app.state.notify_follow_primary(FollowTarget::Node(node_id)).await {
        return internal_error(e);
    }
    Json(ActionResponse {
        success: true,
        message: format!("node {} will follow node {} on the next monitoring cycle", local.id, node_id),
    })
    .into_response()
}
