//! Axum routes for Raft protocol RPCs.
//!
//! These endpoints form the RPC plane between peers and are served on the
//! node's RPC address, separate from the client API listener. Cluster
//! membership changes do not live here; they flow through the client-plane
//! `/members` join protocol.

use crate::cluster::types::{NodeId, Raft, TypeConfig};
use crate::config;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use std::sync::Arc;

/// Shared state for Raft RPC handlers.
#[derive(Clone)]
pub struct RaftState {
    /// The openraft `Raft` instance for this node.
    pub raft: Arc<Raft>,
}

/// Builds the Axum router for the Raft RPC plane.
///
/// Routes:
/// - `POST /raft/vote` — leader election vote RPC
/// - `POST /raft/append` — log replication append entries RPC
/// - `POST /raft/snapshot` — snapshot installation RPC
pub fn raft_router(state: RaftState) -> Router {
    Router::new()
        .route("/raft/vote", post(handle_vote))
        .route("/raft/append", post(handle_append))
        .route("/raft/snapshot", post(handle_snapshot))
        // JSON-encoded snapshot chunks are several times their raw size;
        // axum's default limit would reject them.
        .layer(DefaultBodyLimit::max(config::MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

/// Error wrapper for Raft RPC handlers: JSON body with 500 status.
struct RaftApiError(String);

impl IntoResponse for RaftApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": self.0})),
        )
            .into_response()
    }
}

async fn handle_vote(
    State(state): State<RaftState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Result<Json<VoteResponse<NodeId>>, RaftApiError> {
    let resp = state
        .raft
        .vote(req)
        .await
        .map_err(|e| RaftApiError(e.to_string()))?;
    Ok(Json(resp))
}

async fn handle_append(
    State(state): State<RaftState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Result<Json<AppendEntriesResponse<NodeId>>, RaftApiError> {
    let resp = state
        .raft
        .append_entries(req)
        .await
        .map_err(|e| RaftApiError(e.to_string()))?;
    Ok(Json(resp))
}

async fn handle_snapshot(
    State(state): State<RaftState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Result<Json<InstallSnapshotResponse<NodeId>>, RaftApiError> {
    let resp = state
        .raft
        .install_snapshot(req)
        .await
        .map_err(|e| RaftApiError(e.to_string()))?;
    Ok(Json(resp))
}
