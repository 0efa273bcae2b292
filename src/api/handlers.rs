//! HTTP request handlers and application state.
//!
//! Write endpoints are leader-gated: a non-leader answers 500 with the body
//! `not leader` and the client retries against another node. Validated
//! request bodies travel through the Raft log verbatim inside the command
//! envelope; search is served from the local replica without consensus.

use crate::api::errors::ApiError;
use crate::api::metrics;
use crate::api::models::{
    HealthResponse, InsertRequest, InsertResponse, MemberInfo, MemberJoinRequest, RemoveRequest,
    SearchHit, SearchRequest,
};
use crate::cluster::store::StateMachineStore;
use crate::cluster::types::{Command, CommandResponse, NodeId, Raft};
use crate::config;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use openraft::{BasicNode, ChangeMembers};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared application state passed to every handler via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    pub raft: Arc<Raft>,
    pub sm: Arc<StateMachineStore>,
    pub node_id: NodeId,
    pub dimension: usize,
    pub prometheus_handle: PrometheusHandle,
    pub start_time: Instant,
}

async fn ensure_leader(state: &AppState) -> Result<(), ApiError> {
    if state.raft.current_leader().await == Some(state.node_id) {
        Ok(())
    } else {
        Err(ApiError::NotLeader)
    }
}

fn validate_vector(vector: &[f64], dimension: usize) -> Result<(), ApiError> {
    if vector.len() != dimension {
        return Err(ApiError::BadRequest(format!(
            "vector length {} != index dimension {}",
            vector.len(),
            dimension
        )));
    }
    if vector.iter().any(|v| v.is_nan() || v.is_infinite()) {
        return Err(ApiError::BadRequest("vector contains NaN or Inf".into()));
    }
    Ok(())
}

/// Submit a command to the log and wait for it to be applied.
///
/// Bounded by the apply timeout; a timed-out command may still commit later,
/// so writes are at-least-once from the client's perspective.
async fn submit(state: &AppState, command: Command) -> Result<CommandResponse, ApiError> {
    metrics::record_command(&command.op);
    let write = tokio::time::timeout(
        Duration::from_millis(config::APPLY_TIMEOUT_MS),
        state.raft.client_write(command),
    )
    .await;
    match write {
        Err(_elapsed) => Err(ApiError::Internal(
            "apply timed out; the write may still commit".into(),
        )),
        Ok(Err(err)) => {
            if err.forward_to_leader().is_some() {
                return Err(ApiError::NotLeader);
            }
            tracing::error!(%err, "raft write failed");
            Err(ApiError::Internal("write replication failed".into()))
        }
        Ok(Ok(resp)) => Ok(resp.data),
    }
}

/// `POST /insert` — leader only.
pub async fn insert(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InsertResponse>, ApiError> {
    ensure_leader(&state).await?;
    let req: InsertRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid insert body: {e}")))?;
    validate_vector(&req.vector, state.dimension)?;

    let resp = submit(&state, Command::insert(body.to_vec())).await?;
    match resp.id {
        Some(id) => Ok(Json(InsertResponse { id })),
        None => Err(ApiError::Internal("apply returned no id".into())),
    }
}

/// `POST /remove` — leader only.
pub async fn remove(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    ensure_leader(&state).await?;
    let _req: RemoveRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid remove body: {e}")))?;

    submit(&state, Command::remove(body.to_vec())).await?;
    Ok(StatusCode::OK)
}

/// `POST /search` — served from the local replica, no consensus.
///
/// Results reflect this node's applied prefix of the log; they are not
/// linearizable across leader changes.
pub async fn search(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    let req: SearchRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid search body: {e}")))?;
    validate_vector(&req.vector, state.dimension)?;
    if req.results == 0 || req.results > config::MAX_K {
        return Err(ApiError::BadRequest(format!(
            "results must be in 1..={}",
            config::MAX_K
        )));
    }

    let hits = state
        .sm
        .search(&req.vector, req.results, req.epsilon)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(
        hits.into_iter()
            .map(|h| SearchHit {
                id: h.id,
                distance: h.distance,
            })
            .collect(),
    ))
}

/// `POST /members` — leader only.
///
/// Reconciles the joiner against the current configuration before adding it:
/// an exact `(id, rpc_addr)` match is already registered; a member with the
/// same id but a different address gets its node record rewritten in place
/// (replication retargets the new address immediately, so the change can
/// commit even when the old address is dead); any other id squatting the
/// joiner's address is a stale entry and is removed. The scan completes
/// before anything is changed so every duplicate is handled.
pub async fn members(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    ensure_leader(&state).await?;
    let req: MemberJoinRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid join body: {e}")))?;

    let raft_metrics = state.raft.metrics().borrow().clone();
    let membership = raft_metrics.membership_config.membership().clone();

    let mut known = false;
    let mut stale: BTreeSet<NodeId> = BTreeSet::new();
    for (id, node) in membership.nodes() {
        if *id == req.id && node.addr == req.rpc_addr {
            return Ok(StatusCode::OK);
        }
        if *id == req.id {
            known = true;
        } else if node.addr == req.rpc_addr {
            stale.insert(*id);
        }
    }

    if !stale.is_empty() {
        tracing::info!(?stale, joiner = req.id, "removing stale members at the joiner's address");
        state
            .raft
            .change_membership(ChangeMembers::RemoveVoters(stale), false)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    if known {
        // Same id re-joining from a new address.
        let nodes = BTreeMap::from([(req.id, BasicNode::new(req.rpc_addr.clone()))]);
        state
            .raft
            .change_membership(ChangeMembers::SetNodes(nodes), false)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    } else {
        state
            .raft
            .add_learner(req.id, BasicNode::new(req.rpc_addr.clone()), true)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    state
        .raft
        .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([req.id])), false)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(id = req.id, rpc_addr = %req.rpc_addr, "member joined");
    Ok(StatusCode::OK)
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let raft_metrics = state.raft.metrics().borrow().clone();
    let members = raft_metrics
        .membership_config
        .membership()
        .nodes()
        .map(|(id, node)| MemberInfo {
            id: *id,
            rpc_addr: node.addr.clone(),
        })
        .collect();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.node_id,
        leader: raft_metrics.current_leader,
        members,
        vectors: state.sm.vector_count(),
        dimension: state.dimension,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// `GET /metrics` — Prometheus exposition text.
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    metrics::update_index_metrics(&state.sm);
    state.prometheus_handle.render()
}
