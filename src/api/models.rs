//! Request and response data transfer objects for the REST API.
//!
//! The insert and remove request bodies are exactly the command payload
//! shapes from [`crate::cluster::types`]: the handler validates them, then
//! forwards the raw body bytes through the log unchanged.

use crate::cluster::types::NodeId;
use serde::{Deserialize, Serialize};

pub use crate::cluster::types::{InsertPayload as InsertRequest, RemovePayload as RemoveRequest};

/// Response body for `POST /insert`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InsertResponse {
    pub id: u64,
}

/// Request body for `POST /search`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f64>,
    /// Maximum number of neighbors to return.
    pub results: usize,
    /// Search beam expansion factor.
    #[serde(default)]
    pub epsilon: f64,
}

/// One element of the `POST /search` response array.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: u64,
    pub distance: f64,
}

/// Request body for `POST /members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberJoinRequest {
    pub rpc_addr: String,
    pub http_addr: String,
    pub id: NodeId,
}

/// One cluster member in the `GET /health` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: NodeId,
    pub rpc_addr: String,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: NodeId,
    pub leader: Option<NodeId>,
    pub members: Vec<MemberInfo>,
    pub vectors: usize,
    pub dimension: usize,
    pub uptime_seconds: u64,
}
