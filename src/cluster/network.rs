//! HTTP-based Raft RPC network transport.
//!
//! Implements openraft's `RaftNetworkFactory` and `RaftNetwork` traits by
//! POSTing JSON-encoded `Vote`, `AppendEntries`, and `InstallSnapshot` RPCs
//! to the peer's RPC listener.

use crate::cluster::types::{NodeId, TypeConfig};
use openraft::error::{NetworkError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Type alias for Raft RPC errors with default infallible application error.
pub type RPCErr<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, BasicNode, RaftError<NodeId, E>>;

/// Factory that creates HTTP connections to Raft peers, sharing one client.
#[derive(Default)]
pub struct NetworkFactory {
    client: reqwest::Client,
}

impl NetworkFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

/// An HTTP connection to a single Raft peer node.
pub struct NetworkConnection {
    target_addr: String,
    client: reqwest::Client,
}

impl NetworkConnection {
    /// POST `rpc` to `/raft/<path>` on the peer and decode the JSON reply.
    ///
    /// A connection-level failure maps to `Unreachable` (openraft backs off
    /// and retries); a malformed reply maps to `NetworkError`.
    async fn send_rpc<Req, Resp, E>(&self, path: &str, rpc: &Req) -> Result<Resp, RPCErr<E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error,
    {
        let url = format!("http://{}/raft/{}", self.target_addr, path);
        let resp = self
            .client
            .post(&url)
            .json(rpc)
            .send()
            .await
            .map_err(|e| openraft::error::RPCError::Unreachable(Unreachable::new(&e)))?;
        resp.json()
            .await
            .map_err(|e| openraft::error::RPCError::Network(NetworkError::new(&e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target_addr: node.addr.clone(),
            client: self.client.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCErr> {
        self.send_rpc("append", &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCErr<openraft::error::InstallSnapshotError>>
    {
        self.send_rpc("snapshot", &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCErr> {
        self.send_rpc("vote", &rpc).await
    }
}
