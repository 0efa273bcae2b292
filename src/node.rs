//! Node assembly: Raft runtime construction, bootstrap, and cluster join.

use crate::api::models::MemberJoinRequest;
use crate::cluster::network::NetworkFactory;
use crate::cluster::store::{LogStore, StateMachineStore};
use crate::cluster::types::{NodeId, Raft};
use crate::config;
use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, SnapshotPolicy};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Startup options for one node, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: NodeId,
    pub data_dir: PathBuf,
    pub dimension: usize,
    /// HTTP address advertised to peers (used when deciding bootstrap).
    pub http_adv_addr: String,
    /// Raft RPC address advertised to peers (stored in the membership).
    pub rpc_adv_addr: String,
    /// Comma-separated peer HTTP addresses; empty means bootstrap.
    pub join_addrs: String,
}

/// A running Raft node: the consensus runtime plus the index state machine.
pub struct Node {
    pub raft: Arc<Raft>,
    pub sm: Arc<StateMachineStore>,
    opts: NodeOptions,
}

impl Node {
    /// Build the state machine, the persistent stores, and the Raft
    /// instance, and start the periodic snapshot trigger.
    pub async fn start(opts: NodeOptions) -> Result<Self, Box<dyn std::error::Error>> {
        fs::create_dir_all(&opts.data_dir)?;

        let sm = Arc::new(StateMachineStore::new(
            &opts.data_dir.join(config::INDEX_DIR),
            opts.dimension,
            &opts.data_dir.join(config::SNAPSHOTS_DIR),
        )?);
        let log_store = LogStore::open(&opts.data_dir)?;

        let raft_config = Arc::new(
            openraft::Config {
                heartbeat_interval: config::HEARTBEAT_INTERVAL_MS,
                election_timeout_min: config::ELECTION_TIMEOUT_MIN_MS,
                election_timeout_max: config::ELECTION_TIMEOUT_MAX_MS,
                snapshot_policy: SnapshotPolicy::LogsSinceLast(config::SNAPSHOT_THRESHOLD),
                snapshot_max_chunk_size: config::SNAPSHOT_MAX_CHUNK_BYTES,
                ..Default::default()
            }
            .validate()?,
        );

        let network = NetworkFactory::new();
        let raft = Arc::new(Raft::new(opts.id, raft_config, network, log_store, sm.clone()).await?);

        // Time-based snapshots on top of the log-growth policy.
        let trigger = raft.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(config::SNAPSHOT_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = trigger.trigger().snapshot().await {
                    tracing::debug!(%err, "periodic snapshot trigger skipped");
                }
            }
        });

        tracing::info!(node_id = opts.id, "raft node initialized");
        Ok(Self { raft, sm, opts })
    }

    /// A node bootstraps when it has no peers to join, or when the join list
    /// is just its own address.
    pub fn should_bootstrap(&self) -> bool {
        self.opts.join_addrs.is_empty() || self.opts.join_addrs == self.opts.http_adv_addr
    }

    /// Initialize a single-node cluster with this node as the sole voter.
    /// A restart of an already-initialized node is a no-op.
    pub async fn bootstrap(&self) -> Result<(), Box<dyn std::error::Error>> {
        let mut members = BTreeMap::new();
        members.insert(self.opts.id, BasicNode::new(self.opts.rpc_adv_addr.clone()));
        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!(node_id = self.opts.id, "bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::info!(node_id = self.opts.id, "already initialized; skipping bootstrap");
                Ok(())
            }
            Err(err) => Err(Box::new(err)),
        }
    }

    /// Ask each peer in turn to admit this node, with bounded retries.
    ///
    /// Exhausting every attempt is not fatal: the node keeps running and can
    /// be added manually through a leader's `/members` endpoint.
    pub async fn join_cluster(&self) {
        let request = MemberJoinRequest {
            rpc_addr: self.opts.rpc_adv_addr.clone(),
            http_addr: self.opts.http_adv_addr.clone(),
            id: self.opts.id,
        };
        let client = reqwest::Client::new();
        for attempt in 0..config::JOIN_ATTEMPTS {
            for peer in self
                .opts
                .join_addrs
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
            {
                match client
                    .post(format!("http://{peer}/members"))
                    .json(&request)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                        tracing::info!(peer, node_id = self.opts.id, "joined cluster");
                        return;
                    }
                    Ok(resp) => {
                        tracing::warn!(peer, status = %resp.status(), "join attempt rejected");
                    }
                    Err(err) => {
                        tracing::warn!(peer, %err, "join attempt failed");
                    }
                }
            }
            if attempt + 1 < config::JOIN_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
            }
        }
        tracing::warn!(
            node_id = self.opts.id,
            "could not join any peer; continuing unjoined (add this node manually)"
        );
    }
}
