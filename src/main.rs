use annex::api;
use annex::api::handlers::AppState;
use annex::cluster::api::{raft_router, RaftState};
use annex::config;
use annex::node::{Node, NodeOptions};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "annex", about = "Replicated nearest-neighbor index server")]
struct Args {
    /// Node identity, cluster-unique
    #[arg(long)]
    id: u64,

    /// Base directory for Raft stores, snapshots, and the index
    #[arg(long)]
    data_dir: PathBuf,

    /// Vector dimensionality, fixed at first bootstrap
    #[arg(long)]
    dimension: usize,

    /// HTTP bind address
    #[arg(long, default_value = config::DEFAULT_HTTP_ADDR)]
    http_addr: String,

    /// HTTP address advertised to peers (defaults to --http-addr)
    #[arg(long)]
    http_adv_addr: Option<String>,

    /// Raft RPC bind address
    #[arg(long, default_value = config::DEFAULT_RPC_ADDR)]
    rpc_addr: String,

    /// Raft RPC address advertised to peers (defaults to --rpc-addr)
    #[arg(long)]
    rpc_adv_addr: Option<String>,

    /// Comma-separated HTTP addresses of peers to join; empty bootstraps
    #[arg(long, default_value = "")]
    join_addrs: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("annex=info".parse().expect("valid directive literal")),
        )
        .init();

    let args = Args::parse();

    if args.dimension == 0 {
        eprintln!("Error: dimension must be >= 1");
        std::process::exit(1);
    }
    let data_path = args.data_dir.as_path();
    if data_path.exists() && !data_path.is_dir() {
        eprintln!(
            "Error: data_dir '{}' exists but is not a directory",
            data_path.display()
        );
        std::process::exit(1);
    }

    let http_adv_addr = args
        .http_adv_addr
        .clone()
        .unwrap_or_else(|| args.http_addr.clone());
    let rpc_adv_addr = args
        .rpc_adv_addr
        .clone()
        .unwrap_or_else(|| args.rpc_addr.clone());

    let node = Arc::new(
        Node::start(NodeOptions {
            id: args.id,
            data_dir: args.data_dir.clone(),
            dimension: args.dimension,
            http_adv_addr: http_adv_addr.clone(),
            rpc_adv_addr: rpc_adv_addr.clone(),
            join_addrs: args.join_addrs.clone(),
        })
        .await?,
    );

    let prometheus_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        raft: node.raft.clone(),
        sm: node.sm.clone(),
        node_id: args.id,
        dimension: args.dimension,
        prometheus_handle,
        start_time: Instant::now(),
    };
    let app = api::create_router(state);
    let rpc_app = raft_router(RaftState {
        raft: node.raft.clone(),
    });

    // Bind both planes before touching membership, so peers can reach this
    // node as soon as it announces itself.
    let rpc_listener = tokio::net::TcpListener::bind(&args.rpc_addr).await?;
    let http_listener = tokio::net::TcpListener::bind(&args.http_addr).await?;

    tokio::spawn(async move {
        if let Err(err) = axum::serve(rpc_listener, rpc_app).await {
            tracing::error!(%err, "raft rpc listener failed");
        }
    });

    if node.should_bootstrap() {
        node.bootstrap().await?;
    } else {
        let joiner = node.clone();
        tokio::spawn(async move {
            joiner.join_cluster().await;
        });
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = args.id,
        http_addr = %args.http_addr,
        rpc_addr = %args.rpc_addr,
        data_dir = %args.data_dir.display(),
        dimension = args.dimension,
        "annex ready"
    );

    axum::serve(http_listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    tracing::info!("shut down");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutting down gracefully, draining in-flight requests...");
}
