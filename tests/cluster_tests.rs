use annex::api;
use annex::api::handlers::AppState;
use annex::cluster::api::{raft_router, RaftState};
use annex::node::{Node, NodeOptions};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct TestNode {
    id: u64,
    http_addr: String,
    node: Arc<Node>,
}

/// Spin up a full node: state machine, raft runtime, and both HTTP planes on
/// ephemeral ports. Bootstrap when `join_addrs` is empty, otherwise join in
/// the background like the binary does.
async fn spawn_node(id: u64, dimension: usize, data_dir: &Path, join_addrs: &str) -> TestNode {
    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rpc_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap().to_string();
    let rpc_addr = rpc_listener.local_addr().unwrap().to_string();

    let node = Arc::new(
        Node::start(NodeOptions {
            id,
            data_dir: data_dir.to_path_buf(),
            dimension,
            http_adv_addr: http_addr.clone(),
            rpc_adv_addr: rpc_addr.clone(),
            join_addrs: join_addrs.to_string(),
        })
        .await
        .unwrap(),
    );

    let prometheus_handle =
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(_) => metrics_exporter_prometheus::PrometheusBuilder::new()
                .build_recorder()
                .handle(),
        };

    let state = AppState {
        raft: node.raft.clone(),
        sm: node.sm.clone(),
        node_id: id,
        dimension,
        prometheus_handle,
        start_time: Instant::now(),
    };
    let app = api::create_router(state);
    let rpc_app = raft_router(RaftState {
        raft: node.raft.clone(),
    });

    tokio::spawn(async move {
        axum::serve(rpc_listener, rpc_app).await.unwrap();
    });
    tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap();
    });

    if node.should_bootstrap() {
        node.bootstrap().await.unwrap();
    } else {
        let joiner = node.clone();
        tokio::spawn(async move {
            joiner.join_cluster().await;
        });
    }

    TestNode {
        id,
        http_addr,
        node,
    }
}

fn client() -> Client {
    Client::new()
}

async fn health(client: &Client, addr: &str) -> serde_json::Value {
    client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll `/health` until a leader is known.
async fn wait_for_leader(client: &Client, addr: &str) {
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("http://{addr}/health")).send().await {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if !body["leader"].is_null() {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no leader elected within timeout");
}

/// Poll `/health` until the membership reaches `count` nodes.
async fn wait_for_members(client: &Client, addr: &str, count: usize) {
    for _ in 0..150 {
        let body = health(client, addr).await;
        if body["members"].as_array().map(|m| m.len()) == Some(count) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("membership did not reach {count} nodes within timeout");
}

async fn insert_vector(client: &Client, addr: &str, vector: &[f64]) -> reqwest::Response {
    client
        .post(format!("http://{addr}/insert"))
        .json(&serde_json::json!({ "vector": vector }))
        .send()
        .await
        .unwrap()
}

async fn search_ids(client: &Client, addr: &str, vector: &[f64], k: usize) -> Vec<u64> {
    let hits: Vec<serde_json::Value> = client
        .post(format!("http://{addr}/search"))
        .json(&serde_json::json!({ "vector": vector, "results": k, "epsilon": 0.1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    hits.iter().map(|h| h["id"].as_u64().unwrap()).collect()
}

/// Poll a replica until its nearest neighbor for `vector` is `expected_id`.
async fn wait_for_nearest(client: &Client, addr: &str, vector: &[f64], expected_id: u64) {
    for _ in 0..150 {
        let ids = search_ids(client, addr, vector, 1).await;
        if ids.first() == Some(&expected_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("replica at {addr} never caught up: wanted id {expected_id} for {vector:?}");
}

#[tokio::test]
async fn single_node_bootstrap_insert_and_search() {
    let tmp = TempDir::new().unwrap();
    let n1 = spawn_node(1, 2, tmp.path(), "").await;
    let client = client();
    wait_for_leader(&client, &n1.http_addr).await;

    let resp = insert_vector(&client, &n1.http_addr, &[1.0, 0.0]).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 0);

    let resp = insert_vector(&client, &n1.http_addr, &[0.0, 1.0]).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 1);

    let ids = search_ids(&client, &n1.http_addr, &[1.0, 0.0], 1).await;
    assert_eq!(ids, vec![0]);
}

#[tokio::test]
async fn malformed_and_mismatched_bodies_are_client_errors() {
    let tmp = TempDir::new().unwrap();
    let n1 = spawn_node(1, 2, tmp.path(), "").await;
    let client = client();
    wait_for_leader(&client, &n1.http_addr).await;

    // Wrong dimension never reaches the log
    let resp = insert_vector(&client, &n1.http_addr, &[1.0, 2.0, 3.0]).await;
    assert_eq!(resp.status(), 400);

    // Malformed JSON
    let resp = client
        .post(format!("http://{}/insert", n1.http_addr))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Non-numeric vector elements are rejected before submission
    let resp = client
        .post(format!("http://{}/insert", n1.http_addr))
        .body(r#"{"vector":[null,1.0]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Search dimension is validated too
    let resp = client
        .post(format!("http://{}/search", n1.http_addr))
        .json(&serde_json::json!({ "vector": [1.0], "results": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Cluster state is untouched
    let body = health(&client, &n1.http_addr).await;
    assert_eq!(body["vectors"], 0);
}

#[tokio::test]
async fn remove_is_idempotent_and_hides_the_id() {
    let tmp = TempDir::new().unwrap();
    let n1 = spawn_node(1, 2, tmp.path(), "").await;
    let client = client();
    wait_for_leader(&client, &n1.http_addr).await;

    insert_vector(&client, &n1.http_addr, &[1.0, 0.0]).await;
    insert_vector(&client, &n1.http_addr, &[0.0, 1.0]).await;

    let remove = |id: u64| {
        let client = client.clone();
        let addr = n1.http_addr.clone();
        async move {
            client
                .post(format!("http://{addr}/remove"))
                .json(&serde_json::json!({ "id": id }))
                .send()
                .await
                .unwrap()
        }
    };

    assert_eq!(remove(0).await.status(), 200);
    // Removing the same id again is a committed no-op
    assert_eq!(remove(0).await.status(), 200);

    let ids = search_ids(&client, &n1.http_addr, &[1.0, 0.0], 1).await;
    assert_eq!(ids, vec![1]);
}

#[tokio::test]
async fn three_node_replication_and_leader_gating() {
    let tmp1 = TempDir::new().unwrap();
    let tmp2 = TempDir::new().unwrap();
    let tmp3 = TempDir::new().unwrap();
    let client = client();

    let n1 = spawn_node(1, 2, tmp1.path(), "").await;
    wait_for_leader(&client, &n1.http_addr).await;

    let n2 = spawn_node(2, 2, tmp2.path(), &n1.http_addr).await;
    wait_for_members(&client, &n1.http_addr, 2).await;
    let n3 = spawn_node(3, 2, tmp3.path(), &n1.http_addr).await;
    wait_for_members(&client, &n1.http_addr, 3).await;

    // Ten writes through the leader
    let vectors: Vec<[f64; 2]> = (0..10)
        .map(|i| [f64::from(i), f64::from(10 - i)])
        .collect();
    for (i, v) in vectors.iter().enumerate() {
        let resp = insert_vector(&client, &n1.http_addr, v).await;
        assert_eq!(resp.status(), 200, "insert {i} failed");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["id"], i as u64);
    }

    // Every follower converges to the same nearest neighbor per vector
    for follower in [&n2, &n3] {
        for (i, v) in vectors.iter().enumerate() {
            wait_for_nearest(&client, &follower.http_addr, v, i as u64).await;
        }
    }

    // Writes on a non-leader are refused with the wire-contract body
    for candidate in [&n1, &n2, &n3] {
        let body = health(&client, &candidate.http_addr).await;
        if body["leader"] != serde_json::json!(candidate.id) {
            let resp = insert_vector(&client, &candidate.http_addr, &[1.0, 1.0]).await;
            assert_eq!(resp.status(), 500);
            assert_eq!(resp.text().await.unwrap(), "not leader");
            return;
        }
    }
    panic!("no follower found in a three-node cluster");
}

#[tokio::test]
async fn rejoin_with_changed_rpc_addr_leaves_single_entry() {
    let tmp1 = TempDir::new().unwrap();
    let tmp2 = TempDir::new().unwrap();
    let client = client();

    let n1 = spawn_node(1, 2, tmp1.path(), "").await;
    wait_for_leader(&client, &n1.http_addr).await;
    let n2 = spawn_node(2, 2, tmp2.path(), &n1.http_addr).await;
    wait_for_members(&client, &n1.http_addr, 2).await;

    // Some replicated state for the rejoined node to catch up on
    for v in [[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]] {
        assert_eq!(insert_vector(&client, &n1.http_addr, &v).await.status(), 200);
    }

    let old_rpc = health(&client, &n1.http_addr).await["members"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["id"] == 2)
        .unwrap()["rpc_addr"]
        .as_str()
        .unwrap()
        .to_string();

    // "Crash" node 2 and bring it back with a fresh directory and new ports
    n2.node.raft.shutdown().await.unwrap();
    let tmp2b = TempDir::new().unwrap();
    let n2b = spawn_node(2, 2, tmp2b.path(), &n1.http_addr).await;

    // Membership converges to exactly one entry for id 2, with the new addr
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let members = health(&client, &n1.http_addr).await["members"]
            .as_array()
            .unwrap()
            .clone();
        let entries: Vec<_> = members.iter().filter(|m| m["id"] == 2).collect();
        if entries.len() == 1 && entries[0]["rpc_addr"] != serde_json::json!(old_rpc) {
            assert_eq!(members.len(), 2);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "membership never converged: {members:?}"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // The rejoined node catches up from snapshot + log
    wait_for_nearest(&client, &n2b.http_addr, &[1.0, 0.0], 0).await;
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let tmp = TempDir::new().unwrap();
    let n1 = spawn_node(1, 3, tmp.path(), "").await;
    let client = client();
    wait_for_leader(&client, &n1.http_addr).await;

    let body = health(&client, &n1.http_addr).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], 1);
    assert_eq!(body["dimension"], 3);
    assert_eq!(body["leader"], 1);
    assert_eq!(body["members"].as_array().unwrap().len(), 1);

    let resp = client
        .get(format!("http://{}/metrics", n1.http_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
