//! Cluster end to end: three mTLS agents elect a leader, replicate
//! records, serve follower reads, enforce the ACL, and refuse writes on
//! followers.

mod common;

use common::{TestCerts, free_ports, write_acl};
use replog::agent::Agent;
use replog::api::v1::log_client::LogClient;
use replog::api::v1::{ProduceRequest, Record};
use replog::client::ClusterClient;
use replog::config::AgentConfig;
use replog::storage;
use std::time::Duration;
use tempfile::TempDir;
use tonic::Code;
use tonic::transport::Channel;

struct Cluster {
    _dir: TempDir,
    certs: TestCerts,
    agents: Vec<Agent>,
}

async fn start_cluster(size: usize) -> Cluster {
    let dir = TempDir::new().unwrap();
    let certs = TestCerts::generate(dir.path());
    let (model, policy) = write_acl(dir.path());

    let ports = free_ports(size * 2);
    let mut agents = Vec::new();
    for i in 0..size {
        let bind_addr = format!("127.0.0.1:{}", ports[i * 2]);
        let rpc_port = ports[i * 2 + 1];
        let start_join_addrs = if i == 0 {
            Vec::new()
        } else {
            vec![format!("127.0.0.1:{}", ports[0])]
        };

        let config = AgentConfig {
            data_dir: dir.path().join(format!("node-{i}")),
            bind_addr,
            rpc_port,
            node_name: format!("node-{i}"),
            start_join_addrs,
            bootstrap: i == 0,
            storage: storage::Config::default(),
            server_tls: certs.server_tls(),
            peer_tls: certs.root_client_tls(),
            acl_model_file: model.clone(),
            acl_policy_file: policy.clone(),
        };

        agents.push(Agent::new(config).await.unwrap());
    }

    Cluster {
        _dir: dir,
        certs,
        agents,
    }
}

async fn shutdown(cluster: &Cluster) {
    for agent in &cluster.agents {
        agent.shutdown().await.unwrap();
    }
}

async fn direct_client(cluster: &Cluster, agent: &Agent) -> LogClient<Channel> {
    let tls = cluster.certs.root_client_tls().client_tls().unwrap();
    let channel = Channel::from_shared(format!("https://{}", agent.rpc_addr().unwrap()))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .unwrap();
    LogClient::new(channel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replication_end_to_end() {
    let cluster = start_cluster(3).await;

    // node 0 bootstrapped, so it wins the first election
    let leader_addr = cluster.agents[0]
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(leader_addr, cluster.agents[0].rpc_addr().unwrap());

    let client_tls = cluster.certs.root_client_tls().client_tls().unwrap();
    let client = ClusterClient::connect(&leader_addr, client_tls).await.unwrap();

    let offset = client.produce(b"foo".to_vec()).await.unwrap();
    assert_eq!(offset, 0);

    // replication settles, then any member serves the record
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        match client.consume(0).await {
            Ok(record) => {
                assert_eq!(record.value, b"foo");
                break;
            }
            Err(e) if tokio::time::Instant::now() < deadline => {
                assert_eq!(e.code(), Code::OutOfRange, "unexpected error: {e}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => panic!("record never became readable on a follower: {e}"),
        }
    }

    // the next offset has not been written anywhere
    let err = client.consume(1).await.unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);

    // membership converges on three servers with exactly one leader
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let servers = client.get_servers().await.unwrap();
        let leaders = servers.iter().filter(|s| s.is_leader).count();
        if servers.len() == 3 && leaders == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster view never converged: {servers:?}"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // a snapshot of the applied state lands in the leader's snapshot store
    cluster.agents[0]
        .distributed()
        .take_snapshot()
        .await
        .unwrap();
    let snapshot_dir = cluster.agents[0]
        .config()
        .data_dir
        .join("raft")
        .join("snapshots");
    let has_snapshot = std::fs::read_dir(snapshot_dir)
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.path().extension().is_some_and(|ext| ext == "snap"));
    assert!(has_snapshot);

    shutdown(&cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_refuse_writes() {
    let cluster = start_cluster(3).await;
    cluster.agents[0]
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();

    // wait until the follower has joined the cluster and learned the leader
    cluster.agents[1]
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();

    let mut follower = direct_client(&cluster, &cluster.agents[1]).await;
    let err = follower
        .produce(ProduceRequest {
            record: Some(Record {
                value: b"rejected".to_vec(),
                ..Default::default()
            }),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    shutdown(&cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unauthorized_subject_denied() {
    let cluster = start_cluster(1).await;
    let leader_addr = cluster.agents[0]
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();

    let nobody_tls = cluster.certs.nobody_client_tls().client_tls().unwrap();
    let client = ClusterClient::connect(&leader_addr, nobody_tls).await.unwrap();

    let err = client.produce(b"denied".to_vec()).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = client.consume(0).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    shutdown(&cluster).await;
}
