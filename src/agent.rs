//! The agent assembles one node: the data log, the consensus layer, the
//! multiplexed TLS listener, the gRPC server, gossip membership, and the
//! policy engine, all driven by one [`AgentConfig`].

use crate::AgentResult;
use crate::api::v1::log_server::LogServer;
use crate::auth::Authorizer;
use crate::config::AgentConfig;
use crate::consensus::transport::{self, RaftClient};
use crate::consensus::{DistributedLog, LogFsm, Raft, RaftConfig, SnapshotStore};
use crate::membership::{EventHandler, Membership, MembershipConfig};
use crate::server::grpc::LogService;
use crate::server::mux;
use crate::server::registry::ServerRegistry;
use crate::storage::{self, log::Log};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument};

pub struct Agent {
    config: AgentConfig,
    log: Arc<Log>,
    raft_log: Arc<Log>,
    distributed: Arc<DistributedLog>,
    membership: Arc<Membership>,
    mux_shutdown: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    server_task: JoinHandle<()>,
    shut_down: AtomicBool,
}

impl Agent {
    /// Brings the node up: storage, consensus, listener, membership, RPC
    /// server. The node serves immediately; callers that need a leader
    /// use [`Agent::wait_for_leader`].
    #[instrument(skip_all, fields(node = %config.node_name))]
    pub async fn new(config: AgentConfig) -> AgentResult<Self> {
        let rpc_addr = config.rpc_addr()?;

        // data log and the state machine over it
        let log = Arc::new(Log::new(config.data_dir.join("log"), config.storage)?);
        let fsm = Arc::new(LogFsm::new(log.clone()));

        // consensus: its own entry log, snapshots, and peer transport
        let raft_dir = config.data_dir.join("raft");
        let mut raft_log_config = storage::Config::default();
        raft_log_config.segment.initial_offset = 1;
        let raft_log = Arc::new(Log::new(raft_dir.join("log"), raft_log_config)?);
        let snapshots = SnapshotStore::new(raft_dir.join("snapshots"))?;
        let raft_client = Arc::new(RaftClient::new(Arc::new(config.peer_tls.client_config()?)));

        let mut raft_config = RaftConfig::new(&config.node_name, &rpc_addr, &raft_dir);
        raft_config.bootstrap = config.bootstrap;
        let raft = Raft::spawn(
            raft_config,
            raft_log.clone(),
            fsm.clone(),
            snapshots,
            raft_client,
        )?;
        let distributed = Arc::new(DistributedLog::new(log.clone(), raft.clone()));

        // one listener for consensus and RPC traffic
        let listener =
            TcpListener::bind(&rpc_addr)
                .await
                .map_err(|source| crate::errors::AgentError::Bind {
                    addr: rpc_addr.clone(),
                    source,
                })?;
        let acceptor = TlsAcceptor::from(Arc::new(config.server_tls.server_config()?));
        let (raft_conn_tx, raft_conn_rx) = mpsc::channel(64);
        let (grpc_conn_tx, grpc_conn_rx) = mpsc::channel(64);
        let (mux_shutdown_tx, mux_shutdown_rx) = oneshot::channel();
        mux::serve(
            listener,
            acceptor,
            raft_conn_tx,
            grpc_conn_tx,
            mux_shutdown_rx,
        );
        transport::serve_inbound(raft_conn_rx, raft.clone());

        // membership feeds voter changes to the leader
        let handler = Arc::new(VoterEventHandler {
            distributed: distributed.clone(),
        });
        let mut membership_config =
            MembershipConfig::new(&config.node_name, &config.bind_addr, &rpc_addr);
        membership_config.start_join_addrs = config.start_join_addrs.clone();
        let membership = Membership::start(membership_config, handler).await?;

        // RPC server over the demultiplexed streams
        let registry = Arc::new(ServerRegistry::new(membership.clone(), raft.clone()));
        let authorizer = Arc::new(Authorizer::new(
            &config.acl_model_file,
            &config.acl_policy_file,
        )?);
        let service = LogService::new(distributed.clone(), authorizer, registry);
        let server_task = tokio::spawn(async move {
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(LogServer::new(service))
                .serve_with_incoming(ReceiverStream::new(grpc_conn_rx))
                .await
            {
                error!(error = %e, "RPC server failed");
            }
        });

        info!(%rpc_addr, "Agent started");

        Ok(Self {
            config,
            log,
            raft_log,
            distributed,
            membership,
            mux_shutdown: parking_lot::Mutex::new(Some(mux_shutdown_tx)),
            server_task,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Blocks until the cluster has a leader, returning its RPC address.
    pub async fn wait_for_leader(&self, timeout: Duration) -> AgentResult<String> {
        Ok(self.distributed.wait_for_leader(timeout).await?)
    }

    pub fn rpc_addr(&self) -> AgentResult<String> {
        Ok(self.config.rpc_addr()?)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn distributed(&self) -> &Arc<DistributedLog> {
        &self.distributed
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Leaves the cluster, stops consensus, the listener, and the RPC
    /// server, and closes the logs. Safe to call more than once.
    #[instrument(skip_all, fields(node = %self.config.node_name))]
    pub async fn shutdown(&self) -> AgentResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.membership.leave().await {
            debug!(error = %e, "Membership leave reported an error");
        }
        self.distributed.shutdown().await;

        if let Some(tx) = self.mux_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.server_task.abort();

        self.log.close()?;
        self.raft_log.close()?;

        info!("Agent stopped");
        Ok(())
    }
}

/// Translates membership transitions into consensus voter changes once a
/// leader exists; non-leaders drop the events.
struct VoterEventHandler {
    distributed: Arc<DistributedLog>,
}

impl EventHandler for VoterEventHandler {
    fn handle_join(&self, name: &str, rpc_addr: &str) {
        let distributed = self.distributed.clone();
        let name = name.to_string();
        let rpc_addr = rpc_addr.to_string();
        tokio::spawn(async move {
            if distributed
                .wait_for_leader(Duration::from_secs(10))
                .await
                .is_err()
                || !distributed.is_leader()
            {
                return;
            }
            if let Err(e) = distributed.add_voter(&name, &rpc_addr).await {
                debug!(member = %name, error = %e, "Voter add skipped");
            }
        });
    }

    fn handle_leave(&self, name: &str) {
        if !self.distributed.is_leader() {
            return;
        }
        let distributed = self.distributed.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = distributed.remove_server(&name).await {
                debug!(member = %name, error = %e, "Voter removal skipped");
            }
        });
    }
}
