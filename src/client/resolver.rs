//! Client-side name resolution: the current cluster membership, fetched
//! from a seed endpoint and partitioned by role. Refreshes run on a
//! periodic tick and on demand after connection errors.

use crate::api::v1::Server;
use crate::api::v1::log_client::LogClient;
use crate::api::v1::GetServersRequest;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tonic::Status;
use tonic::transport::Channel;
use tracing::debug;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3);

/// One resolved server address, tagged with its role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddr {
    pub addr: String,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addrs: Vec<ResolvedAddr>,
}

impl ResolverState {
    pub fn leader(&self) -> Option<&ResolvedAddr> {
        self.addrs.iter().find(|a| a.is_leader)
    }

    pub fn followers(&self) -> Vec<&ResolvedAddr> {
        self.addrs.iter().filter(|a| !a.is_leader).collect()
    }

    fn from_servers(servers: Vec<Server>) -> Self {
        Self {
            addrs: servers
                .into_iter()
                .map(|s| ResolvedAddr {
                    addr: s.rpc_addr,
                    is_leader: s.is_leader,
                })
                .collect(),
        }
    }
}

/// Where the resolver gets its server list. The production source is the
/// `GetServers` RPC on a seed endpoint; tests stub it.
#[tonic::async_trait]
pub trait ServerSource: Send + Sync + 'static {
    async fn get_servers(&self) -> Result<Vec<Server>, Status>;
}

pub struct GrpcServerSource {
    client: tokio::sync::Mutex<LogClient<Channel>>,
}

impl GrpcServerSource {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: tokio::sync::Mutex::new(LogClient::new(channel)),
        }
    }
}

#[tonic::async_trait]
impl ServerSource for GrpcServerSource {
    async fn get_servers(&self) -> Result<Vec<Server>, Status> {
        let mut client = self.client.lock().await;
        Ok(client
            .get_servers(GetServersRequest {})
            .await?
            .into_inner()
            .servers)
    }
}

pub struct Resolver {
    source: Arc<dyn ServerSource>,
    state: Arc<Mutex<ResolverState>>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Resolver {
    /// Performs an initial resolution, then refreshes on every `interval`
    /// tick and on [`Resolver::resolve_now`] triggers.
    pub async fn new(source: Arc<dyn ServerSource>, interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(ResolverState::default()));
        let refresh = Arc::new(Notify::new());

        refresh_once(&source, &state).await;

        let task = {
            let source = source.clone();
            let state = state.clone();
            let refresh = refresh.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = refresh.notified() => {}
                    }
                    refresh_once(&source, &state).await;
                }
            })
        };

        Self {
            source,
            state,
            refresh,
            task,
        }
    }

    pub fn state(&self) -> ResolverState {
        self.state.lock().clone()
    }

    /// Requests a background refresh, e.g. after a connection error.
    pub fn resolve_now(&self) {
        self.refresh.notify_one();
    }

    /// Refreshes inline and returns the fresh state.
    pub async fn refresh(&self) -> ResolverState {
        refresh_once(&self.source, &self.state).await;
        self.state()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn refresh_once(source: &Arc<dyn ServerSource>, state: &Arc<Mutex<ResolverState>>) {
    match source.get_servers().await {
        Ok(servers) => {
            let fresh = ResolverState::from_servers(servers);
            *state.lock() = fresh;
        }
        // keep the last known state on transient failures
        Err(e) => debug!(error = %e, "Server resolution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource;

    #[tonic::async_trait]
    impl ServerSource for StubSource {
        async fn get_servers(&self) -> Result<Vec<Server>, Status> {
            Ok(vec![
                Server {
                    id: "leader".to_string(),
                    rpc_addr: "localhost:9001".to_string(),
                    is_leader: true,
                },
                Server {
                    id: "follower".to_string(),
                    rpc_addr: "localhost:9002".to_string(),
                    is_leader: false,
                },
            ])
        }
    }

    #[tokio::test]
    async fn test_resolver_partitions_by_role() {
        let resolver = Resolver::new(Arc::new(StubSource), DEFAULT_REFRESH_INTERVAL).await;

        let state = resolver.state();
        assert_eq!(
            state.addrs,
            vec![
                ResolvedAddr {
                    addr: "localhost:9001".to_string(),
                    is_leader: true,
                },
                ResolvedAddr {
                    addr: "localhost:9002".to_string(),
                    is_leader: false,
                },
            ]
        );

        assert_eq!(state.leader().unwrap().addr, "localhost:9001");
        let followers = state.followers();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].addr, "localhost:9002");
    }

    #[tokio::test]
    async fn test_refresh_replaces_state() {
        let resolver = Resolver::new(Arc::new(StubSource), DEFAULT_REFRESH_INTERVAL).await;
        *resolver.state.lock() = ResolverState::default();

        let state = resolver.refresh().await;
        assert_eq!(state.addrs.len(), 2);
    }
}
