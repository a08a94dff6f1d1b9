//! Cluster-aware client: resolves the membership through a seed endpoint,
//! routes writes to the leader and reads to followers, and refreshes the
//! view after connection errors.

pub mod picker;
pub mod resolver;

use crate::api::v1::log_client::LogClient;
use crate::api::v1::{ConsumeRequest, ConsumeResponse, ProduceRequest, Record, Server};
use picker::{Picker, RpcKind};
use resolver::{DEFAULT_REFRESH_INTERVAL, GrpcServerSource, Resolver, ServerSource};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::{Status, Streaming};
use tracing::debug;

pub struct ClusterClient {
    resolver: Resolver,
    picker: Picker,
    tls: ClientTlsConfig,
    channels: tokio::sync::Mutex<HashMap<String, LogClient<Channel>>>,
}

impl ClusterClient {
    /// Connects to `seed_addr`, resolves the cluster through it, and
    /// serves requests against the resolved members.
    pub async fn connect(seed_addr: &str, tls: ClientTlsConfig) -> Result<Self, Status> {
        let channel = dial(seed_addr, &tls).await?;
        let source: Arc<dyn ServerSource> = Arc::new(GrpcServerSource::new(channel));
        let resolver = Resolver::new(source, DEFAULT_REFRESH_INTERVAL).await;

        Ok(Self {
            resolver,
            picker: Picker::new(),
            tls,
            channels: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Appends one record via the leader and returns its offset.
    pub async fn produce(&self, value: Vec<u8>) -> Result<u64, Status> {
        let request = ProduceRequest {
            record: Some(Record {
                value,
                ..Default::default()
            }),
        };

        self.call(RpcKind::Produce, |mut client| {
            let request = request.clone();
            async move { client.produce(request).await.map(|r| r.into_inner().offset) }
        })
        .await
    }

    /// Reads one record from a follower (or the leader when alone).
    pub async fn consume(&self, offset: u64) -> Result<Record, Status> {
        let response = self
            .call(RpcKind::Consume, move |mut client| async move {
                client.consume(ConsumeRequest { offset }).await
            })
            .await?;
        response
            .into_inner()
            .record
            .ok_or_else(|| Status::internal("response carried no record"))
    }

    /// Opens a tailing stream from `offset`.
    pub async fn consume_stream(
        &self,
        offset: u64,
    ) -> Result<Streaming<ConsumeResponse>, Status> {
        let response = self
            .call(RpcKind::Consume, move |mut client| async move {
                client.consume_stream(ConsumeRequest { offset }).await
            })
            .await?;
        Ok(response.into_inner())
    }

    /// The resolver's current view of the cluster.
    pub async fn get_servers(&self) -> Result<Vec<Server>, Status> {
        self.call(RpcKind::Consume, |mut client| async move {
            client
                .get_servers(crate::api::v1::GetServersRequest {})
                .await
                .map(|r| r.into_inner().servers)
        })
        .await
    }

    /// Picks a server for the RPC and runs it, refreshing the resolver
    /// state and retrying once when the pick fails or the server is
    /// unreachable.
    async fn call<T, F, Fut>(&self, kind: RpcKind, mut rpc: F) -> Result<T, Status>
    where
        F: FnMut(LogClient<Channel>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let mut refreshed = false;
        loop {
            let state = if refreshed {
                self.resolver.state()
            } else {
                match self.pickable(kind) {
                    Some(state) => state,
                    None => {
                        refreshed = true;
                        self.resolver.refresh().await
                    }
                }
            };

            let Some(addr) = self.picker.pick(&state, kind) else {
                return Err(Status::unavailable(match kind {
                    RpcKind::Produce => "no leader available",
                    RpcKind::Consume => "no servers available",
                }));
            };

            let client = self.client_for(&addr).await?;
            match rpc(client).await {
                Ok(value) => return Ok(value),
                Err(status) if status.code() == tonic::Code::Unavailable && !refreshed => {
                    debug!(addr, "Server unavailable, refreshing resolver state");
                    self.channels.lock().await.remove(&addr);
                    self.resolver.refresh().await;
                    refreshed = true;
                }
                Err(status) => return Err(status),
            }
        }
    }

    fn pickable(&self, kind: RpcKind) -> Option<resolver::ResolverState> {
        let state = self.resolver.state();
        self.picker.pick(&state, kind).map(|_| state)
    }

    async fn client_for(&self, addr: &str) -> Result<LogClient<Channel>, Status> {
        let mut channels = self.channels.lock().await;
        if let Some(client) = channels.get(addr) {
            return Ok(client.clone());
        }
        let channel = dial(addr, &self.tls).await?;
        let client = LogClient::new(channel);
        channels.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

async fn dial(addr: &str, tls: &ClientTlsConfig) -> Result<Channel, Status> {
    Channel::from_shared(format!("https://{addr}"))
        .map_err(|e| Status::invalid_argument(format!("bad address {addr}: {e}")))?
        .tls_config(tls.clone())
        .map_err(|e| Status::internal(format!("tls config rejected: {e}")))?
        .connect()
        .await
        .map_err(|e| Status::unavailable(format!("failed to connect to {addr}: {e}")))
}
