use crate::api::v1::log_server;
use crate::api::v1::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse,
};
use crate::auth::Authorizer;
use crate::errors::{AuthError, ConsensusError, LogError, ServerError};
use crate::server::registry::ServerProvider;
use crate::server::{CommitLog, mux::MuxConnectInfo};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

const OBJECT_WILDCARD: &str = "*";
const PRODUCE_ACTION: &str = "produce";
const CONSUME_ACTION: &str = "consume";

/// Upper bound on how long a tailing consumer sleeps when no append
/// notification arrives.
const TAIL_POLL_INTERVAL: Duration = Duration::from_secs(1);

trait IntoStatus {
    fn into_status(self) -> Status;
}

impl IntoStatus for ServerError {
    fn into_status(self) -> Status {
        match &self {
            ServerError::Log(LogError::OffsetOutOfRange { offset }) => {
                Status::out_of_range(format!("offset out of range: {offset}"))
            }
            ServerError::Consensus(ConsensusError::NotLeader { leader_hint }) => {
                Status::unavailable(format!("not the leader, leader is {leader_hint:?}"))
            }
            ServerError::Consensus(ConsensusError::NoLeader) => {
                Status::unavailable("no leader available")
            }
            ServerError::Consensus(ConsensusError::Shutdown) => {
                Status::unavailable("server is shutting down")
            }
            _ => Status::internal(format!("log error: {self}")),
        }
    }
}

impl IntoStatus for AuthError {
    fn into_status(self) -> Status {
        match &self {
            AuthError::Denied { .. } => Status::permission_denied(self.to_string()),
            _ => Status::internal(format!("policy error: {self}")),
        }
    }
}

/// Resolves the caller's subject: the Common Name captured by the
/// multiplexed listener, the empty string for anonymous peers, and an
/// error when no peer information exists at all.
fn authenticate<T>(request: &Request<T>) -> Result<String, Status> {
    if let Some(info) = request.extensions().get::<MuxConnectInfo>() {
        return Ok(info.subject.clone().unwrap_or_default());
    }
    if request.remote_addr().is_some() {
        // plain TCP transport, no certificate to name the peer
        return Ok(String::new());
    }
    Err(Status::unknown("could not find peer info"))
}

pub struct LogService<L> {
    log: Arc<L>,
    authorizer: Arc<Authorizer>,
    servers: Arc<dyn ServerProvider>,
}

impl<L: CommitLog> LogService<L> {
    pub fn new(log: Arc<L>, authorizer: Arc<Authorizer>, servers: Arc<dyn ServerProvider>) -> Self {
        Self {
            log,
            authorizer,
            servers,
        }
    }

    fn authorize(&self, subject: &str, action: &str) -> Result<(), Status> {
        self.authorizer
            .authorize(subject, OBJECT_WILDCARD, action)
            .map_err(IntoStatus::into_status)
    }
}

#[tonic::async_trait]
impl<L: CommitLog> log_server::Log for LogService<L> {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        let subject = authenticate(&request)?;
        self.authorize(&subject, PRODUCE_ACTION)?;

        let record = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("missing record"))?;

        let offset = self
            .log
            .append(record)
            .await
            .map_err(IntoStatus::into_status)?;

        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        let subject = authenticate(&request)?;
        self.authorize(&subject, CONSUME_ACTION)?;

        let offset = request.into_inner().offset;
        let log = self.log.clone();

        // storage reads block; keep them off the RPC worker
        let record = tokio::task::spawn_blocking(move || log.read(offset))
            .await
            .map_err(|e| Status::internal(format!("read task failed: {e}")))?
            .map_err(IntoStatus::into_status)?;

        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream =
        Pin<Box<dyn Stream<Item = Result<ProduceResponse, Status>> + Send + 'static>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        let subject = authenticate(&request)?;
        let authorizer = self.authorizer.clone();
        let log = self.log.clone();
        let mut inbound = request.into_inner();

        let stream = async_stream::try_stream! {
            while let Some(req) = inbound.message().await? {
                authorizer
                    .authorize(&subject, OBJECT_WILDCARD, PRODUCE_ACTION)
                    .map_err(IntoStatus::into_status)?;

                let record = req
                    .record
                    .ok_or_else(|| Status::invalid_argument("missing record"))?;
                let offset = log.append(record).await.map_err(IntoStatus::into_status)?;

                yield ProduceResponse { offset };
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    type ConsumeStreamStream =
        Pin<Box<dyn Stream<Item = Result<ConsumeResponse, Status>> + Send + 'static>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        let subject = authenticate(&request)?;
        self.authorize(&subject, CONSUME_ACTION)?;

        let log = self.log.clone();
        let mut offset = request.into_inner().offset;
        debug!(offset, "Starting consume stream");

        let stream = async_stream::try_stream! {
            loop {
                // grab the wakeup before reading so an append racing the
                // out-of-range result is not missed
                let notified = log.notified();

                match log.read(offset) {
                    Ok(record) => {
                        offset += 1;
                        yield ConsumeResponse { record: Some(record) };
                    }
                    Err(ServerError::Log(LogError::OffsetOutOfRange { .. })) => {
                        // not written yet; tail the log
                        tokio::select! {
                            _ = notified => {}
                            _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
                        }
                    }
                    Err(e) => {
                        Err(e.into_status())?;
                    }
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_servers(
        &self,
        request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        authenticate(&request)?;
        Ok(Response::new(GetServersResponse {
            servers: self.servers.get_servers(),
        }))
    }
}
