//! Consensus traffic over the shared RPC listener. Outbound streams dial
//! the peer's multiplexed port, complete the TLS handshake, and announce
//! themselves with the consensus marker byte; inbound streams arrive from
//! the listener's demultiplexer with the marker already consumed.

use crate::ConsensusResult;
use crate::consensus::node::Raft;
use crate::consensus::rpc::{RaftRequest, RaftResponse, read_frame, write_frame};
use crate::errors::ConsensusError;
use rustls_pki_types::ServerName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// First byte of a consensus stream on the multiplexed listener. Any
/// other first byte is an RPC stream.
pub const CONSENSUS_STREAM_BYTE: u8 = 0x01;

pub type InboundStream = tokio_rustls::server::TlsStream<TcpStream>;
type OutboundStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Dials peers and issues request/response exchanges, keeping one idle
/// connection per peer.
pub struct RaftClient {
    connector: TlsConnector,
    idle: Mutex<HashMap<String, OutboundStream>>,
}

impl RaftClient {
    pub fn new(tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(tls),
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Sends one request to `addr` and awaits its response. A connection
    /// that fails mid-exchange is dropped; the next send redials.
    pub async fn send(&self, addr: &str, req: &RaftRequest) -> ConsensusResult<RaftResponse> {
        let mut conn = match self.idle.lock().await.remove(addr) {
            Some(conn) => conn,
            None => self.dial(addr).await?,
        };

        let exchange = async {
            write_frame(&mut conn, req).await?;
            read_frame::<_, RaftResponse>(&mut conn).await
        };

        match exchange.await {
            Ok(resp) => {
                self.idle.lock().await.insert(addr.to_string(), conn);
                Ok(resp)
            }
            Err(e) => {
                debug!(addr, error = %e, "Dropping consensus connection");
                Err(e)
            }
        }
    }

    async fn dial(&self, addr: &str) -> ConsensusResult<OutboundStream> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| ConsensusError::Transport { source })?;

        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| ConsensusError::Frame {
                reason: format!("invalid peer host name: {host}"),
            })?;

        let mut conn = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| ConsensusError::Transport { source })?;

        conn.write_all(&[CONSENSUS_STREAM_BYTE])
            .await
            .map_err(|source| ConsensusError::Transport { source })?;

        debug!(addr, "Consensus connection established");
        Ok(conn)
    }
}

/// Serves inbound consensus streams, dispatching each frame to the raft
/// node until the peer hangs up.
pub fn serve_inbound(mut incoming: mpsc::Receiver<InboundStream>, raft: Raft) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut conn) = incoming.recv().await {
            let raft = raft.clone();
            tokio::spawn(async move {
                loop {
                    let req = match read_frame::<_, RaftRequest>(&mut conn).await {
                        Ok(req) => req,
                        Err(ConsensusError::Transport { .. }) => break,
                        Err(e) => {
                            warn!(error = %e, "Bad consensus frame, closing stream");
                            break;
                        }
                    };

                    let resp = match raft.handle_request(req).await {
                        Ok(resp) => resp,
                        // node is shutting down, stop serving
                        Err(_) => break,
                    };

                    if write_frame(&mut conn, &resp).await.is_err() {
                        break;
                    }
                }
            });
        }
    })
}
