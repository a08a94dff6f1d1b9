//! The multiplexed listener. Every accepted connection completes the TLS
//! handshake first; the first application byte then routes the stream:
//! the consensus marker hands it to the raft transport, anything else is
//! replayed in front of the stream and handed to the gRPC server.

use crate::consensus::transport::{CONSENSUS_STREAM_BYTE, InboundStream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tonic::transport::server::Connected;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

/// Peer identity captured at accept time and exposed to RPC handlers.
#[derive(Debug, Clone)]
pub struct MuxConnectInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Common Name of the first verified client certificate; `None` for
    /// anonymous peers.
    pub subject: Option<String>,
}

/// A TLS stream headed for the gRPC server, with the sniffed first byte
/// replayed in front of it.
pub struct MuxStream {
    inner: InboundStream,
    replay: Option<u8>,
    info: MuxConnectInfo,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(byte) = self.replay.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connected for MuxStream {
    type ConnectInfo = MuxConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

/// Accepts connections until `shutdown` fires, demultiplexing each one to
/// the raft transport or the gRPC server.
pub fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    raft_conns: mpsc::Sender<InboundStream>,
    grpc_conns: mpsc::Sender<io::Result<MuxStream>>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(addr = ?listener.local_addr().ok(), "Multiplexed listener serving");
        loop {
            let (tcp, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let acceptor = acceptor.clone();
            let raft_conns = raft_conns.clone();
            let grpc_conns = grpc_conns.clone();
            tokio::spawn(async move {
                if let Err(e) = demux(tcp, remote_addr, acceptor, raft_conns, grpc_conns).await {
                    debug!(%remote_addr, error = %e, "Connection setup failed");
                }
            });
        }
        info!("Multiplexed listener stopped");
    })
}

async fn demux(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    raft_conns: mpsc::Sender<InboundStream>,
    grpc_conns: mpsc::Sender<io::Result<MuxStream>>,
) -> io::Result<()> {
    let mut tls = acceptor.accept(tcp).await?;

    // sniff the first application byte, after the handshake
    let mut first = [0u8; 1];
    tls.read_exact(&mut first).await?;

    if first[0] == CONSENSUS_STREAM_BYTE {
        let _ = raft_conns.send(tls).await;
        return Ok(());
    }

    let subject = peer_subject(&tls);
    let stream = MuxStream {
        inner: tls,
        replay: Some(first[0]),
        info: MuxConnectInfo {
            remote_addr: Some(remote_addr),
            subject,
        },
    };
    let _ = grpc_conns.send(Ok(stream)).await;
    Ok(())
}

/// Common Name of the first verified client certificate, if any.
fn peer_subject(tls: &InboundStream) -> Option<String> {
    let (_, session) = tls.get_ref();
    let der = session.peer_certificates()?.first()?;
    let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}
