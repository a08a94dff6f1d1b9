//! Agent configuration and mTLS material loading.

use crate::ConfigResult;
use crate::errors::ConfigError;
use crate::storage;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// Paths to one side's PEM material. `server` selects whether
/// [`TlsConfig::server_config`] requires and verifies client certificates
/// against the CA.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub server: bool,
}

impl TlsConfig {
    /// rustls server config with client-certificate verification.
    pub fn server_config(&self) -> ConfigResult<ServerConfig> {
        let certs = load_certs(&self.cert_file)?;
        let key = load_key(&self.key_file)?;
        let roots = load_roots(&self.ca_file)?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ConfigError::Tls {
                reason: e.to_string(),
            })?;

        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls {
                reason: e.to_string(),
            })?;
        // gRPC clients negotiate h2; consensus peers skip ALPN entirely
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(config)
    }

    /// rustls client config presenting our certificate, used for the
    /// consensus transport.
    pub fn client_config(&self) -> ConfigResult<ClientConfig> {
        let certs = load_certs(&self.cert_file)?;
        let key = load_key(&self.key_file)?;
        let roots = load_roots(&self.ca_file)?;

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ConfigError::Tls {
                reason: e.to_string(),
            })
    }

    /// tonic client TLS config, used for RPC channels.
    pub fn client_tls(&self) -> ConfigResult<ClientTlsConfig> {
        let cert = read(&self.cert_file)?;
        let key = read(&self.key_file)?;
        let ca = read(&self.ca_file)?;

        Ok(ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key)))
    }
}

fn read(path: &Path) -> ConfigResult<Vec<u8>> {
    fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_string_lossy().into_owned(),
        source,
    })
}

fn load_certs(path: &Path) -> ConfigResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_string_lossy().into_owned(),
        source,
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        })
}

fn load_key(path: &Path) -> ConfigResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_string_lossy().into_owned(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoPrivateKey {
            path: path.to_string_lossy().into_owned(),
        })
}

fn load_roots(path: &Path) -> ConfigResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| ConfigError::Tls {
            reason: e.to_string(),
        })?;
    }
    Ok(roots)
}

/// Everything an agent needs to run one node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root directory for segments and consensus state
    pub data_dir: PathBuf,
    /// Gossip membership bind address (host:port)
    pub bind_addr: String,
    /// Port for the multiplexed RPC listener, bound on the gossip host
    pub rpc_port: u16,
    /// Stable identifier in consensus and gossip
    pub node_name: String,
    /// Gossip seeds to join on boot
    pub start_join_addrs: Vec<String>,
    /// Form a single-node cluster on first boot
    pub bootstrap: bool,
    /// Segment limits for the data log
    pub storage: storage::Config,
    /// mTLS material served to clients and peers
    pub server_tls: TlsConfig,
    /// mTLS material presented when dialing peers
    pub peer_tls: TlsConfig,
    /// ACL model file (casbin-style, validated for presence)
    pub acl_model_file: PathBuf,
    /// ACL policy CSV
    pub acl_policy_file: PathBuf,
}

impl AgentConfig {
    /// The RPC address advertised to clients and peers: the gossip host
    /// paired with `rpc_port`.
    pub fn rpc_addr(&self) -> ConfigResult<String> {
        let (host, _) = self
            .bind_addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddr {
                addr: self.bind_addr.clone(),
            })?;
        Ok(format!("{host}:{}", self.rpc_port))
    }
}
