use anyhow::Context;
use clap::Parser;
use replog::agent::Agent;
use replog::config::{AgentConfig, TlsConfig};
use replog::storage;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A replicated, append-only commit log served over mutually
/// authenticated gRPC.
#[derive(Debug, Parser)]
#[command(name = "replog", version)]
struct Cli {
    /// Root directory for segments and consensus state
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Gossip membership bind address
    #[arg(long, default_value = "127.0.0.1:8401")]
    bind_addr: String,

    /// Port for the multiplexed RPC listener
    #[arg(long, default_value_t = 8400)]
    rpc_port: u16,

    /// Stable identifier in consensus and gossip; defaults to the host name
    #[arg(long)]
    node_name: Option<String>,

    /// Gossip seeds to join on boot (repeatable)
    #[arg(long = "start-join-addr")]
    start_join_addrs: Vec<String>,

    /// Form a single-node cluster on first boot
    #[arg(long)]
    bootstrap: bool,

    /// Store rollover threshold in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_store_bytes: u64,

    /// Index rollover threshold in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_index_bytes: u64,

    /// Server TLS certificate
    #[arg(long)]
    server_tls_cert_file: PathBuf,

    /// Server TLS private key
    #[arg(long)]
    server_tls_key_file: PathBuf,

    /// CA certificate that signs server and client certs
    #[arg(long)]
    ca_file: PathBuf,

    /// Certificate presented when dialing peers
    #[arg(long)]
    peer_tls_cert_file: PathBuf,

    /// Private key presented when dialing peers
    #[arg(long)]
    peer_tls_key_file: PathBuf,

    /// ACL model file
    #[arg(long)]
    acl_model_file: PathBuf,

    /// ACL policy CSV file
    #[arg(long)]
    acl_policy_file: PathBuf,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<AgentConfig> {
        let node_name = match self.node_name {
            Some(name) => name,
            None => hostname()?,
        };

        let mut storage_config = storage::Config::default();
        storage_config.segment.max_store_bytes = self.max_store_bytes;
        storage_config.segment.max_index_bytes = self.max_index_bytes;

        Ok(AgentConfig {
            data_dir: self.data_dir,
            bind_addr: self.bind_addr,
            rpc_port: self.rpc_port,
            node_name,
            start_join_addrs: self.start_join_addrs,
            bootstrap: self.bootstrap,
            storage: storage_config,
            server_tls: TlsConfig {
                cert_file: self.server_tls_cert_file,
                key_file: self.server_tls_key_file,
                ca_file: self.ca_file.clone(),
                server: true,
            },
            peer_tls: TlsConfig {
                cert_file: self.peer_tls_cert_file,
                key_file: self.peer_tls_key_file,
                ca_file: self.ca_file,
                server: false,
            },
            acl_model_file: self.acl_model_file,
            acl_policy_file: self.acl_policy_file,
        })
    }
}

fn hostname() -> anyhow::Result<String> {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .context("cannot derive a node name, pass --node-name")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config()?;
    let agent = Agent::new(config).await.context("failed to start agent")?;

    tokio::signal::ctrl_c().await.context("signal handling failed")?;
    info!("Shutting down");
    agent.shutdown().await?;

    Ok(())
}
