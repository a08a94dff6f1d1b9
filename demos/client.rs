//! Produce and consume against a running cluster:
//!
//! ```text
//! cargo run --example client -- <seed-addr> <ca.pem> <client.pem> <client-key.pem>
//! ```

use replog::client::ClusterClient;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(seed_addr), Some(ca), Some(cert), Some(key)) =
        (args.next(), args.next(), args.next(), args.next())
    else {
        eprintln!("usage: client <seed-addr> <ca.pem> <client.pem> <client-key.pem>");
        std::process::exit(2);
    };

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(std::fs::read(ca)?))
        .identity(Identity::from_pem(std::fs::read(cert)?, std::fs::read(key)?));

    let client = ClusterClient::connect(&seed_addr, tls).await?;
    println!("connected via {seed_addr}");

    println!("\ncluster members:");
    for server in client.get_servers().await? {
        let role = if server.is_leader { "leader" } else { "follower" };
        println!("  {} @ {} ({role})", server.id, server.rpc_addr);
    }

    println!("\nproducing records...");
    let records = ["first record", "second record", "third record"];
    let mut offsets = Vec::new();
    for value in records {
        let offset = client.produce(value.as_bytes().to_vec()).await?;
        println!("  '{value}' -> offset {offset}");
        offsets.push(offset);
    }

    // reads go to followers, which may lag the leader briefly
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    println!("\nconsuming them back...");
    for offset in offsets {
        let record = client.consume(offset).await?;
        println!("  offset {offset} -> '{}'", String::from_utf8_lossy(&record.value));
    }

    Ok(())
}
