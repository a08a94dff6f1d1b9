//! Shared fixtures for integration tests: a throwaway CA with server and
//! client identities, and an ACL pair granting `root` everything and
//! `nobody` nothing.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use replog::config::TlsConfig;
use std::fs;
use std::path::{Path, PathBuf};

pub struct TestCerts {
    pub ca_file: PathBuf,
    pub server_cert_file: PathBuf,
    pub server_key_file: PathBuf,
    pub root_client_cert_file: PathBuf,
    pub root_client_key_file: PathBuf,
    pub nobody_client_cert_file: PathBuf,
    pub nobody_client_key_file: PathBuf,
}

impl TestCerts {
    /// Generates the CA and identities under `dir`. Every certificate
    /// covers `localhost` and `127.0.0.1`.
    pub fn generate(dir: &Path) -> Self {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut ca_params =
            CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "replog test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

        let (server_cert_file, server_key_file) = issue(
            dir,
            "server",
            &ca_cert,
            &ca_key,
            &[
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        );
        let (root_client_cert_file, root_client_key_file) = issue(
            dir,
            "root",
            &ca_cert,
            &ca_key,
            &[ExtendedKeyUsagePurpose::ClientAuth],
        );
        let (nobody_client_cert_file, nobody_client_key_file) = issue(
            dir,
            "nobody",
            &ca_cert,
            &ca_key,
            &[ExtendedKeyUsagePurpose::ClientAuth],
        );

        let ca_file = dir.join("ca.pem");
        fs::write(&ca_file, ca_cert.pem()).expect("write CA pem");

        Self {
            ca_file,
            server_cert_file,
            server_key_file,
            root_client_cert_file,
            root_client_key_file,
            nobody_client_cert_file,
            nobody_client_key_file,
        }
    }

    pub fn server_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_file: self.server_cert_file.clone(),
            key_file: self.server_key_file.clone(),
            ca_file: self.ca_file.clone(),
            server: true,
        }
    }

    /// Peer/client identity with full access.
    pub fn root_client_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_file: self.root_client_cert_file.clone(),
            key_file: self.root_client_key_file.clone(),
            ca_file: self.ca_file.clone(),
            server: false,
        }
    }

    /// Client identity the policy grants nothing.
    pub fn nobody_client_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_file: self.nobody_client_cert_file.clone(),
            key_file: self.nobody_client_key_file.clone(),
            ca_file: self.ca_file.clone(),
            server: false,
        }
    }
}

fn issue(
    dir: &Path,
    name: &str,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    ekus: &[ExtendedKeyUsagePurpose],
) -> (PathBuf, PathBuf) {
    let key = KeyPair::generate().expect("generate key");
    let mut params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = ekus.to_vec();
    let cert = params
        .signed_by(&key, ca_cert, ca_key)
        .expect("sign leaf certificate");

    let cert_file = dir.join(format!("{name}.pem"));
    let key_file = dir.join(format!("{name}-key.pem"));
    fs::write(&cert_file, cert.pem()).expect("write cert");
    fs::write(&key_file, key.serialize_pem()).expect("write key");
    (cert_file, key_file)
}

/// Writes an ACL model plus a policy that lets `root` produce and consume
/// and grants `nobody` nothing.
pub fn write_acl(dir: &Path) -> (PathBuf, PathBuf) {
    let model = dir.join("model.conf");
    let policy = dir.join("policy.csv");
    fs::write(
        &model,
        "[request_definition]\nr = sub, obj, act\n\n[policy_definition]\np = sub, obj, act\n",
    )
    .expect("write model");
    fs::write(&policy, "p, root, *, produce\np, root, *, consume\n").expect("write policy");
    (model, policy)
}

/// Ports that were free at pick time, found by binding and dropping.
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").expect("bind for port pick"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr").port())
        .collect()
}
