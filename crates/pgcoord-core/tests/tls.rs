//! RPC over TLS and mutual TLS, with certificates issued by a throwaway CA.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};

use pgcoord_core::catalog::MemoryCatalog;
use pgcoord_core::config::TlsConfig;
use pgcoord_core::rpc::{RpcClient, RpcClientConfig};
use pgcoord_core::{Config, Daemon};

struct Pki {
    dir: tempfile::TempDir,
    ca: PathBuf,
    server_cert: PathBuf,
    server_key: PathBuf,
    client_cert: PathBuf,
    client_key: PathBuf,
}

fn write(dir: &Path, name: &str, pem: String) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, pem).unwrap();
    path
}

fn leaf(
    name: &str,
    sans: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(sans).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    (cert, key)
}

impl Pki {
    fn issue() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "pgcoord test ca");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let (server, server_key) = leaf(
            "pgcoordd",
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
            ExtendedKeyUsagePurpose::ServerAuth,
            &ca,
            &ca_key,
        );
        let (client, client_key) = leaf(
            "operator",
            vec!["operator".to_string()],
            ExtendedKeyUsagePurpose::ClientAuth,
            &ca,
            &ca_key,
        );

        let path = dir.path();
        Self {
            ca: write(path, "ca.crt", ca.pem()),
            server_cert: write(path, "server.crt", server.pem()),
            server_key: write(path, "server.key", server_key.serialize_pem()),
            client_cert: write(path, "client.crt", client.pem()),
            client_key: write(path, "client.key", client_key.serialize_pem()),
            dir,
        }
    }
}

async fn start_daemon(pki: &Pki, verify_clients: bool) -> Daemon {
    let mut config = Config::default();
    config.node.node_id = "n1".to_string();
    config.node.node_name = "node one".to_string();
    config.rpc.listen = "127.0.0.1:0".to_string();
    config.ipc.path = pki.dir.path().join("pgcoord.sock");
    config.rpc.tls = TlsConfig {
        cert_file: Some(pki.server_cert.clone()),
        key_file: Some(pki.server_key.clone()),
        ca_file: verify_clients.then(|| pki.ca.clone()),
    };

    let mut daemon = Daemon::new(config, Arc::new(MemoryCatalog::default())).unwrap();
    daemon.start().await.unwrap();
    assert!(daemon.status().rpc.tls);
    daemon
}

fn client_config(daemon: &Daemon, pki: &Pki) -> RpcClientConfig {
    let mut config = RpcClientConfig::new(daemon.rpc_addr().unwrap().to_string());
    config.ca_file = Some(pki.ca.clone());
    config
}

#[tokio::test]
async fn health_check_over_tls() {
    let pki = Pki::issue();
    let mut daemon = start_daemon(&pki, false).await;

    let client = RpcClient::connect(&client_config(&daemon, &pki)).unwrap();
    assert!(client.base_url().starts_with("https://"));
    let response = client.health_check().await.unwrap();
    assert_eq!(response.node_id, "n1");

    // Plain HTTP against the TLS listener must not succeed.
    let plain = RpcClient::connect(&RpcClientConfig::new(format!(
        "http://{}",
        daemon.rpc_addr().unwrap()
    )))
    .unwrap();
    assert!(plain.health_check().await.is_err());

    daemon.stop().await;
}

#[tokio::test]
async fn untrusted_server_certificate_is_rejected() {
    let pki = Pki::issue();
    let other = Pki::issue();
    let mut daemon = start_daemon(&pki, false).await;

    let client = RpcClient::connect(&client_config(&daemon, &other)).unwrap();
    assert!(client.health_check().await.is_err());

    daemon.stop().await;
}

#[tokio::test]
async fn mtls_requires_a_client_certificate() {
    let pki = Pki::issue();
    let mut daemon = start_daemon(&pki, true).await;

    let anonymous = RpcClient::connect(&client_config(&daemon, &pki)).unwrap();
    assert!(anonymous.health_check().await.is_err());

    let mut config = client_config(&daemon, &pki);
    config.cert_file = Some(pki.client_cert.clone());
    config.key_file = Some(pki.client_key.clone());
    let authenticated = RpcClient::connect(&config).unwrap();
    assert_eq!(authenticated.get_nodes().await.unwrap().len(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn mtls_rejects_a_certificate_from_another_ca() {
    let pki = Pki::issue();
    let other = Pki::issue();
    let mut daemon = start_daemon(&pki, true).await;

    let mut config = client_config(&daemon, &pki);
    config.cert_file = Some(other.client_cert.clone());
    config.key_file = Some(other.client_key.clone());
    let stranger = RpcClient::connect(&config).unwrap();
    assert!(stranger.health_check().await.is_err());

    daemon.stop().await;
}
