//! Direct mode against a live PostgreSQL with the extension installed.
//!
//! Run with `PGCOORD_TEST_CONN="host=... user=... dbname=postgres" cargo test -- --ignored`.

use pgcoord_core::catalog::DatabaseCatalog;
use pgcoord_core::direct::DirectClient;
use pgcoord_core::models::NodeRegistration;

fn connect() -> DirectClient {
    let conn = std::env::var("PGCOORD_TEST_CONN").expect("PGCOORD_TEST_CONN is not set");
    DirectClient::from_conn_string(&conn, "pgcoord").expect("direct connection failed")
}

#[test]
#[ignore = "integration test - needs PostgreSQL with the pgcoord extension"]
fn connect_reports_versions_and_worker_state() {
    let mut client = connect();
    assert!(client.is_connected());
    assert!(!client.server_version().is_empty());
    assert!(!client.extension_version().is_empty());

    let refreshed = client.refresh_background_worker().unwrap();
    assert_eq!(refreshed, client.background_worker_active());

    let health = client.health().unwrap();
    assert_eq!(health.extension_version, client.extension_version());
    assert!(!health.pg_version.is_empty());

    client.close();
    client.close();
    assert!(!client.is_connected());
    assert!(client.refresh_background_worker().is_err());
}

#[test]
#[ignore = "integration test - needs PostgreSQL with the pgcoord extension"]
fn register_heartbeat_and_read_status() {
    let mut client = connect();
    let registration = NodeRegistration {
        node_id: "direct-it-1".to_string(),
        node_name: "direct one".to_string(),
        host: "10.0.0.9".to_string(),
        port: 5432,
        priority: 42,
    };
    let record = client.register_node(&registration).unwrap();
    assert_eq!(record.node_id, "direct-it-1");
    assert_eq!(record.priority, 42);

    client.heartbeat("direct-it-1").unwrap();
    let rows = client.node_status(Some("direct-it-1")).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].last_heartbeat.is_some());

    assert!(client.heartbeat("direct-it-missing").unwrap_err().is_not_found());
    assert!(client.node_status(Some("direct-it-missing")).unwrap().is_empty());
}

#[test]
#[ignore = "integration test - needs PostgreSQL with the pgcoord extension"]
fn database_listing_decodes() {
    let mut client = connect();
    let rows = client.list_databases().unwrap();
    let enabled = client.enabled_databases().unwrap();
    let expected: Vec<&str> = rows
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.datname.as_str())
        .collect();
    assert_eq!(enabled.is_some(), !expected.is_empty());
}
