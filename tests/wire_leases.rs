use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use leasehold::engine::{Engine, LeasePolicy};
use leasehold::wire;

// ── Test infrastructure ──────────────────────────────────────

static SERVER_SEQ: AtomicUsize = AtomicUsize::new(0);

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!(
        "leasehold_int_test_{}_{}",
        std::process::id(),
        SERVER_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("leasehold.wal"), LeasePolicy::default()).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "leasehold".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("leasehold")
        .user("leasehold")
        .password("leasehold");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn single(client: &Client, sql: &str) -> SimpleQueryRow {
    let mut found = rows(client, sql).await;
    assert_eq!(found.len(), 1, "expected one row from {sql}");
    found.remove(0)
}

/// Seed one apartment and one tenant; returns their ids.
async fn seed(client: &Client) -> (String, String) {
    let apartment = single(
        client,
        "INSERT INTO apartments (name, address) VALUES ('Unit 1', '1 Main St')",
    )
    .await;
    let tenant = single(
        client,
        "INSERT INTO tenants (name, email) VALUES ('Alice', 'alice@example.com')",
    )
    .await;
    (
        apartment.get("id").unwrap().to_string(),
        tenant.get("id").unwrap().to_string(),
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_returns_the_stored_row() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (apartment_id, tenant_id) = seed(&client).await;

    let lease = single(
        &client,
        &format!(
            r#"INSERT INTO leases (tenant_id, apartment_id, start, "end", rent, deposit)
               VALUES ({tenant_id}, {apartment_id}, '2024-01-01 15:30', '2024-06-30', 1200, 2400)"#
        ),
    )
    .await;

    assert_eq!(lease.get("tenant_id"), Some(tenant_id.as_str()));
    assert_eq!(lease.get("start"), Some("2024-01-01 00:00:00.000"));
    assert_eq!(lease.get("end"), Some("2024-06-30 23:59:59.999"));
    assert_eq!(lease.get("tenant_name"), Some("Alice"));
    assert_eq!(lease.get("apartment_name"), Some("Unit 1"));
}

#[tokio::test]
async fn overlapping_lease_is_rejected_with_code() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (apartment_id, tenant_id) = seed(&client).await;
    let other_apartment = single(
        &client,
        "INSERT INTO apartments (name, address) VALUES ('Unit 2', '2 Main St')",
    )
    .await;
    let other_apartment = other_apartment.get("id").unwrap().to_string();

    client
        .simple_query(&format!(
            "INSERT INTO leases VALUES ({tenant_id}, {apartment_id}, '2024-01-01', '2024-12-31', 1000, 1000)"
        ))
        .await
        .unwrap();

    let err = client
        .simple_query(&format!(
            "INSERT INTO leases VALUES ({tenant_id}, {other_apartment}, '2024-12-31', NULL, 900, 900)"
        ))
        .await
        .unwrap_err();
    let db = err.as_db_error().expect("database error");
    assert_eq!(db.code(), &SqlState::EXCLUSION_VIOLATION);
    assert!(db.message().starts_with("USER_OVERLAP: "), "{}", db.message());

    assert_eq!(engine.list_leases(Default::default()).await.len(), 1);
}

#[tokio::test]
async fn structural_errors_use_check_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (apartment_id, tenant_id) = seed(&client).await;

    let err = client
        .simple_query(&format!(
            "INSERT INTO leases VALUES ({tenant_id}, {apartment_id}, '2024-05-01', '2024-04-30', 1, 1)"
        ))
        .await
        .unwrap_err();
    let db = err.as_db_error().expect("database error");
    assert_eq!(db.code(), &SqlState::CHECK_VIOLATION);
    assert!(db.message().starts_with("END_BEFORE_START: "), "{}", db.message());

    let err = client
        .simple_query(&format!(
            "INSERT INTO leases VALUES (999, {apartment_id}, '2024-05-01', NULL, 1, 1)"
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().starts_with("INVALID_ID: "));
}

#[tokio::test]
async fn select_leases_filters_and_joins_names() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (apartment_id, tenant_id) = seed(&client).await;
    rows(
        &client,
        &format!("INSERT INTO leases VALUES ({tenant_id}, {apartment_id}, '2023-01-01', '2023-12-31', 800, 800)"),
    )
    .await;
    rows(
        &client,
        &format!("INSERT INTO leases VALUES ({tenant_id}, {apartment_id}, '2024-01-01', NULL, 850, 800)"),
    )
    .await;

    let all = rows(&client, "SELECT * FROM leases").await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.get("tenant_name") == Some("Alice")));
    assert_eq!(all[1].get("end"), None);

    let by_both = rows(
        &client,
        &format!("SELECT * FROM leases WHERE tenant_id = {tenant_id} AND apartment_id = {apartment_id}"),
    )
    .await;
    assert_eq!(by_both.len(), 2);
    assert!(rows(&client, "SELECT * FROM leases WHERE tenant_id = 999").await.is_empty());
}

#[tokio::test]
async fn extended_query_with_text_params() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (apartment_id, tenant_id) = seed(&client).await;

    let inserted = client
        .query(
            "INSERT INTO leases VALUES ($1, $2, $3, NULL, 1100, 1100)",
            &[&tenant_id, &apartment_id, &"2024-03-01"],
        )
        .await
        .unwrap();
    assert_eq!(inserted.len(), 1);

    let found = client
        .query("SELECT * FROM leases WHERE tenant_id = $1", &[&tenant_id])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let name: String = found[0].get("tenant_name");
    assert_eq!(name, "Alice");
    let id: i64 = found[0].get("id");
    assert_eq!(id, 1);
}

#[tokio::test]
async fn delete_in_use_apartment_fails() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (apartment_id, tenant_id) = seed(&client).await;
    rows(
        &client,
        &format!("INSERT INTO leases VALUES ({tenant_id}, {apartment_id}, '2024-01-01', NULL, 1, 1)"),
    )
    .await;

    let err = client
        .simple_query(&format!("DELETE FROM apartments WHERE id = {apartment_id}"))
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code(), &SqlState::FOREIGN_KEY_VIOLATION);

    let deleted = single(&client, "DELETE FROM leases WHERE id = 1").await;
    assert_eq!(deleted.get("id"), Some("1"));
    let deleted = single(&client, &format!("DELETE FROM apartments WHERE id = {apartment_id}")).await;
    assert_eq!(deleted.get("name"), Some("Unit 1"));
}
