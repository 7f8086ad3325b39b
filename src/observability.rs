use std::net::SocketAddr;

use crate::sql::{Command, Table};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "leasehold_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "leasehold_query_duration_seconds";

/// Counter: lease writes rejected by a business rule. Labels: reason.
pub const LEASE_VIOLATIONS_TOTAL: &str = "leasehold_lease_violations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "leasehold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "leasehold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "leasehold_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "leasehold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "leasehold_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "leasehold_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertApartment(_) => "insert_apartment",
        Command::InsertTenant(_) => "insert_tenant",
        Command::InsertLease(_) => "insert_lease",
        Command::InsertPayment(_) => "insert_payment",
        Command::UpdateApartment { .. } => "update_apartment",
        Command::UpdateTenant { .. } => "update_tenant",
        Command::UpdateLease { .. } => "update_lease",
        Command::UpdatePayment { .. } => "update_payment",
        Command::Delete { table, .. } => match table {
            Table::Apartments => "delete_apartment",
            Table::Tenants => "delete_tenant",
            Table::Leases => "delete_lease",
            Table::Payments => "delete_payment",
        },
        Command::SelectApartments { .. } => "select_apartments",
        Command::SelectTenants { .. } => "select_tenants",
        Command::SelectLeases { .. } => "select_leases",
        Command::SelectPayments { .. } => "select_payments",
    }
}
