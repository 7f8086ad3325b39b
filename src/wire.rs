use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError, LeaseDetails, ViolationClass};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError, Table};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user.
#[derive(Debug)]
pub struct PasswordSource {
    password: String,
}

impl PasswordSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Schemas ──────────────────────────────────────────────────────

fn table_schema(table: Table, format: &Format) -> Vec<FieldInfo> {
    let columns: &[(&str, Type)] = match table {
        Table::Apartments => &[
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("address", Type::VARCHAR),
            ("created_at", Type::VARCHAR),
            ("updated_at", Type::VARCHAR),
        ],
        Table::Tenants => &[
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("is_rent_late", Type::BOOL),
            ("created_at", Type::VARCHAR),
            ("updated_at", Type::VARCHAR),
        ],
        Table::Leases => &[
            ("id", Type::INT8),
            ("tenant_id", Type::INT8),
            ("apartment_id", Type::INT8),
            ("start", Type::VARCHAR),
            ("end", Type::VARCHAR),
            ("rent", Type::FLOAT8),
            ("deposit", Type::FLOAT8),
            ("tenant_name", Type::VARCHAR),
            ("apartment_name", Type::VARCHAR),
            ("created_at", Type::VARCHAR),
            ("updated_at", Type::VARCHAR),
        ],
        Table::Payments => &[
            ("id", Type::INT8),
            ("tenant_id", Type::INT8),
            ("payment_date", Type::VARCHAR),
            ("amount", Type::FLOAT8),
            ("created_at", Type::VARCHAR),
            ("updated_at", Type::VARCHAR),
        ],
    };
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

/// Table a statement reads or writes, found by the word after INTO/FROM/UPDATE.
/// Used to describe statements whose `$n` placeholders are not bound yet.
fn statement_table(sql: &str) -> Option<Table> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    words.windows(2).find_map(|pair| match pair {
        ["into" | "from" | "update", name] => match *name {
            "apartments" => Some(Table::Apartments),
            "tenants" => Some(Table::Tenants),
            "leases" => Some(Table::Leases),
            "payments" => Some(Table::Payments),
            _ => None,
        },
        _ => None,
    })
}

fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    statement_table(sql).map_or_else(Vec::new, |table| table_schema(table, format))
}

// ── Row encoding ─────────────────────────────────────────────────

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_apartment(e: &mut DataRowEncoder, a: Apartment) -> PgWireResult<()> {
    e.encode_field(&a.id)?;
    e.encode_field(&a.name)?;
    e.encode_field(&a.address)?;
    e.encode_field(&timestamp(a.created_at))?;
    e.encode_field(&timestamp(a.updated_at))
}

fn encode_tenant(e: &mut DataRowEncoder, t: Tenant) -> PgWireResult<()> {
    e.encode_field(&t.id)?;
    e.encode_field(&t.name)?;
    e.encode_field(&t.email)?;
    e.encode_field(&t.is_rent_late)?;
    e.encode_field(&timestamp(t.created_at))?;
    e.encode_field(&timestamp(t.updated_at))
}

fn encode_payment(e: &mut DataRowEncoder, p: Payment) -> PgWireResult<()> {
    e.encode_field(&p.id)?;
    e.encode_field(&p.tenant_id)?;
    e.encode_field(&timestamp(p.payment_date))?;
    e.encode_field(&p.amount)?;
    e.encode_field(&timestamp(p.created_at))?;
    e.encode_field(&timestamp(p.updated_at))
}

fn encode_lease(e: &mut DataRowEncoder, mut details: LeaseDetails, store: &crate::engine::Store) -> PgWireResult<()> {
    let tenant_name = details.tenant(store).map(|t| t.name.clone());
    let apartment_name = details.apartment(store).map(|a| a.name.clone());
    let lease = &details.lease;
    e.encode_field(&lease.id)?;
    e.encode_field(&lease.tenant_id)?;
    e.encode_field(&lease.apartment_id)?;
    e.encode_field(&timestamp(lease.occupancy.start))?;
    e.encode_field(&lease.occupancy.end.map(timestamp))?;
    e.encode_field(&lease.rent)?;
    e.encode_field(&lease.deposit)?;
    e.encode_field(&tenant_name)?;
    e.encode_field(&apartment_name)?;
    e.encode_field(&timestamp(lease.created_at))?;
    e.encode_field(&timestamp(lease.updated_at))
}

// ── Handler ──────────────────────────────────────────────────────

pub struct LeaseholdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LeaseholdQueryParser>,
}

impl LeaseholdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LeaseholdQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        let apartments = |rows: Vec<Apartment>| {
            rows_response(table_schema(Table::Apartments, format), rows, encode_apartment)
        };
        let tenants =
            |rows: Vec<Tenant>| rows_response(table_schema(Table::Tenants, format), rows, encode_tenant);
        let payments = |rows: Vec<Payment>| {
            rows_response(table_schema(Table::Payments, format), rows, encode_payment)
        };
        let leases = |rows: Vec<LeaseDetails>| {
            rows_response(table_schema(Table::Leases, format), rows, |e, d| {
                encode_lease(e, d, &engine.store)
            })
        };

        let response = match cmd {
            Command::InsertApartment(input) => {
                apartments(vec![engine.create_apartment(input).await.map_err(engine_err)?])
            }
            Command::InsertTenant(input) => {
                tenants(vec![engine.create_tenant(input).await.map_err(engine_err)?])
            }
            Command::InsertLease(input) => {
                let lease = engine.create_lease(input).await.map_err(engine_err)?;
                leases(vec![LeaseDetails::new(lease)])
            }
            Command::InsertPayment(input) => {
                payments(vec![engine.create_payment(input).await.map_err(engine_err)?])
            }
            Command::UpdateApartment { id, patch } => {
                apartments(vec![engine.update_apartment(id, patch).await.map_err(engine_err)?])
            }
            Command::UpdateTenant { id, patch } => {
                tenants(vec![engine.update_tenant(id, patch).await.map_err(engine_err)?])
            }
            Command::UpdateLease { id, patch } => {
                let lease = engine.update_lease(id, patch).await.map_err(engine_err)?;
                leases(vec![LeaseDetails::new(lease)])
            }
            Command::UpdatePayment { id, patch } => {
                payments(vec![engine.update_payment(id, patch).await.map_err(engine_err)?])
            }
            Command::Delete { table, id } => match table {
                Table::Apartments => {
                    apartments(vec![engine.delete_apartment(id).await.map_err(engine_err)?])
                }
                Table::Tenants => tenants(vec![engine.delete_tenant(id).await.map_err(engine_err)?]),
                Table::Leases => {
                    let lease = engine.delete_lease(id).await.map_err(engine_err)?;
                    leases(vec![LeaseDetails::new(lease)])
                }
                Table::Payments => {
                    payments(vec![engine.delete_payment(id).await.map_err(engine_err)?])
                }
            },
            Command::SelectApartments { id } => apartments(engine.list_apartments(id)),
            Command::SelectTenants { id } => tenants(engine.list_tenants(id)),
            Command::SelectLeases { filter } => leases(engine.list_leases(filter).await),
            Command::SelectPayments { filter } => payments(engine.list_payments(filter)),
        };
        Ok(response)
    }
}

#[async_trait]
impl SimpleQueryHandler for LeaseholdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LeaseholdQueryParser;

#[async_trait]
impl QueryParser for LeaseholdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LeaseholdHandler {
    type Statement = String;
    type QueryParser = LeaseholdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute `$N` placeholders with bound text-format values as quoted
/// literals. Single pass over `sql`, so text inside a substituted value is
/// never expanded again. Placeholders without a bound value are kept as is.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            result.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LeaseholdFactory {
    handler: Arc<LeaseholdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LeaseholdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(LeaseholdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LeaseholdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(LeaseholdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rule(v) => match v.class() {
            ViolationClass::Structural => "23514",
            ViolationClass::Conflict => "23P01",
            ViolationClass::NotFound => "P0002",
        },
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::InUse { .. } => "23503",
        EngineError::NoLeases(_) => "P0001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("write failed: {msg}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
