use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::engine::{LeaseFilter, PaymentFilter};
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Apartments,
    Tenants,
    Leases,
    Payments,
}

impl Table {
    fn from_name(name: &str) -> Result<Self, SqlError> {
        match name {
            "apartments" => Ok(Table::Apartments),
            "tenants" => Ok(Table::Tenants),
            "leases" => Ok(Table::Leases),
            "payments" => Ok(Table::Payments),
            _ => Err(SqlError::UnknownTable(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Apartments => "apartments",
            Table::Tenants => "tenants",
            Table::Leases => "leases",
            Table::Payments => "payments",
        }
    }

    /// Writable columns, in the order used when an INSERT has no column list.
    fn insert_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Apartments => &["name", "address"],
            Table::Tenants => &["name", "email"],
            Table::Leases => &["tenant_id", "apartment_id", "start", "end", "rent", "deposit"],
            Table::Payments => &["tenant_id", "payment_date", "amount"],
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertApartment(ApartmentInput),
    InsertTenant(TenantInput),
    InsertLease(LeaseInput),
    InsertPayment(PaymentInput),
    UpdateApartment { id: ApartmentId, patch: ApartmentPatch },
    UpdateTenant { id: TenantId, patch: TenantPatch },
    UpdateLease { id: LeaseId, patch: LeasePatch },
    UpdatePayment { id: PaymentId, patch: PaymentPatch },
    Delete { table: Table, id: i64 },
    SelectApartments { id: Option<ApartmentId> },
    SelectTenants { id: Option<TenantId> },
    SelectLeases { filter: LeaseFilter },
    SelectPayments { filter: PaymentFilter },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column/value pairs of one INSERT row or UPDATE SET list.
struct Row {
    table: Table,
    values: Vec<(String, Expr)>,
}

impl Row {
    fn take(&mut self, column: &str) -> Option<Expr> {
        let pos = self.values.iter().position(|(c, _)| c == column)?;
        Some(self.values.remove(pos).1)
    }

    fn require(&mut self, column: &'static str) -> Result<Expr, SqlError> {
        self.take(column)
            .ok_or(SqlError::MissingColumn(self.table.as_str(), column))
    }

    /// Fails on anything not consumed by `take`/`require`.
    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_iter().next() {
            Some((column, _)) => Err(SqlError::UnknownColumn(self.table.as_str(), column)),
            None => Ok(()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::from_name(&insert_table_name(insert)?)?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        table.insert_columns().iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table.as_str(), columns.len(), values.len()));
    }
    let mut row = Row {
        table,
        values: columns.into_iter().zip(values).collect(),
    };

    let cmd = match table {
        Table::Apartments => Command::InsertApartment(ApartmentInput {
            name: parse_string(&row.require("name")?)?,
            address: parse_string(&row.require("address")?)?,
        }),
        Table::Tenants => Command::InsertTenant(TenantInput {
            name: parse_string(&row.require("name")?)?,
            email: parse_string(&row.require("email")?)?,
        }),
        Table::Leases => Command::InsertLease(LeaseInput {
            tenant_id: parse_i64(&row.require("tenant_id")?)?,
            apartment_id: parse_i64(&row.require("apartment_id")?)?,
            start: parse_datetime(&row.require("start")?)?,
            end: match row.take("end") {
                Some(expr) => parse_datetime_or_null(&expr)?,
                None => None,
            },
            rent: parse_f64(&row.require("rent")?)?,
            deposit: parse_f64(&row.require("deposit")?)?,
        }),
        Table::Payments => Command::InsertPayment(PaymentInput {
            tenant_id: parse_i64(&row.require("tenant_id")?)?,
            payment_date: parse_datetime(&row.require("payment_date")?)?,
            amount: parse_f64(&row.require("amount")?)?,
        }),
    };
    row.finish()?;
    Ok(cmd)
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::from_name(&table_factor_name(relation)?)?;
    let id = extract_where_id(selection)?;

    let mut values = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        values.push((column, assignment.value.clone()));
    }
    let mut row = Row { table, values };

    let cmd = match table {
        Table::Apartments => Command::UpdateApartment {
            id,
            patch: ApartmentPatch {
                name: row.take("name").map(|e| parse_string(&e)).transpose()?,
                address: row.take("address").map(|e| parse_string(&e)).transpose()?,
            },
        },
        Table::Tenants => Command::UpdateTenant {
            id,
            patch: TenantPatch {
                name: row.take("name").map(|e| parse_string(&e)).transpose()?,
                email: row.take("email").map(|e| parse_string(&e)).transpose()?,
                is_rent_late: row.take("is_rent_late").map(|e| parse_bool(&e)).transpose()?,
            },
        },
        Table::Leases => Command::UpdateLease {
            id,
            patch: LeasePatch {
                tenant_id: row.take("tenant_id").map(|e| parse_i64(&e)).transpose()?,
                apartment_id: row.take("apartment_id").map(|e| parse_i64(&e)).transpose()?,
                start: row.take("start").map(|e| parse_datetime(&e)).transpose()?,
                end: row
                    .take("end")
                    .map(|e| parse_datetime_or_null(&e))
                    .transpose()?,
                rent: row.take("rent").map(|e| parse_f64(&e)).transpose()?,
                deposit: row.take("deposit").map(|e| parse_f64(&e)).transpose()?,
            },
        },
        Table::Payments => Command::UpdatePayment {
            id,
            patch: PaymentPatch {
                tenant_id: row.take("tenant_id").map(|e| parse_i64(&e)).transpose()?,
                payment_date: row
                    .take("payment_date")
                    .map(|e| parse_datetime(&e))
                    .transpose()?,
                amount: row.take("amount").map(|e| parse_f64(&e)).transpose()?,
            },
        },
    };
    row.finish()?;
    Ok(cmd)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::from_name(&delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::Delete { table, id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = Table::from_name(&table_factor_name(&select.from[0].relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut filters)?;
    }

    let mut id = None;
    let mut tenant_id = None;
    let mut apartment_id = None;
    for (column, value) in filters {
        match (table, column.as_str()) {
            (_, "id") => id = Some(value),
            (Table::Leases | Table::Payments, "tenant_id") => tenant_id = Some(value),
            (Table::Leases, "apartment_id") => apartment_id = Some(value),
            _ => return Err(SqlError::UnknownColumn(table.as_str(), column)),
        }
    }

    Ok(match table {
        Table::Apartments => Command::SelectApartments { id },
        Table::Tenants => Command::SelectTenants { id },
        Table::Leases => Command::SelectLeases {
            filter: LeaseFilter {
                id,
                tenant_id,
                apartment_id,
            },
        },
        Table::Payments => Command::SelectPayments {
            filter: PaymentFilter { id, tenant_id },
        },
    })
}

/// Collects `col = <integer>` terms joined by AND.
fn extract_eq_filters(expr: &Expr, out: &mut Vec<(String, i64)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_eq_filters(left, out)?;
            extract_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, parse_i64(right)?));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_i64(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal behind an expression, looking through parentheses and casts
/// such as `'2024-01-01'::date`.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => extract_value(inner),
        _ => None,
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected integer, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_datetime(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_timestamp(s),
        Some(value) => Err(SqlError::Parse(format!("expected date string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_datetime_or_null(expr: &Expr) -> Result<Option<NaiveDateTime>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_datetime(expr).map(Some),
    }
}

/// `YYYY-MM-DD`, optionally followed by a time of day (space or `T`
/// separated, seconds and fractions optional, trailing `Z` ignored).
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, SqlError> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    let s = s.trim().trim_end_matches('Z');
    for fmt in FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN))
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown or read-only column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
