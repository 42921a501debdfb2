use chrono::DateTime;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::SlotPatch;
use crate::model::*;

/// Which index a booking SELECT goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Owner(Ulid),
    Offer(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        offer_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectSlot {
        id: Ulid,
    },
    SelectSlots {
        offer_id: Ulid,
        from: Ms,
        to: Ms,
        only_available: bool,
    },
    UpdateSlot {
        id: Ulid,
        patch: SlotPatch,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertBooking {
        offer_id: Ulid,
        slot_id: Ulid,
        owner_id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertActivity {
        user_id: Ulid,
        title: String,
        message: String,
        kind: String,
    },
    SelectActivities {
        user_id: Ulid,
        limit: Option<usize>,
    },
}

const SLOT_COLUMNS: &[&str] = &["offer_id", "start_time", "end_time"];
const BOOKING_COLUMNS: &[&str] = &["offer_id", "slot_id", "owner_id"];
const ACTIVITY_COLUMNS: &[&str] = &["user_id", "title", "message", "type"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "slots" => {
            let v = insert_row(insert, "slots", SLOT_COLUMNS)?;
            Ok(Command::InsertSlot {
                offer_id: parse_id(&v[0])?,
                start: parse_timestamp(&v[1])?,
                end: parse_timestamp(&v[2])?,
            })
        }
        "bookings" => {
            let v = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                offer_id: parse_id(&v[0])?,
                slot_id: parse_id(&v[1])?,
                owner_id: parse_id(&v[2])?,
            })
        }
        "activities" => {
            let v = insert_row(insert, "activities", ACTIVITY_COLUMNS)?;
            Ok(Command::InsertActivity {
                user_id: parse_id(&v[0])?,
                title: parse_string(&v[1])?,
                message: parse_string(&v[2])?,
                kind: parse_string(&v[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// The single VALUES row, reordered to `expected` when a column list is given.
fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    expected: &[&'static str],
) -> Result<Vec<Expr>, SqlError> {
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    let row = &rows[0];
    if row.len() != expected.len() {
        return Err(SqlError::WrongArity(table, expected.len(), row.len()));
    }
    if insert.columns.is_empty() {
        return Ok(row.clone());
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
    }

    let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    for name in &names {
        if !expected.contains(&name.as_str()) {
            return Err(SqlError::UnknownColumn(name.clone()));
        }
    }
    expected
        .iter()
        .map(|col| {
            names
                .iter()
                .position(|n| n == col)
                .map(|i| row[i].clone())
                .ok_or(SqlError::MissingColumn(col))
        })
        .collect()
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "activities" => Err(SqlError::Unsupported(
            "activities are append-only".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "slots" {
        return Err(SqlError::Unsupported(format!("UPDATE on {table}")));
    }
    let id = extract_where_id(selection)?;

    let mut patch = SlotPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        match column.as_str() {
            "start_time" => patch.start = Some(parse_timestamp(&assignment.value)?),
            "end_time" => patch.end = Some(parse_timestamp(&assignment.value)?),
            "is_booked" => patch.is_booked = Some(parse_bool(&assignment.value)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateSlot { id, patch })
}

// ── SELECT ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    Lt,
}

struct Predicate {
    column: String,
    cmp: Cmp,
    value: Expr,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }

    match table.as_str() {
        "slots" => parse_slot_select(&preds),
        "bookings" => parse_booking_select(&preds),
        "activities" => parse_activity_select(&preds),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-tree of `column <op> value` comparisons.
fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::Lt => Cmp::Lt,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Predicate {
                column,
                cmp,
                value: (**right).clone(),
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

fn find<'a>(preds: &'a [Predicate], column: &str, cmp: Cmp) -> Option<&'a Expr> {
    preds
        .iter()
        .find(|p| p.column == column && p.cmp == cmp)
        .map(|p| &p.value)
}

fn check_known(preds: &[Predicate], known: &[(&str, Cmp)]) -> Result<(), SqlError> {
    for p in preds {
        if !known.iter().any(|(c, op)| *c == p.column && *op == p.cmp) {
            return Err(SqlError::Unsupported(format!("filter on {}", p.column)));
        }
    }
    Ok(())
}

fn parse_slot_select(preds: &[Predicate]) -> Result<Command, SqlError> {
    check_known(
        preds,
        &[
            ("id", Cmp::Eq),
            ("offer_id", Cmp::Eq),
            ("start_time", Cmp::GtEq),
            ("start_time", Cmp::Lt),
            ("is_booked", Cmp::Eq),
        ],
    )?;
    if let Some(id) = find(preds, "id", Cmp::Eq) {
        return Ok(Command::SelectSlot { id: parse_id(id)? });
    }

    let offer_id = find(preds, "offer_id", Cmp::Eq).ok_or(SqlError::MissingFilter("offer_id"))?;
    let from = find(preds, "start_time", Cmp::GtEq).ok_or(SqlError::MissingFilter("start_time >="))?;
    let to = find(preds, "start_time", Cmp::Lt).ok_or(SqlError::MissingFilter("start_time <"))?;
    let only_available = match find(preds, "is_booked", Cmp::Eq) {
        None => false,
        Some(v) => {
            if parse_bool(v)? {
                return Err(SqlError::Unsupported("is_booked = true filter".into()));
            }
            true
        }
    };
    Ok(Command::SelectSlots {
        offer_id: parse_id(offer_id)?,
        from: parse_timestamp(from)?,
        to: parse_timestamp(to)?,
        only_available,
    })
}

fn parse_booking_select(preds: &[Predicate]) -> Result<Command, SqlError> {
    check_known(
        preds,
        &[("id", Cmp::Eq), ("owner_id", Cmp::Eq), ("offer_id", Cmp::Eq)],
    )?;
    if preds.len() != 1 {
        return Err(SqlError::MissingFilter("exactly one of id, owner_id, offer_id"));
    }
    let p = &preds[0];
    let id = parse_id(&p.value)?;
    let filter = match p.column.as_str() {
        "id" => BookingFilter::Id(id),
        "owner_id" => BookingFilter::Owner(id),
        _ => BookingFilter::Offer(id),
    };
    Ok(Command::SelectBookings { filter })
}

fn parse_activity_select(preds: &[Predicate]) -> Result<Command, SqlError> {
    check_known(preds, &[("user_id", Cmp::Eq), ("limit", Cmp::Eq)])?;
    let user_id = find(preds, "user_id", Cmp::Eq).ok_or(SqlError::MissingFilter("user_id"))?;
    let limit = match find(preds, "limit", Cmp::Eq) {
        Some(v) => {
            let n = parse_i64(v)?;
            Some(usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad limit: {n}")))?)
        }
        None => None,
    };
    Ok(Command::SelectActivities {
        user_id: parse_id(user_id)?,
        limit,
    })
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_id(right),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// ULID or hyphenated UUID. Both name the same 128-bit id.
pub fn parse_id_str(s: &str) -> Result<Ulid, SqlError> {
    if let Ok(id) = Ulid::from_string(s) {
        return Ok(id);
    }
    uuid::Uuid::parse_str(s)
        .map(Ulid::from)
        .map_err(|_| SqlError::BadId(s.to_string()))
}

/// RFC 3339 timestamp or integer Unix milliseconds.
pub fn parse_timestamp_str(s: &str) -> Result<Ms, SqlError> {
    if let Ok(ms) = s.trim().parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| SqlError::BadTimestamp(s.to_string()))
}

fn parse_id(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => parse_id_str(s),
        Some(value) => Err(SqlError::Parse(format!("expected id string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_timestamp_str(s),
        _ => parse_i64(expr),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
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

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("malformed identifier: {0}")]
    BadId(String),
    #[error("malformed timestamp: {0}")]
    BadTimestamp(String),
}

impl SqlError {
    /// Bad ids and timestamps are invalid input, not broken SQL.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SqlError::BadId(_) | SqlError::BadTimestamp(_))
    }
}
