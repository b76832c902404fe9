use chrono::NaiveDateTime;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Admin decision on a pending or approved reservation, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    Complete,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Approve => "insert_approval",
            Decision::Reject => "insert_rejection",
            Decision::Complete => "insert_completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictTarget {
    Chair(Ulid),
    Space(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpace {
        id: Ulid,
        name: Option<String>,
    },
    InsertChair {
        id: Ulid,
        space_id: Ulid,
        name: Option<String>,
    },
    DeactivateResource {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        email: String,
        nickname: Option<String>,
    },
    DeactivateUser {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        user_email: String,
        resource_id: Ulid,
        start: DateTime,
        end: DateTime,
    },
    CancelReservation {
        id: Ulid,
    },
    TransitionReservation {
        id: Ulid,
        decision: Decision,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectUserReservations {
        user_email: String,
        status: ReservationStatus,
        after: Option<Ulid>,
        page_size: Option<usize>,
    },
    SelectConflicts {
        target: ConflictTarget,
        at: DateTime,
    },
    InsertCheckIn {
        id: Ulid,
        reservation_id: Ulid,
    },
    InsertWalkIn {
        id: Ulid,
        user_email: String,
        resource_id: Ulid,
        end: DateTime,
    },
    InsertCheckOut {
        id: Ulid,
    },
    ForceCheckOut {
        id: Ulid,
    },
    SelectOccupancy {
        id: Ulid,
    },
    SelectResources,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn require(table: &'static str, values: &[Expr], n: usize) -> Result<(), SqlError> {
    if values.len() < n {
        return Err(SqlError::WrongArity(table, n, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let optional = |i: usize| -> Result<Option<String>, SqlError> {
        values.get(i).map_or(Ok(None), parse_string_or_null)
    };

    match table.as_str() {
        "spaces" => {
            require("spaces", &values, 1)?;
            Ok(Command::InsertSpace {
                id: parse_ulid_expr(&values[0])?,
                name: optional(1)?,
            })
        }
        "chairs" => {
            require("chairs", &values, 2)?;
            Ok(Command::InsertChair {
                id: parse_ulid_expr(&values[0])?,
                space_id: parse_ulid_expr(&values[1])?,
                name: optional(2)?,
            })
        }
        "users" => {
            require("users", &values, 2)?;
            Ok(Command::InsertUser {
                id: parse_ulid_expr(&values[0])?,
                email: parse_string_expr(&values[1])?,
                nickname: optional(2)?,
            })
        }
        "reservations" => {
            require("reservations", &values, 5)?;
            Ok(Command::InsertReservation {
                id: parse_ulid_expr(&values[0])?,
                user_email: parse_string_expr(&values[1])?,
                resource_id: parse_ulid_expr(&values[2])?,
                start: parse_datetime_expr(&values[3])?,
                end: parse_datetime_expr(&values[4])?,
            })
        }
        "approvals" | "rejections" | "completions" => {
            require("decisions", &values, 1)?;
            let decision = match table.as_str() {
                "approvals" => Decision::Approve,
                "rejections" => Decision::Reject,
                _ => Decision::Complete,
            };
            Ok(Command::TransitionReservation {
                id: parse_ulid_expr(&values[0])?,
                decision,
            })
        }
        "check_ins" => {
            require("check_ins", &values, 2)?;
            Ok(Command::InsertCheckIn {
                id: parse_ulid_expr(&values[0])?,
                reservation_id: parse_ulid_expr(&values[1])?,
            })
        }
        "walk_ins" => {
            require("walk_ins", &values, 4)?;
            Ok(Command::InsertWalkIn {
                id: parse_ulid_expr(&values[0])?,
                user_email: parse_string_expr(&values[1])?,
                resource_id: parse_ulid_expr(&values[2])?,
                end: parse_datetime_expr(&values[3])?,
            })
        }
        "check_outs" => {
            require("check_outs", &values, 1)?;
            Ok(Command::InsertCheckOut {
                id: parse_ulid_expr(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "spaces" | "chairs" => Ok(Command::DeactivateResource { id }),
        "users" => Ok(Command::DeactivateUser { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        "occupancies" => Ok(Command::ForceCheckOut { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "reservations" => {
            if let Some(id) = filter("id") {
                return Ok(Command::SelectReservation {
                    id: parse_ulid_expr(id)?,
                });
            }
            let user_email = filter("user_email").ok_or(SqlError::MissingFilter("user_email"))?;
            let status = filter("status").ok_or(SqlError::MissingFilter("status"))?;
            Ok(Command::SelectUserReservations {
                user_email: parse_string_expr(user_email)?,
                status: parse_string_expr(status)?
                    .parse()
                    .map_err(SqlError::Parse)?,
                after: filter("after").map(parse_ulid_expr).transpose()?,
                page_size: filter("page_size").map(parse_usize_expr).transpose()?,
            })
        }
        "conflicts" => {
            let at = filter("at").ok_or(SqlError::MissingFilter("at"))?;
            let target = match (filter("chair_id"), filter("space_id")) {
                (Some(chair), None) => ConflictTarget::Chair(parse_ulid_expr(chair)?),
                (None, Some(space)) => ConflictTarget::Space(parse_ulid_expr(space)?),
                _ => return Err(SqlError::MissingFilter("chair_id or space_id")),
            };
            Ok(Command::SelectConflicts {
                target,
                at: parse_datetime_expr(at)?,
            })
        }
        "occupancies" => {
            let id = filter("id").ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::SelectOccupancy {
                id: parse_ulid_expr(id)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 AND ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

/// First row of `INSERT ... VALUES`. Multi-row inserts are rejected.
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad count: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_datetime(s: &str) -> Result<DateTime, SqlError> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
}

fn parse_datetime_expr(expr: &Expr) -> Result<DateTime, SqlError> {
    parse_datetime(&parse_string_expr(expr)?)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
