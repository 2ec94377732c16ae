use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which reservations a `SELECT ... FROM reservations` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    ById(Ulid),
    ByCar(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCar {
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
    },
    /// `None` fields keep their current value.
    UpdateCar {
        id: Ulid,
        name: Option<String>,
        daily_rate: Option<Money>,
    },
    DeleteCar {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        car_id: Ulid,
        owner_id: Ulid,
        range: DateRange,
    },
    RescheduleReservation {
        id: Ulid,
        range: DateRange,
    },
    CancelReservation {
        id: Ulid,
    },
    /// Charge the quoted extra amount, then commit.
    PayReschedule {
        pending: PendingReschedule,
    },
    /// Commit a quote whose payment was settled elsewhere.
    ConfirmReschedule {
        pending: PendingReschedule,
    },
    SelectCars,
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectAvailability {
        car_id: Ulid,
        start: Day,
        end: Day,
        min_days: Option<i64>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
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

// ── INSERT ────────────────────────────────────────────────────

/// Values of one INSERT row, looked up by column name. Without a column list
/// the table's declared order applies.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        declared: &[&str],
        insert: &ast::Insert,
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &'static str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const CAR_COLUMNS: &[&str] = &["id", "name", "daily_rate"];
const RESERVATION_COLUMNS: &[&str] = &["id", "car_id", "owner_id", "start", "end"];
const PENDING_COLUMNS: &[&str] = &["reservation_id", "start", "end", "extra_amount", "version"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_single_row(insert)?;

    match table.as_str() {
        "cars" => {
            let row = Row::new("cars", CAR_COLUMNS, insert, values)?;
            Ok(Command::InsertCar {
                id: parse_ulid(row.require("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
                daily_rate: parse_i64(row.require("daily_rate")?)?,
            })
        }
        "reservations" => {
            let row = Row::new("reservations", RESERVATION_COLUMNS, insert, values)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.require("id")?)?,
                car_id: parse_ulid(row.require("car_id")?)?,
                owner_id: parse_ulid(row.require("owner_id")?)?,
                range: DateRange::new(
                    parse_date(row.require("start")?)?,
                    parse_date(row.require("end")?)?,
                ),
            })
        }
        "reschedule_payments" | "reschedule_confirmations" => {
            let row = Row::new("reschedule", PENDING_COLUMNS, insert, values)?;
            let version = parse_i64(row.require("version")?)?;
            let pending = PendingReschedule {
                reservation_id: parse_ulid(row.require("reservation_id")?)?,
                new_range: DateRange::new(
                    parse_date(row.require("start")?)?,
                    parse_date(row.require("end")?)?,
                ),
                extra_amount: parse_i64(row.require("extra_amount")?)?,
                version: u64::try_from(version)
                    .map_err(|_| SqlError::Parse(format!("bad version: {version}")))?,
            };
            if table == "reschedule_payments" {
                Ok(Command::PayReschedule { pending })
            } else {
                Ok(Command::ConfirmReschedule { pending })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column".into()))?;
        set.push((column, &a.value));
    }
    let find = |column: &str| set.iter().find(|(c, _)| c == column).map(|(_, e)| *e);

    match table.as_str() {
        "cars" => {
            if let Some((unknown, _)) = set.iter().find(|(c, _)| c != "name" && c != "daily_rate") {
                return Err(SqlError::UnknownColumn(unknown.clone()));
            }
            let name = find("name").map(parse_string_or_null).transpose()?.flatten();
            let daily_rate = find("daily_rate").map(parse_i64).transpose()?;
            if name.is_none() && daily_rate.is_none() {
                return Err(SqlError::MissingColumn("cars", "daily_rate"));
            }
            Ok(Command::UpdateCar { id, name, daily_rate })
        }
        "reservations" => {
            if let Some(status) = find("status") {
                let status = parse_string(status)?;
                if set.len() != 1 || !status.eq_ignore_ascii_case(ReservationStatus::Cancelled.as_str()) {
                    return Err(SqlError::Unsupported(
                        "status can only be set to 'cancelled', on its own".into(),
                    ));
                }
                return Ok(Command::CancelReservation { id });
            }
            if let Some((unknown, _)) = set.iter().find(|(c, _)| c != "start" && c != "end") {
                return Err(SqlError::UnknownColumn(unknown.clone()));
            }
            let start = find("start").ok_or(SqlError::MissingColumn("reservations", "start"))?;
            let end = find("end").ok_or(SqlError::MissingColumn("reservations", "end"))?;
            Ok(Command::RescheduleReservation {
                id,
                range: DateRange::new(parse_date(start)?, parse_date(end)?),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "cars" => Ok(Command::DeleteCar { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

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
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "cars" => Ok(Command::SelectCars),
        "reservations" => {
            let filter = match filters.as_slice() {
                [] => ReservationFilter::All,
                [(col, ast::BinaryOperator::Eq, value)] if col == "id" => {
                    ReservationFilter::ById(parse_ulid(value)?)
                }
                [(col, ast::BinaryOperator::Eq, value)] if col == "car_id" => {
                    ReservationFilter::ByCar(parse_ulid(value)?)
                }
                _ => {
                    return Err(SqlError::Unsupported(
                        "reservations can be filtered by id or car_id only".into(),
                    ));
                }
            };
            Ok(Command::SelectReservations { filter })
        }
        "availability" => {
            let (mut car_id, mut start, mut end, mut min_days) = (None, None, None, None);
            for (col, op, value) in &filters {
                match (col.as_str(), op) {
                    ("car_id", ast::BinaryOperator::Eq) => car_id = Some(parse_ulid(value)?),
                    ("start", ast::BinaryOperator::GtEq) => start = Some(parse_date(value)?),
                    ("end", ast::BinaryOperator::LtEq) => end = Some(parse_date(value)?),
                    ("min_days", ast::BinaryOperator::Eq) => min_days = Some(parse_i64(value)?),
                    _ => return Err(SqlError::Unsupported(format!("filter on {col} {op}"))),
                }
            }
            Ok(Command::SelectAvailability {
                car_id: car_id.ok_or(SqlError::MissingFilter("car_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                min_days,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a op x AND b op y AND ...` into (column, op, value) triples.
fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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

fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<Day, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
