use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        id: Ulid,
        name: Option<String>,
    },
    DeleteFacility {
        id: Ulid,
    },
    SelectFacilities,
    InsertSchedule {
        facility_id: Ulid,
        day_type: DayType,
        open_time: String,
        close_time: String,
    },
    DeleteSchedule {
        facility_id: Ulid,
        day_type: DayType,
    },
    SelectSchedules {
        facility_id: Ulid,
    },
    InsertPricing {
        id: Ulid,
        facility_id: Ulid,
        day_type: DayType,
        start_hour: String,
        end_hour: String,
        price_per_hour: f64,
    },
    DeletePricing {
        id: Ulid,
    },
    SelectPricing {
        facility_id: Ulid,
    },
    /// Dates left as `None` are defaulted by the caller.
    SelectAvailability {
        facility_id: Ulid,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        json: bool,
    },
    InsertReservation {
        id: Ulid,
        user_id: Ulid,
        facility_id: Ulid,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    /// `DELETE FROM reservations`: the row is kept as cancelled.
    CancelReservation {
        id: Ulid,
        user_id: Ulid,
    },
    /// `INSERT INTO payments`: payment completed, confirm the reservation.
    ConfirmReservation {
        id: Ulid,
        user_id: Ulid,
        returning: bool,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    /// Unpaid reservations that can still be paid for.
    CountPendingReservations {
        user_id: Ulid,
    },
}

#[derive(Debug, PartialEq)]
pub enum ReservationFilter {
    Id(Ulid),
    Facility { facility_id: Ulid, within: Option<Span> },
    User { user_id: Ulid, upcoming: bool },
}

/// The first statement of `sql`.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_batch(sql)?.into_iter().next().ok_or(SqlError::Empty)
}

/// Every `;`-separated statement, in order. Simple-query strings may carry several.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column name → value for the single VALUES row. Without a column list the
/// values are taken positionally against `default_columns`.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &'static str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Row, SqlError> {
    let rows = insert_values(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "{table}: multi-row INSERT ({} rows)",
            rows.len()
        )));
    }
    let values = &rows[0];
    let names: Vec<String> = if insert.columns.is_empty() {
        if values.len() > default_columns.len() {
            return Err(SqlError::WrongArity(table, default_columns.len(), values.len()));
        }
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    Ok(Row {
        table,
        cells: names.into_iter().zip(values.iter().cloned()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "facilities" => {
            let row = insert_row(insert, "facilities", &["id", "name"])?;
            Ok(Command::InsertFacility {
                id: parse_ulid(row.required("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "schedules" => {
            let row = insert_row(
                insert,
                "schedules",
                &["facility_id", "day_type", "open_time", "close_time"],
            )?;
            Ok(Command::InsertSchedule {
                facility_id: parse_ulid(row.required("facility_id")?)?,
                day_type: parse_day_type(row.required("day_type")?)?,
                open_time: parse_string(row.required("open_time")?)?,
                close_time: parse_string(row.required("close_time")?)?,
            })
        }
        "pricing" => {
            let row = insert_row(
                insert,
                "pricing",
                &["id", "facility_id", "day_type", "start_hour", "end_hour", "price_per_hour"],
            )?;
            Ok(Command::InsertPricing {
                id: parse_ulid(row.required("id")?)?,
                facility_id: parse_ulid(row.required("facility_id")?)?,
                day_type: parse_day_type(row.required("day_type")?)?,
                start_hour: parse_string(row.required("start_hour")?)?,
                end_hour: parse_string(row.required("end_hour")?)?,
                price_per_hour: parse_f64(row.required("price_per_hour")?)?,
            })
        }
        "reservations" => {
            let row = insert_row(
                insert,
                "reservations",
                &["id", "user_id", "facility_id", "start_time", "end_time"],
            )?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.required("id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                facility_id: parse_ulid(row.required("facility_id")?)?,
                start: parse_timestamp(row.required("start_time")?)?,
                end: parse_timestamp(row.required("end_time")?)?,
                returning,
            })
        }
        "payments" => {
            let row = insert_row(insert, "payments", &["reservation_id", "user_id"])?;
            Ok(Command::ConfirmReservation {
                id: parse_ulid(row.required("reservation_id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "facilities" => Ok(Command::DeleteFacility {
            id: filters.ulid("id")?,
        }),
        "schedules" => Ok(Command::DeleteSchedule {
            facility_id: filters.ulid("facility_id")?,
            day_type: parse_day_type(filters.eq("day_type")?)?,
        }),
        "pricing" => Ok(Command::DeletePricing {
            id: filters.ulid("id")?,
        }),
        "reservations" => Ok(Command::CancelReservation {
            id: filters.ulid("id")?,
            user_id: filters.ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "facilities" => Ok(Command::SelectFacilities),
        "schedules" => Ok(Command::SelectSchedules {
            facility_id: filters.ulid("facility_id")?,
        }),
        "pricing" => Ok(Command::SelectPricing {
            facility_id: filters.ulid("facility_id")?,
        }),
        "availability" | "availability_json" => Ok(Command::SelectAvailability {
            facility_id: filters.ulid("facility_id")?,
            start_date: filters.optional("start_date").map(parse_date).transpose()?,
            end_date: filters.optional("end_date").map(parse_date).transpose()?,
            json: table == "availability_json",
        }),
        "reservations" => Ok(Command::SelectReservations {
            filter: reservation_filter(&filters)?,
        }),
        "pending_reservations" => Ok(Command::CountPendingReservations {
            user_id: filters.ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn reservation_filter(filters: &Filters) -> Result<ReservationFilter, SqlError> {
    if let Some(id) = filters.optional("id") {
        return Ok(ReservationFilter::Id(parse_ulid(id)?));
    }
    if let Some(facility_id) = filters.optional("facility_id") {
        let from = filters.compared("start_time", BinaryOperator::GtEq);
        let to = filters.compared("end_time", BinaryOperator::LtEq);
        let within = match (from, to) {
            (None, None) => None,
            (Some(from), Some(to)) => {
                let (start, end) = (parse_timestamp(from)?, parse_timestamp(to)?);
                if end <= start {
                    return Err(SqlError::Parse("end_time bound must be after start_time bound".into()));
                }
                Some(Span::new(start, end))
            }
            _ => return Err(SqlError::MissingFilter("start_time and end_time")),
        };
        return Ok(ReservationFilter::Facility {
            facility_id: parse_ulid(facility_id)?,
            within,
        });
    }
    if let Some(user_id) = filters.optional("user_id") {
        return Ok(ReservationFilter::User {
            user_id: parse_ulid(user_id)?,
            upcoming: filters.optional("upcoming").map(parse_bool).transpose()?.unwrap_or(false),
        });
    }
    Err(SqlError::MissingFilter("id, facility_id or user_id"))
}

/// Flattened `col <op> value` conjuncts of a WHERE clause.
struct Filters<'a> {
    terms: Vec<(String, &'a BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn compared(&self, col: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == col && **o == op)
            .map(|(_, _, e)| *e)
    }

    fn optional(&self, col: &str) -> Option<&'a Expr> {
        self.compared(col, BinaryOperator::Eq)
    }

    fn eq(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(col).ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.eq(col)?)
    }
}

fn collect_terms<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_terms(left, out)?;
            collect_terms(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, op, right.as_ref()));
            Ok(())
        }
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

fn insert_values(insert: &ast::Insert) -> Result<&Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        _ => Err(SqlError::Parse(format!("expected string or NULL, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_day_type(expr: &Expr) -> Result<DayType, SqlError> {
    let s = parse_string(expr)?;
    DayType::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad day_type {s} (weekday or weekend)")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    calendar::parse_date(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    calendar::parse_rfc3339(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_f64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
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
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
