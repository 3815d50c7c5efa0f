use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{self, TimeWindow};
use crate::engine::{BookingFilter, NewBooking};
use crate::limits::MAX_SQL_LEN;
use crate::matching::MatchRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertCaregiver {
        profile: CaregiverProfile,
    },
    SetAvailability {
        caregiver_id: Ulid,
        service_id: String,
        date: NaiveDate,
        slots: Vec<Slot>,
        blocked: bool,
    },
    ClearAvailability {
        caregiver_id: Ulid,
        service_id: String,
        date: NaiveDate,
    },
    PurgeAvailability {
        before: NaiveDate,
    },
    RequestBooking {
        booking: NewBooking,
    },
    TransitionBooking {
        booking_id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        booking_id: Ulid,
    },
    SelectDaySlots {
        caregiver_id: Ulid,
        service_id: String,
        date: NaiveDate,
    },
    SelectAvailability {
        caregiver_id: Ulid,
        service_id: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectCalendar {
        caregiver_id: Ulid,
        service_id: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectBookingCheck {
        caregiver_id: Ulid,
        service_id: String,
        span: Span,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectMatches {
        request: MatchRequest,
    },
    SelectCancellationQuote {
        booking_id: Ulid,
    },
    SelectRateLimit {
        category: String,
        identifier: String,
    },
}

impl Command {
    /// Rate-limit category for externally reachable writes; `None` for reads.
    pub fn rate_limit_category(&self) -> Option<&'static str> {
        match self {
            Command::UpsertCaregiver { .. } => Some("profile"),
            Command::SetAvailability { .. }
            | Command::ClearAvailability { .. }
            | Command::PurgeAvailability { .. } => Some("availability"),
            Command::RequestBooking { .. } | Command::TransitionBooking { .. } => Some("booking"),
            Command::CancelBooking { .. } => Some("cancellation"),
            _ => None,
        }
    }
}

const CAREGIVER_COLUMNS: &[&str] = &["id", "approved", "active", "services", "region", "work_regions", "postal_code"];
const AVAILABILITY_COLUMNS: &[&str] = &["caregiver_id", "service_id", "date", "slots", "blocked"];
const BOOKING_COLUMNS: &[&str] = &["id", "owner_id", "caregiver_id", "service_id", "start_at", "end_at", "amount"];
const TRANSITION_COLUMNS: &[&str] = &["booking_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::Unsupported("statement too long".into()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("one statement per query".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = match table.as_str() {
        "caregivers" => CAREGIVER_COLUMNS,
        "availability" => AVAILABILITY_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        "booking_transitions" => TRANSITION_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = Row::from_insert(insert, columns)?;

    match table.as_str() {
        "caregivers" => Ok(Command::UpsertCaregiver {
            profile: CaregiverProfile {
                id: parse_ulid(row.require("id")?)?,
                approved: row.get("approved").map(parse_bool).transpose()?.unwrap_or(false),
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
                services: row.get("services").map(parse_text_or_null).transpose()?.flatten().unwrap_or_default(),
                region: row.get("region").map(parse_text_or_null).transpose()?.flatten(),
                work_regions: row
                    .get("work_regions")
                    .map(parse_text_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
                postal_code: row.get("postal_code").map(parse_text_or_null).transpose()?.flatten(),
            },
        }),
        "availability" => {
            let slots = match row.get("slots") {
                Some(expr) => {
                    let text = parse_text_or_null(expr)?.unwrap_or_default();
                    calendar::parse_slot_list(&text).map_err(|e| SqlError::Parse(e.to_string()))?
                }
                None => Vec::new(),
            };
            Ok(Command::SetAvailability {
                caregiver_id: parse_ulid(row.require("caregiver_id")?)?,
                service_id: parse_text(row.require("service_id")?)?,
                date: parse_date(row.require("date")?)?,
                slots,
                blocked: row.get("blocked").map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "bookings" => Ok(Command::RequestBooking {
            booking: NewBooking {
                id: parse_ulid(row.require("id")?)?,
                owner_id: parse_ulid(row.require("owner_id")?)?,
                caregiver_id: parse_ulid(row.require("caregiver_id")?)?,
                service_id: parse_text(row.require("service_id")?)?,
                // Unvalidated on purpose: the engine reports a reversed span.
                span: Span {
                    start: parse_i64(row.require("start_at")?)?,
                    end: parse_i64(row.require("end_at")?)?,
                },
                amount: parse_i64(row.require("amount")?)?,
            },
        }),
        _ => Ok(Command::TransitionBooking {
            booking_id: parse_ulid(row.require("booking_id")?)?,
            status: parse_status(row.require("status")?)?,
        }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            if let Some(before) = filters.lt.get("date") {
                // A purge spans every caregiver; narrower filters would be ignored.
                if filters.count() != 1 {
                    return Err(SqlError::Unsupported(
                        "a purge takes only a `date <` filter".into(),
                    ));
                }
                return Ok(Command::PurgeAvailability {
                    before: parse_date(before)?,
                });
            }
            Ok(Command::ClearAvailability {
                caregiver_id: parse_ulid(filters.require("caregiver_id")?)?,
                service_id: parse_text(filters.require("service_id")?)?,
                date: parse_date(filters.require("date")?)?,
            })
        }
        "bookings" => Ok(Command::CancelBooking {
            booking_id: parse_ulid(filters.require("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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
    let f = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "day_slots" => Ok(Command::SelectDaySlots {
            caregiver_id: parse_ulid(f.require("caregiver_id")?)?,
            service_id: parse_text(f.require("service_id")?)?,
            date: parse_date(f.require("date")?)?,
        }),
        "availability" | "calendar" => {
            let caregiver_id = parse_ulid(f.require("caregiver_id")?)?;
            let service_id = parse_text(f.require("service_id")?)?;
            let (from, to) = f.date_range()?;
            if table == "availability" {
                Ok(Command::SelectAvailability { caregiver_id, service_id, from, to })
            } else {
                Ok(Command::SelectCalendar { caregiver_id, service_id, from, to })
            }
        }
        "booking_check" => Ok(Command::SelectBookingCheck {
            caregiver_id: parse_ulid(f.require("caregiver_id")?)?,
            service_id: parse_text(f.require("service_id")?)?,
            span: Span {
                start: parse_i64(f.require("start_at")?)?,
                end: parse_i64(f.require("end_at")?)?,
            },
        }),
        "bookings" => Ok(Command::SelectBookings {
            filter: BookingFilter {
                caregiver_id: f.eq.get("caregiver_id").map(|e| parse_ulid(e)).transpose()?,
                owner_id: f.eq.get("owner_id").map(|e| parse_ulid(e)).transpose()?,
            },
        }),
        "matches" => {
            let window = f
                .eq
                .get("time_window")
                .map(|e| {
                    parse_text(e)?
                        .parse::<TimeWindow>()
                        .map_err(|e| SqlError::Parse(e.to_string()))
                })
                .transpose()?;
            let start_time = f.eq.get("start_time").map(|e| parse_text(e)).transpose()?;
            let start_minute = calendar::resolve_start_minute(start_time.as_deref(), window)
                .map_err(|e| SqlError::Parse(e.to_string()))?;
            Ok(Command::SelectMatches {
                request: MatchRequest {
                    service: parse_text(f.require("service")?)?,
                    date: parse_date(f.require("date")?)?,
                    window,
                    start_minute,
                    postal_code: f.eq.get("postal_code").map(|e| parse_text(e)).transpose()?,
                    region: f.eq.get("region").map(|e| parse_text(e)).transpose()?,
                },
            })
        }
        "cancellation_quote" => Ok(Command::SelectCancellationQuote {
            booking_id: parse_ulid(f.require("booking_id")?)?,
        }),
        "rate_limit" => Ok(Command::SelectRateLimit {
            category: parse_text(f.require("category")?)?,
            identifier: parse_text(f.require("identifier")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row and filter collection ─────────────────────────────────

/// One VALUES row keyed by column name. Without a column list, values are
/// taken positionally in the table's canonical column order.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn from_insert(insert: &'a ast::Insert, canonical: &[&str]) -> Result<Self, SqlError> {
        let row = single_insert_row(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            if row.len() > canonical.len() {
                return Err(SqlError::WrongArity(canonical.len(), row.len()));
            }
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != row.len() {
                return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };

        let mut values = HashMap::new();
        for (name, expr) in names.into_iter().zip(row.iter()) {
            if !canonical.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(name));
            }
            values.insert(name, expr);
        }
        Ok(Self { values })
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.values.get(col).copied()
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

/// Column predicates from a WHERE clause made of ANDed comparisons.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    ge: HashMap<String, &'a Expr>,
    le: HashMap<String, &'a Expr>,
    lt: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                let target = match op {
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.ge,
                    ast::BinaryOperator::LtEq => &mut self.le,
                    ast::BinaryOperator::Lt => &mut self.lt,
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                };
                target.insert(col, right.as_ref());
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
        }
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq.get(col).copied().ok_or(SqlError::MissingFilter(col))
    }

    fn count(&self) -> usize {
        self.eq.len() + self.ge.len() + self.le.len() + self.lt.len()
    }

    /// `date = d`, or `date >= from AND date <= to`.
    fn date_range(&self) -> Result<(NaiveDate, NaiveDate), SqlError> {
        if let Some(day) = self.eq.get("date") {
            let day = parse_date(day)?;
            return Ok((day, day));
        }
        let from = self.ge.get("date").ok_or(SqlError::MissingFilter("date >="))?;
        let to = self.le.get("date").ok_or(SqlError::MissingFilter("date <="))?;
        Ok((parse_date(from)?, parse_date(to)?))
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

fn single_insert_row(insert: &ast::Insert) -> Result<&Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    calendar::parse_date(&s).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_text(expr)?;
    if s.trim().eq_ignore_ascii_case("settled") {
        return Ok(BookingStatus::Cancelled);
    }
    s.parse().map_err(SqlError::Parse)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
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
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
