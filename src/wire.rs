use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{self, CarebookAuthSource};
use crate::calendar;
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;
use crate::observability;
use crate::ratelimit::RateLimiter;
use crate::sql::{self, Command, SqlError};

pub struct CarebookHandler {
    engine: Arc<Engine>,
    limiter: Arc<RateLimiter>,
    query_parser: Arc<CarebookQueryParser>,
}

impl CarebookHandler {
    pub fn new(engine: Arc<Engine>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            engine,
            limiter,
            query_parser: Arc::new(CarebookQueryParser),
        }
    }

    /// The session's user name is the identity the session collaborator issued.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        auth::resolve_actor(&user).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("unknown user {user:?}: expected owner:<id>, caregiver:<id> or admin"))
        })
    }

    async fn run(&self, actor: &Actor, query: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command, format: Option<&Format>) -> PgWireResult<Response> {
        let engine = &self.engine;
        let now = now_ms();

        if let Some(category) = cmd.rate_limit_category() {
            self.limiter
                .enforce(category, &actor.user_id.to_string(), now)
                .await
                .map_err(engine_err)?;
        }

        match cmd {
            Command::UpsertCaregiver { profile } => {
                engine.upsert_caregiver(actor, profile).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetAvailability {
                caregiver_id,
                service_id,
                date,
                slots,
                blocked,
            } => {
                engine
                    .set_availability(actor, caregiver_id, &service_id, date, slots, blocked, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ClearAvailability {
                caregiver_id,
                service_id,
                date,
            } => {
                engine
                    .clear_availability(actor, caregiver_id, &service_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::PurgeAvailability { before } => {
                let removed = engine
                    .purge_stale_availability(actor, before)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed)))
            }
            Command::RequestBooking { booking } => {
                engine.request_booking(actor, booking, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::TransitionBooking { booking_id, status } => {
                engine
                    .transition_booking(actor, booking_id, status, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { booking_id } => {
                engine.cancel_booking(actor, booking_id, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectDaySlots {
                caregiver_id,
                service_id,
                date,
            } => {
                let day = engine
                    .check_availability(caregiver_id, &service_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(fields(DAY_SLOTS, format), day_rows(&day)))
            }
            Command::SelectAvailability {
                caregiver_id,
                service_id,
                from,
                to,
            } => {
                let entries = engine
                    .get_availability(caregiver_id, &service_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let rows = entries
                    .into_iter()
                    .map(|e| {
                        vec![
                            Cell::Text(e.caregiver_id.to_string()),
                            Cell::Text(e.service_id),
                            Cell::Text(e.date.to_string()),
                            Cell::Text(calendar::format_slot_list(&e.slots)),
                            Cell::Bool(e.blocked),
                        ]
                    })
                    .collect();
                Ok(rows_response(fields(AVAILABILITY, format), rows))
            }
            Command::SelectCalendar {
                caregiver_id,
                service_id,
                from,
                to,
            } => {
                let days = engine
                    .calendar(caregiver_id, &service_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let rows = days.iter().flat_map(day_rows).collect();
                Ok(rows_response(fields(DAY_SLOTS, format), rows))
            }
            Command::SelectBookingCheck {
                caregiver_id,
                service_id,
                span,
            } => {
                let row = match engine.validate_booking_request(caregiver_id, &service_id, span).await {
                    Ok(()) => vec![Cell::Bool(true), Cell::OptText(None), Cell::OptText(None)],
                    Err(e) => vec![
                        Cell::Bool(false),
                        Cell::OptText(Some(e.class().as_str().to_string())),
                        Cell::OptText(Some(e.to_string())),
                    ],
                };
                Ok(rows_response(fields(BOOKING_CHECK, format), vec![row]))
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(actor, filter).await.map_err(engine_err)?;
                let rows = bookings
                    .into_iter()
                    .map(|b| {
                        vec![
                            Cell::Text(b.id.to_string()),
                            Cell::Text(b.owner_id.to_string()),
                            Cell::Text(b.caregiver_id.to_string()),
                            Cell::Text(b.service_id),
                            Cell::Int(b.span.start),
                            Cell::Int(b.span.end),
                            Cell::Text(b.status.to_string()),
                            Cell::Int(b.amount),
                        ]
                    })
                    .collect();
                Ok(rows_response(fields(BOOKINGS, format), rows))
            }
            Command::SelectMatches { request } => {
                let ranked = engine.rank_caregivers(&request).await.map_err(engine_err)?;
                let rows = ranked
                    .into_iter()
                    .map(|r| {
                        vec![
                            Cell::Text(r.caregiver_id.to_string()),
                            Cell::Int(i64::from(r.score)),
                            Cell::Text(r.reasons.join(",")),
                        ]
                    })
                    .collect();
                Ok(rows_response(fields(MATCHES, format), rows))
            }
            Command::SelectCancellationQuote { booking_id } => {
                let d = engine
                    .quote_cancellation(actor, booking_id, now)
                    .await
                    .map_err(engine_err)?;
                let row = vec![
                    Cell::Text(booking_id.to_string()),
                    Cell::Bool(d.can_cancel),
                    Cell::Text(d.tier.as_str().to_string()),
                    Cell::Int(i64::from(d.refund_pct)),
                    Cell::Int(d.refund_amount),
                    Cell::Int(d.fee_amount),
                    Cell::Text(d.reason.to_string()),
                ];
                Ok(rows_response(fields(CANCELLATION_QUOTE, format), vec![row]))
            }
            Command::SelectRateLimit { category, identifier } => {
                // Spending quota on someone else's key would lock them out.
                if !actor.is_admin() && identifier != actor.user_id.to_string() {
                    return Err(engine_err(EngineError::Forbidden(
                        "only admins may check another identifier",
                    )));
                }
                let verdict = self
                    .limiter
                    .check_preset(&category, &identifier, now)
                    .await
                    .map_err(engine_err)?;
                let row = vec![
                    Cell::Text(category),
                    Cell::Text(identifier),
                    Cell::Bool(verdict.allowed),
                    Cell::Int(i64::from(verdict.remaining)),
                    Cell::Int(verdict.reset_at),
                ];
                Ok(rows_response(fields(RATE_LIMIT, format), vec![row]))
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

enum Cell {
    Text(String),
    OptText(Option<String>),
    Int(i64),
    Bool(bool),
}

fn rows_response(schema: Vec<FieldInfo>, rows: Vec<Vec<Cell>>) -> Response {
    let schema = Arc::new(schema);
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in row {
                match cell {
                    Cell::Text(s) => encoder.encode_field(&s)?,
                    Cell::OptText(s) => encoder.encode_field(&s)?,
                    Cell::Int(n) => encoder.encode_field(&n)?,
                    Cell::Bool(b) => encoder.encode_field(&b)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(encoded)))
}

/// One row per slot, tagged `bookable`, `free` or `booked`. A blocked day is a
/// `blocked` row covering the whole day followed by any bookings it still holds.
fn day_rows(day: &DaySlots) -> Vec<Vec<Cell>> {
    let date = day.date.to_string();
    let row = |kind: &str, slot: &Slot| {
        vec![
            Cell::Text(date.clone()),
            Cell::Text(kind.to_string()),
            Cell::Int(i64::from(slot.start)),
            Cell::Int(i64::from(slot.end)),
        ]
    };
    if day.blocked {
        let mut rows = vec![row("blocked", &Slot::FULL_DAY)];
        rows.extend(day.booked.iter().map(|s| row("booked", s)));
        return rows;
    }
    let mut rows = Vec::new();
    for (kind, slots) in [("bookable", &day.bookable), ("free", &day.free), ("booked", &day.booked)] {
        rows.extend(slots.iter().map(|s| row(kind, s)));
    }
    rows
}

type Columns = &'static [(&'static str, Type)];

const DAY_SLOTS: Columns = &[
    ("date", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("start_minute", Type::INT8),
    ("end_minute", Type::INT8),
];

const AVAILABILITY: Columns = &[
    ("caregiver_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("slots", Type::VARCHAR),
    ("blocked", Type::BOOL),
];

const BOOKING_CHECK: Columns = &[
    ("valid", Type::BOOL),
    ("error_class", Type::VARCHAR),
    ("reason", Type::VARCHAR),
];

const BOOKINGS: Columns = &[
    ("id", Type::VARCHAR),
    ("owner_id", Type::VARCHAR),
    ("caregiver_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("start_at", Type::INT8),
    ("end_at", Type::INT8),
    ("status", Type::VARCHAR),
    ("amount", Type::INT8),
];

const MATCHES: Columns = &[
    ("caregiver_id", Type::VARCHAR),
    ("score", Type::INT8),
    ("reasons", Type::VARCHAR),
];

const CANCELLATION_QUOTE: Columns = &[
    ("booking_id", Type::VARCHAR),
    ("can_cancel", Type::BOOL),
    ("tier", Type::VARCHAR),
    ("refund_pct", Type::INT8),
    ("refund_amount", Type::INT8),
    ("fee_amount", Type::INT8),
    ("reason", Type::VARCHAR),
];

const RATE_LIMIT: Columns = &[
    ("category", Type::VARCHAR),
    ("identifier", Type::VARCHAR),
    ("allowed", Type::BOOL),
    ("remaining", Type::INT8),
    ("reset_at", Type::INT8),
];

/// Field descriptions in the result format the client asked for (text by default).
fn fields(columns: Columns, format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

/// Columns for a statement, judged from the table after `FROM` in a SELECT.
fn result_columns(sql: &str) -> Columns {
    match select_table(sql).as_deref() {
        Some("day_slots") | Some("calendar") => DAY_SLOTS,
        Some("availability") => AVAILABILITY,
        Some("booking_check") => BOOKING_CHECK,
        Some("bookings") => BOOKINGS,
        Some("matches") => MATCHES,
        Some("cancellation_quote") => CANCELLATION_QUOTE,
        Some("rate_limit") => RATE_LIMIT,
        _ => &[],
    }
}

fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next()? != "select" {
        return None;
    }
    words.find(|w| *w == "from")?;
    words
        .next()
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_string())
}

#[async_trait]
impl SimpleQueryHandler for CarebookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        Ok(vec![self.run(&actor, query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CarebookQueryParser;

#[async_trait]
impl QueryParser for CarebookQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(fields(result_columns(stmt), column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CarebookHandler {
    type Statement = String;
    type QueryParser = CarebookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        self.run(&actor, &sql, Some(&portal.result_column_format)).await
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
            fields(result_columns(&target.statement), None),
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
        Ok(DescribePortalResponse::new(fields(
            result_columns(&target.statement.statement),
            Some(&target.result_column_format),
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute `$1, $2, ...` with bound parameter values (text format).
/// Runs highest-first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CarebookFactory {
    handler: Arc<CarebookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CarebookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CarebookFactory {
    pub fn new(engine: Arc<Engine>, limiter: Arc<RateLimiter>, password: String) -> Self {
        Self {
            handler: Arc::new(CarebookHandler::new(engine, limiter)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CarebookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CarebookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    limiter: Arc<RateLimiter>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CarebookFactory::new(engine, limiter, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.class().sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE owner_id = $1"), 1);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $10, $3)"), 10);
    }

    #[test]
    fn schema_follows_select_table() {
        assert_eq!(result_columns("SELECT * FROM matches WHERE service = $1").len(), 3);
        assert_eq!(result_columns("select * from calendar where date >= $1").len(), 4);
        assert_eq!(result_columns("SELECT * FROM bookings;").len(), 8);
        assert!(result_columns("INSERT INTO bookings VALUES ($1)").is_empty());
        assert!(result_columns("SELECT * FROM nowhere").is_empty());
        assert_eq!(fields(BOOKINGS, None)[4].name(), "start_at");
    }

    #[test]
    fn blocked_day_is_one_row() {
        let day = DaySlots {
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            bookable: vec![Slot::new(540, 720)],
            free: vec![Slot::new(540, 720)],
            booked: vec![],
            blocked: true,
        };
        assert_eq!(day_rows(&day).len(), 1);
    }

    #[test]
    fn blocked_day_still_lists_existing_bookings() {
        let day = DaySlots {
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            bookable: vec![],
            free: vec![],
            booked: vec![Slot::new(540, 600)],
            blocked: true,
        };
        let rows = day_rows(&day);
        assert_eq!(rows.len(), 2);
        assert!(matches!(&rows[0][1], Cell::Text(kind) if kind == "blocked"));
        assert!(matches!(&rows[1][1], Cell::Text(kind) if kind == "booked"));
        assert!(matches!(rows[1][2], Cell::Int(540)));
    }

    #[test]
    fn open_day_rows_per_kind() {
        let day = DaySlots {
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            bookable: vec![Slot::new(840, 1020)],
            free: vec![Slot::new(600, 720), Slot::new(840, 1020)],
            booked: vec![Slot::new(540, 600)],
            blocked: false,
        };
        assert_eq!(day_rows(&day).len(), 4);
    }

    #[test]
    fn engine_errors_carry_their_sqlstate() {
        let err = engine_err(EngineError::AlreadyBooked(ulid::Ulid::nil()));
        match err {
            PgWireError::UserError(info) => assert_eq!(info.code, "23P01"),
            other => panic!("expected user error, got {other:?}"),
        }
    }
}
