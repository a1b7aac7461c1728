use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use tracing::{debug, error, warn};

use crate::auth::CourtbookAuthSource;
use crate::calendar;
use crate::engine::{now_ms, Engine, EngineError};
use crate::limits::DEFAULT_QUERY_DAYS;
use crate::model::*;
use crate::observability as obs;
use crate::sql::{self, Command, ReservationFilter};
use crate::tenant::TenantManager;

pub struct CourtbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CourtbookQueryParser>,
}

impl CourtbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CourtbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse and run every statement in `query`, stopping at the first failure.
    async fn run_batch(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmds = sql::parse_batch(query).map_err(parse_failed)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run(engine, cmd).await?);
        }
        Ok(responses)
    }

    /// Execute one command and record RED metrics for it.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = obs::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        debug!(command = label, status, "query");
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertFacility { id, name } => {
                engine.create_facility(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteFacility { id } => {
                engine.delete_facility(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectFacilities => {
                let facilities = engine.list_facilities().await;
                Ok(rows(facilities_schema(), facilities, |enc, f| {
                    enc.encode_field(&f.id.to_string())?;
                    enc.encode_field(&f.name)?;
                    enc.encode_field(&f.configured)
                }))
            }
            Command::InsertSchedule {
                facility_id,
                day_type,
                open_time,
                close_time,
            } => {
                engine
                    .set_schedule(facility_id, day_type, &open_time, &close_time)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSchedule { facility_id, day_type } => {
                engine
                    .remove_schedule(facility_id, day_type)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSchedules { facility_id } => {
                let schedules = engine.get_schedules(facility_id).await.map_err(engine_err)?;
                let fid = facility_id.to_string();
                Ok(rows(schedules_schema(), schedules, |enc, s| {
                    enc.encode_field(&fid)?;
                    enc.encode_field(&s.day_type.as_str())?;
                    enc.encode_field(&s.open_time)?;
                    enc.encode_field(&s.close_time)
                }))
            }
            Command::InsertPricing {
                id,
                facility_id,
                day_type,
                start_hour,
                end_hour,
                price_per_hour,
            } => {
                engine
                    .add_pricing(id, facility_id, day_type, &start_hour, &end_hour, price_per_hour)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeletePricing { id } => {
                engine.remove_pricing(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectPricing { facility_id } => {
                let pricing = engine.get_pricing(facility_id).await.map_err(engine_err)?;
                let fid = facility_id.to_string();
                Ok(rows(pricing_schema(), pricing, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&fid)?;
                    enc.encode_field(&p.day_type.as_str())?;
                    enc.encode_field(&p.start_hour)?;
                    enc.encode_field(&p.end_hour)?;
                    enc.encode_field(&p.price_per_hour)
                }))
            }
            Command::SelectAvailability {
                facility_id,
                start_date,
                end_date,
                json,
            } => {
                let start_date = match start_date {
                    Some(d) => d,
                    None => calendar::today(now_ms())
                        .map_err(|e| engine_err(EngineError::from(e)))?,
                };
                let end_date =
                    end_date.unwrap_or_else(|| calendar::add_days(start_date, DEFAULT_QUERY_DAYS));
                let days = engine
                    .get_availability(facility_id, start_date, end_date)
                    .await
                    .map_err(engine_err)?;
                if json {
                    let body = serde_json::to_string(&days).map_err(|e| {
                        error!("availability encoding failed: {e}");
                        internal_err()
                    })?;
                    let fid = facility_id.to_string();
                    Ok(rows(availability_json_schema(), [body], |enc, body| {
                        enc.encode_field(&fid)?;
                        enc.encode_field(&body)
                    }))
                } else {
                    Ok(rows(availability_schema(), slot_rows(days), |enc, (date, is_open, slot)| {
                        enc.encode_field(&date)?;
                        enc.encode_field(&is_open)?;
                        enc.encode_field(&slot.as_ref().map(|s| s.start_time.clone()))?;
                        enc.encode_field(&slot.as_ref().map(|s| s.end_time.clone()))?;
                        enc.encode_field(&slot.as_ref().map(|s| s.price_per_hour))?;
                        enc.encode_field(&slot.as_ref().map(|s| s.available))
                    }))
                }
            }
            Command::InsertReservation {
                id,
                user_id,
                facility_id,
                start,
                end,
                returning,
            } => {
                let reservation = engine
                    .create_reservation(id, user_id, facility_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(returned("INSERT", returning, reservation))
            }
            Command::CancelReservation { id, user_id } => {
                engine
                    .cancel_reservation(id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ConfirmReservation {
                id,
                user_id,
                returning,
            } => {
                let reservation = engine
                    .confirm_reservation(id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(returned("INSERT", returning, reservation))
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::Id(id) => engine.get_reservation(id).await.into_iter().collect(),
                    ReservationFilter::Facility { facility_id, within } => engine
                        .get_facility_reservations(facility_id, within)
                        .await
                        .map_err(engine_err)?,
                    ReservationFilter::User { user_id, upcoming: true } => {
                        engine.get_upcoming_reservations(user_id, now_ms()).await
                    }
                    ReservationFilter::User { user_id, upcoming: false } => {
                        engine.get_user_reservations(user_id).await
                    }
                };
                Ok(rows(reservations_schema(), reservations, encode_reservation))
            }
            Command::CountPendingReservations { user_id } => {
                let count = engine.count_pending_reservations(user_id, now_ms()).await as i64;
                let uid = user_id.to_string();
                Ok(rows(pending_count_schema(), [count], |enc, count| {
                    enc.encode_field(&uid)?;
                    enc.encode_field(&count)
                }))
            }
        }
    }
}

/// One row per slot; a day without slots still gets a row with NULL slot columns.
fn slot_rows(days: Vec<DayAvailability>) -> Vec<(String, bool, Option<AvailableSlot>)> {
    let mut out = Vec::new();
    for day in days {
        if day.slots.is_empty() {
            out.push((day.date, day.is_open, None));
            continue;
        }
        for slot in day.slots {
            out.push((day.date.clone(), day.is_open, Some(slot)));
        }
    }
    out
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// `RETURNING *` answers with the row, otherwise a plain command tag.
fn returned(tag: &str, returning: bool, reservation: Reservation) -> Response {
    if returning {
        rows(reservations_schema(), [reservation], encode_reservation)
    } else {
        Response::Execution(Tag::new(tag).with_rows(1))
    }
}

fn encode_reservation(enc: &mut DataRowEncoder, r: Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&r.facility_id.to_string())?;
    enc.encode_field(&calendar::format_rfc3339(r.span.start))?;
    enc.encode_field(&calendar::format_rfc3339(r.span.end))?;
    enc.encode_field(&r.status.as_str())?;
    enc.encode_field(&r.total_price)?;
    enc.encode_field(&calendar::format_rfc3339(r.created_at))?;
    enc.encode_field(&r.calendar_event_id)
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn facilities_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("configured", Type::BOOL),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        field("facility_id", Type::VARCHAR),
        field("day_type", Type::VARCHAR),
        field("open_time", Type::VARCHAR),
        field("close_time", Type::VARCHAR),
    ]
}

fn pricing_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("day_type", Type::VARCHAR),
        field("start_hour", Type::VARCHAR),
        field("end_hour", Type::VARCHAR),
        field("price_per_hour", Type::FLOAT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("is_open", Type::BOOL),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("price_per_hour", Type::FLOAT8),
        field("available", Type::BOOL),
    ]
}

fn availability_json_schema() -> Vec<FieldInfo> {
    vec![
        field("facility_id", Type::VARCHAR),
        field("availability", Type::VARCHAR),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("total_price", Type::FLOAT8),
        field("created_at", Type::VARCHAR),
        field("calendar_event_id", Type::VARCHAR),
    ]
}

fn pending_count_schema() -> Vec<FieldInfo> {
    vec![field("user_id", Type::VARCHAR), field("pending_count", Type::INT8)]
}

/// Result columns for a statement that still carries `$N` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .copied()
    };

    match words.first().copied() {
        Some("select") => match table_after("from") {
            Some("facilities") => facilities_schema(),
            Some("schedules") => schedules_schema(),
            Some("pricing") => pricing_schema(),
            Some("availability") => availability_schema(),
            Some("availability_json") => availability_json_schema(),
            Some("reservations") => reservations_schema(),
            Some("pending_reservations") => pending_count_schema(),
            _ => vec![],
        },
        Some("insert") if words.contains(&"returning") => match table_after("into") {
            Some("reservations") | Some("payments") => reservations_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run_batch(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtbookQueryParser;

#[async_trait]
impl QueryParser for CourtbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtbookHandler {
    type Statement = String;
    type QueryParser = CourtbookQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(parse_failed)?;
        self.run(&engine, cmd).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers the prefix of `$10`.
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

pub struct CourtbookFactory {
    handler: Arc<CourtbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CourtbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtbookFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CourtbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::Unauthorized(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::ScheduleExists(..) => "23505",
        EngineError::HasLiveReservations(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::NotConfigured(_) | EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let message = if e.is_client_error() {
        e.to_string()
    } else {
        match &e {
            EngineError::WalError(_) => error!("{e}"),
            _ => warn!("{e}"),
        }
        "request could not be completed".to_string()
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        message,
    )))
}

fn internal_err() -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "XX000".into(),
        "request could not be completed".into(),
    )))
}

fn parse_failed(e: sql::SqlError) -> PgWireError {
    metrics::counter!(obs::QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
