use std::fmt::Debug;
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
use tracing::debug;

use crate::auth::AutobookAuthSource;
use crate::booking::{BookingService, RescheduleResult};
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ReservationFilter, SqlError};
use crate::tenant::TenantManager;

pub struct AutobookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AutobookQueryParser>,
}

impl AutobookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AutobookQueryParser),
        }
    }

    fn resolve_service<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<BookingService>> {
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

    async fn run(&self, service: &BookingService, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = execute_command(service, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn execute_command(service: &BookingService, cmd: Command) -> PgWireResult<Response> {
    let engine = service.engine();
    match cmd {
        Command::InsertCar { id, name, daily_rate } => {
            engine
                .create_asset(id, name, daily_rate)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateCar { id, name, daily_rate } => {
            engine
                .update_asset(id, name, daily_rate)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::DeleteCar { id } => {
            engine.delete_asset(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertReservation {
            id,
            car_id,
            owner_id,
            range,
        } => {
            service
                .create(id, car_id, owner_id, range)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::RescheduleReservation { id, range } => {
            let result = service.reschedule(id, range).await.map_err(engine_err)?;
            reschedule_response(id, &result)
        }
        Command::CancelReservation { id } => {
            service.cancel(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::PayReschedule { pending } => {
            let reservation = service.pay_and_complete(&pending).await.map_err(engine_err)?;
            reservations_response(vec![reservation])
        }
        Command::ConfirmReschedule { pending } => {
            let reservation = service
                .complete_pending_reschedule(&pending)
                .await
                .map_err(engine_err)?;
            reservations_response(vec![reservation])
        }
        Command::SelectCars => cars_response(engine.list_assets().await),
        Command::SelectReservations { filter } => {
            let reservations = match filter {
                ReservationFilter::All => engine.list_all_reservations().await,
                ReservationFilter::ByCar(car_id) => {
                    engine.list_reservations(car_id).await.map_err(engine_err)?
                }
                // An unknown id is an empty result, not an error.
                ReservationFilter::ById(id) => match engine.get_reservation(id).await {
                    Ok(r) => vec![r],
                    Err(EngineError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                },
            };
            reservations_response(reservations)
        }
        Command::SelectAvailability {
            car_id,
            start,
            end,
            min_days,
        } => {
            let windows = engine
                .compute_availability(car_id, start, end, min_days)
                .await
                .map_err(engine_err)?;
            availability_response(car_id.to_string(), windows)
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn cars_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), int_field("daily_rate")]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("car_id"),
        text_field("owner_id"),
        text_field("start"),
        text_field("end"),
        int_field("daily_rate"),
        int_field("amount"),
        text_field("status"),
        int_field("version"),
    ]
}

fn reschedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("reservation_id"),
        text_field("outcome"),
        text_field("start"),
        text_field("end"),
        int_field("amount"),
        int_field("extra_amount"),
        int_field("refund"),
        FieldInfo::new("refund_settled".into(), None, None, Type::BOOL, FieldFormat::Text),
        int_field("version"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("car_id"),
        text_field("start"),
        text_field("end"),
        int_field("days"),
    ]
}

fn cars_response(cars: Vec<AssetInfo>) -> PgWireResult<Response> {
    let schema = Arc::new(cars_schema());
    let rows: Vec<PgWireResult<_>> = cars
        .into_iter()
        .map(|car| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&car.id.to_string())?;
            encoder.encode_field(&car.name)?;
            encoder.encode_field(&car.daily_rate)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservations_response(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.asset_id.to_string())?;
            encoder.encode_field(&r.owner_id.to_string())?;
            encoder.encode_field(&r.range.start.to_string())?;
            encoder.encode_field(&r.range.end.to_string())?;
            encoder.encode_field(&r.daily_rate)?;
            encoder.encode_field(&r.amount)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&(r.version as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// One row describing what the reschedule did. For `pending_payment` the dates,
/// extra amount and version are exactly what the client must send back to
/// `reschedule_payments` or `reschedule_confirmations`.
fn reschedule_response(id: ulid::Ulid, result: &RescheduleResult) -> PgWireResult<Response> {
    let schema = Arc::new(reschedule_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&id.to_string())?;
    match &result.outcome {
        RescheduleOutcome::Applied { reservation, refund } => {
            encoder.encode_field(&"applied")?;
            encoder.encode_field(&reservation.range.start.to_string())?;
            encoder.encode_field(&reservation.range.end.to_string())?;
            encoder.encode_field(&reservation.amount)?;
            encoder.encode_field(&0i64)?;
            encoder.encode_field(refund)?;
            encoder.encode_field(&result.refund_settled)?;
            encoder.encode_field(&(reservation.version as i64))?;
        }
        RescheduleOutcome::PendingPayment(pending) => {
            encoder.encode_field(&"pending_payment")?;
            encoder.encode_field(&pending.new_range.start.to_string())?;
            encoder.encode_field(&pending.new_range.end.to_string())?;
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&pending.extra_amount)?;
            encoder.encode_field(&0i64)?;
            encoder.encode_field(&result.refund_settled)?;
            encoder.encode_field(&(pending.version as i64))?;
        }
    }
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_response(car_id: String, windows: Vec<DateRange>) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<_>> = windows
        .into_iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&car_id)?;
            encoder.encode_field(&w.start.to_string())?;
            encoder.encode_field(&w.end.to_string())?;
            encoder.encode_field(&w.length_days())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row shape of a statement, decided from its text so it also works before
/// `$n` parameters are bound.
fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |kw: &str| {
        words
            .iter()
            .position(|w| *w == kw)
            .and_then(|i| words.get(i + 1).copied())
    };

    match words.first().copied() {
        Some("SELECT") => match after("FROM") {
            Some("CARS") => cars_schema(),
            Some("RESERVATIONS") => reservations_schema(),
            Some("AVAILABILITY") => availability_schema(),
            _ => vec![],
        },
        Some("INSERT") => match after("INTO") {
            Some("RESCHEDULE_PAYMENTS") | Some("RESCHEDULE_CONFIRMATIONS") => {
                reservations_schema()
            }
            _ => vec![],
        },
        Some("UPDATE") if after("UPDATE") == Some("RESERVATIONS") && !upper.contains("STATUS") => {
            reschedule_schema()
        }
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AutobookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let service = self.resolve_service(client)?;
        Ok(vec![self.run(&service, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AutobookQueryParser;

#[async_trait]
impl QueryParser for AutobookQueryParser {
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
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AutobookHandler {
    type Statement = String;
    type QueryParser = AutobookQueryParser;

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
        let service = self.resolve_service(client)?;
        let sql = substitute_params(portal);
        self.run(&service, &sql).await
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
            describe_schema(&target.statement),
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
        )))
    }
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

/// Inline bound parameters as quoted text. Numbers arrive quoted too; the
/// parser accepts quoted integers.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    inline_params(&portal.statement.statement, &params)
}

/// One left-to-right pass: each `$n` is replaced once, so text inside a bound
/// value is never scanned for placeholders. Unbound `$n` stay as written.
fn inline_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    let mut copied = 0;
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
        let bound = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = bound {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    out.push('\'');
                    out.push_str(&String::from_utf8_lossy(value).replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AutobookFactory {
    handler: Arc<AutobookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<AutobookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl AutobookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, user: String, password: String) -> Self {
        let auth_source = AutobookAuthSource::new(user, password);
        Self {
            handler: Arc::new(AutobookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AutobookFactory {
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
    user: String,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = AutobookFactory::new(tenant_manager, user, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::DateConflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::StalePending(_) => "40001",
        EngineError::QuoteMismatch(_) => "22023",
        EngineError::PaymentFailed(_) => "P0003",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidRange(_)
        | EngineError::HasActiveReservations(_)
        | EngineError::LimitExceeded(_)
        | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!("statement failed: {e}");
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
