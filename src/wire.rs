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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::auth::{YardAuthSource, role_for_user};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::session::{Session, Yard};
use crate::sql::{self, Command};
use crate::sync::Edits;
use crate::yard::{BayView, FieldError, YardError, YardSnapshot, ZoneView};

/// Query handler for one client connection. The connection's [`Session`] is
/// opened on the first statement, once the login user is known.
pub struct YardHandler {
    yard: Arc<Yard>,
    office_user: String,
    session: Mutex<Option<Session>>,
    query_parser: Arc<YardQueryParser>,
}

impl YardHandler {
    pub fn new(yard: Arc<Yard>, office_user: String) -> Self {
        Self {
            yard,
            office_user,
            session: Mutex::new(None),
            query_parser: Arc::new(YardQueryParser),
        }
    }

    async fn run<C: ClientInfo>(&self, client: &C, cmd: Command) -> PgWireResult<Vec<Response>> {
        let role = role_for_user(
            client.metadata().get("user").map(String::as_str),
            &self.office_user,
        );
        let mut guard = self.session.lock().await;
        let session = guard.get_or_insert_with(|| self.yard.open_session(Arc::new(role)));

        let label = command_label(&cmd);
        let start = Instant::now();
        let result = execute_command(session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result.map_err(yard_err)
    }
}

async fn execute_command(session: &mut Session, cmd: Command) -> Result<Vec<Response>, YardError> {
    match cmd {
        Command::SelectBookings { booking_no: None } => {
            let table = session.refresh().await?;
            let views: Vec<BookingView> = table.bookings.iter().map(BookingView::from).collect();
            Ok(vec![bookings_response(&views)])
        }
        Command::SelectBookings {
            booking_no: Some(no),
        } => {
            session.refresh().await?;
            let view = session.find(&no).await?;
            Ok(vec![bookings_response(&[view])])
        }
        Command::SelectYard { zone } => {
            session.refresh().await?;
            let board = session.snapshot().await?;
            if let Some(z) = zone.as_deref()
                && board.zone(z).is_none()
            {
                return Err(YardError::invalid(
                    FieldError::new(format!("unknown zone {:?}", z.trim()))
                        .in_column(Column::Zone),
                ));
            }
            Ok(vec![yard_response(&board, zone.as_deref())])
        }
        Command::SelectZones => {
            session.refresh().await?;
            let board = session.snapshot().await?;
            Ok(vec![zones_response(&board)])
        }
        Command::UpsertBookings { rows } => {
            let count = rows.len();
            session.apply(Edits::Upsert(rows)).await?;
            Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
        }
        Command::ReleaseBooking { booking_no } => {
            session.release(&booking_no).await?;
            Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
        }
        Command::AssignBay { booking_no } => {
            let bay = session.assign_bay(&booking_no).await?;
            let view = session.find(&booking_no).await?;
            Ok(vec![assignment_response(&view.booking_no, &bay)])
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

fn bookings_schema() -> Vec<FieldInfo> {
    Column::ALL.iter().map(|c| text_field(c.name())).collect()
}

fn yard_schema() -> Vec<FieldInfo> {
    vec![
        text_field("zone"),
        text_field("bay"),
        text_field("state"),
        text_field("booking_no"),
        text_field("time"),
        text_field("status"),
        text_field("next_1"),
        text_field("next_2"),
        int_field("queued"),
    ]
}

fn zones_schema() -> Vec<FieldInfo> {
    vec![
        text_field("zone"),
        int_field("bays"),
        int_field("occupied"),
        int_field("available"),
        int_field("bookings"),
        int_field("unassigned"),
    ]
}

fn assignment_schema() -> Vec<FieldInfo> {
    vec![text_field("booking_no"), text_field("zone"), text_field("bay")]
}

fn bookings_response(views: &[BookingView]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<DataRow>> = views
        .iter()
        .map(|v| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&v.booking_no)?;
            encoder.encode_field(&v.zone)?;
            encoder.encode_field(&v.bay)?;
            encoder.encode_field(&v.time.to_string())?;
            encoder.encode_field(&v.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// `B12 @ 09:30`
fn queue_entry(booking: Option<&Booking>) -> Option<String> {
    booking.map(|b| format!("{} @ {}", b.booking_no, b.time))
}

fn bay_row(schema: &Arc<Vec<FieldInfo>>, zone: &ZoneView, bay: &BayView) -> PgWireResult<DataRow> {
    let current = bay.current();
    let preview = bay.preview();
    let state = if bay.is_available() { "available" } else { "occupied" };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&zone.name)?;
    encoder.encode_field(&Some(bay.label()))?;
    encoder.encode_field(&state)?;
    encoder.encode_field(&current.map(|b| b.booking_no.to_string()))?;
    encoder.encode_field(&current.map(|b| b.time.to_string()))?;
    encoder.encode_field(&current.map(|b| b.status.as_str()))?;
    encoder.encode_field(&queue_entry(preview.first()))?;
    encoder.encode_field(&queue_entry(preview.get(1)))?;
    encoder.encode_field(&(bay.upcoming().len() as i64))?;
    Ok(encoder.take_row())
}

/// A booking in the zone that has no bay yet.
fn waiting_row(schema: &Arc<Vec<FieldInfo>>, zone: &ZoneView, booking: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&zone.name)?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&"unassigned")?;
    encoder.encode_field(&Some(booking.booking_no.to_string()))?;
    encoder.encode_field(&Some(booking.time.to_string()))?;
    encoder.encode_field(&Some(booking.status.as_str()))?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&0i64)?;
    Ok(encoder.take_row())
}

fn waiting_in<'a>(board: &'a YardSnapshot, zone: &'a ZoneView) -> impl Iterator<Item = &'a Booking> {
    board
        .unassigned
        .iter()
        .filter(|b| b.zone.trim().eq_ignore_ascii_case(&zone.name))
}

fn yard_response(board: &YardSnapshot, zone: Option<&str>) -> Response {
    let schema = Arc::new(yard_schema());
    let mut rows: Vec<PgWireResult<DataRow>> = Vec::new();
    let zones = board
        .zones
        .iter()
        .filter(|z| zone.is_none_or(|name| z.name.eq_ignore_ascii_case(name.trim())));

    for z in zones {
        rows.extend(z.bays.iter().map(|bay| bay_row(&schema, z, bay)));
        rows.extend(waiting_in(board, z).map(|b| waiting_row(&schema, z, b)));
    }
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn zones_response(board: &YardSnapshot) -> Response {
    let schema = Arc::new(zones_schema());
    let rows: Vec<PgWireResult<DataRow>> = board
        .zones
        .iter()
        .map(|z| {
            let unassigned = waiting_in(board, z).count();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&z.name)?;
            encoder.encode_field(&(z.bays.len() as i64))?;
            encoder.encode_field(&((z.bays.len() - z.free_bays()) as i64))?;
            encoder.encode_field(&(z.free_bays() as i64))?;
            encoder.encode_field(&(z.booking_count() as i64))?;
            encoder.encode_field(&(unassigned as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn assignment_row(schema: &Arc<Vec<FieldInfo>>, booking_no: &str, bay: &BayRef) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking_no)?;
    encoder.encode_field(&bay.zone)?;
    encoder.encode_field(&bay.label())?;
    Ok(encoder.take_row())
}

fn assignment_response(booking_no: &str, bay: &BayRef) -> Response {
    let schema = Arc::new(assignment_schema());
    let row = assignment_row(&schema, booking_no, bay);
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn schema_for(cmd: &Command) -> Vec<FieldInfo> {
    match cmd {
        Command::SelectBookings { .. } => bookings_schema(),
        Command::SelectYard { .. } => yard_schema(),
        Command::SelectZones => zones_schema(),
        Command::AssignBay { .. } => assignment_schema(),
        Command::UpsertBookings { .. } | Command::ReleaseBooking { .. } => vec![],
    }
}

/// Result columns of a statement that may still contain `$n` placeholders.
/// Each placeholder stands in as a non-empty literal so the statement parses.
fn describe_sql(sql: &str) -> Vec<FieldInfo> {
    let shaped = bind_params(sql, |_| Some("'_'".to_string()));
    sql::parse_sql(&shaped)
        .map(|cmd| schema_for(&cmd))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for YardHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(client, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct YardQueryParser;

#[async_trait]
impl QueryParser for YardQueryParser {
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
        Ok(describe_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for YardHandler {
    type Statement = String;
    type QueryParser = YardQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(client, cmd).await?;
        Ok(responses.remove(0))
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
            describe_sql(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_sql(
            &target.statement.statement,
        )))
    }
}

/// Rewrite every `$n` placeholder in one left-to-right pass. Text returned
/// by `bind` is copied through and never scanned again; a placeholder it
/// returns `None` for is left as written.
fn bind_params(sql: &str, mut bind: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        match after[..digits].parse::<usize>().ok().and_then(&mut bind) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    bind_params(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Bound values as quoted text literals, `NULL` for a null parameter.
fn bind_values<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    bind_params(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_values(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct YardFactory {
    handler: Arc<YardHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<YardAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl YardFactory {
    pub fn new(yard: Arc<Yard>, auth_source: YardAuthSource, office_user: String) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(YardHandler::new(yard, office_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for YardFactory {
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

/// Serve one client connection until it closes. Every connection gets its
/// own handler and therefore its own session.
pub async fn process_connection(
    socket: TcpStream,
    yard: Arc<Yard>,
    auth_source: YardAuthSource,
    office_user: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = YardFactory::new(yard, auth_source, office_user);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each yard error.
fn sqlstate(e: &YardError) -> &'static str {
    match e {
        YardError::Unauthorized => "42501",
        YardError::Conflict { .. } => "40001",
        YardError::ZoneFull { .. } => "53400",
        YardError::Validation(_) => "22023",
        YardError::StoreUnavailable(_) => "08006",
        YardError::NotFound(_) => "02000",
    }
}

fn yard_err(e: YardError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
