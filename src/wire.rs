use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

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

use crate::auth::PawbookAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError};

pub struct PawbookHandler {
    engine: Arc<Engine>,
    reserve_timeout: Duration,
    query_parser: Arc<PawbookQueryParser>,
}

impl PawbookHandler {
    pub fn new(engine: Arc<Engine>, reserve_timeout: Duration) -> Self {
        Self {
            engine,
            reserve_timeout,
            query_parser: Arc::new(PawbookQueryParser),
        }
    }

    async fn run(&self, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)?
    }

    /// Outer error is the engine's; inner is row encoding.
    async fn execute_command(&self, cmd: Command) -> Result<PgWireResult<Response>, EngineError> {
        let engine = &self.engine;
        Ok(match cmd {
            Command::InsertSlot {
                offer_id,
                start,
                end,
            } => slot_rows(vec![engine.create_slot(offer_id, start, end).await?]),
            Command::SelectSlot { id } => slot_rows(vec![engine.get_slot(id).await?]),
            Command::SelectSlots {
                offer_id,
                from,
                to,
                only_available,
            } => slot_rows(engine.list_slots(offer_id, only_available, from, to).await?),
            Command::UpdateSlot { id, patch } => slot_rows(vec![engine.update_slot(id, patch).await?]),
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                offer_id,
                slot_id,
                owner_id,
            } => {
                let booking = engine
                    .reserve_within(offer_id, slot_id, owner_id, self.reserve_timeout)
                    .await?;
                booking_rows(vec![booking])
            }
            Command::SelectBookings { filter } => booking_rows(match filter {
                BookingFilter::Id(id) => vec![engine.get_booking(id)?],
                BookingFilter::Owner(owner_id) => engine.list_bookings_by_owner(owner_id),
                BookingFilter::Offer(offer_id) => engine.list_bookings_by_offer(offer_id),
            }),
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertActivity {
                user_id,
                title,
                message,
                kind,
            } => {
                let activity = engine.emit_activity(user_id, &title, &message, &kind).await?;
                activity_rows(vec![activity])
            }
            Command::SelectActivities { user_id, limit } => {
                activity_rows(engine.list_activities(user_id, limit)?)
            }
        })
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("offer_id", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("is_booked", Type::BOOL),
        text_field("created_at", Type::VARCHAR),
        text_field("updated_at", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("offer_id", Type::VARCHAR),
        text_field("slot_id", Type::VARCHAR),
        text_field("owner_id", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
        text_field("updated_at", Type::VARCHAR),
    ]
}

fn activity_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("message", Type::VARCHAR),
        text_field("type", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let mut rows = Vec::with_capacity(items.len());
    for item in &items {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encode(&mut encoder, item)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    query_response(slot_schema(), slots, |enc, s| {
        enc.encode_field(&s.id.to_string())?;
        enc.encode_field(&s.offer_id.to_string())?;
        enc.encode_field(&format_ms(s.start))?;
        enc.encode_field(&format_ms(s.end))?;
        enc.encode_field(&s.is_booked)?;
        enc.encode_field(&format_ms(s.created_at))?;
        enc.encode_field(&format_ms(s.updated_at))
    })
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    query_response(booking_schema(), bookings, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.offer_id.to_string())?;
        enc.encode_field(&b.slot_id.to_string())?;
        enc.encode_field(&b.owner_id.to_string())?;
        enc.encode_field(&b.status.to_string())?;
        enc.encode_field(&format_ms(b.created_at))?;
        enc.encode_field(&format_ms(b.updated_at))
    })
}

fn activity_rows(activities: Vec<Activity>) -> PgWireResult<Response> {
    query_response(activity_schema(), activities, |enc, a| {
        enc.encode_field(&a.id.to_string())?;
        enc.encode_field(&a.user_id.to_string())?;
        enc.encode_field(&a.title)?;
        enc.encode_field(&a.message)?;
        enc.encode_field(&a.kind)?;
        enc.encode_field(&format_ms(a.created_at))
    })
}

/// Row shape a statement produces, judged from its text. Used for Describe,
/// where parameters are still unbound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("DELETE") {
        return vec![];
    }
    if upper.contains("ACTIVITIES") {
        activity_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("SLOTS") {
        slot_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for PawbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PawbookQueryParser;

#[async_trait]
impl QueryParser for PawbookQueryParser {
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
impl ExtendedQueryHandler for PawbookHandler {
    type Statement = String;
    type QueryParser = PawbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&substitute_params(portal)).await
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

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass over the template: each `$N` becomes a quoted
/// literal and everything else is copied as-is. Bound values are never
/// rescanned, so `$` text inside them stays literal. Placeholders with no
/// bound value are left untouched for the parser to reject.
fn bind_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PawbookFactory {
    handler: Arc<PawbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<PawbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl PawbookFactory {
    pub fn new(engine: Arc<Engine>, password: String, reserve_timeout: Duration) -> Self {
        let auth_source = PawbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PawbookHandler::new(engine, reserve_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PawbookFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
    reserve_timeout: Duration,
) -> std::io::Result<()> {
    let factory = PawbookFactory::new(engine, password, reserve_timeout);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    if matches!(e, EngineError::Cancelled) {
        return "57014";
    }
    match e.kind() {
        ErrorKind::InvalidInput => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23505",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_invalid_input() { "22023" } else { "42601" };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn params_counted_and_bound() {
        let sql = "SELECT * FROM slots WHERE id = $1";
        assert_eq!(count_params(sql), 1);
        assert_eq!(count_params("SELECT 1"), 0);

        let mut params: Vec<Option<Vec<u8>>> = (1..=10)
            .map(|i| Some(format!("v{i}").into_bytes()))
            .collect();
        params[1] = None;
        let sql = "x = $1, y = $2, z = $10";
        assert_eq!(count_params(sql), 10);
        assert_eq!(bind_text_params(sql, &params), "x = 'v1', y = NULL, z = 'v10'");
    }

    #[test]
    fn bound_params_are_quoted() {
        let params = vec![Some(b"it's".to_vec())];
        assert_eq!(bind_text_params("title = $1", &params), "title = 'it''s'");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let user = Ulid::new();
        let params = vec![
            Some(user.to_string().into_bytes()),
            Some(b"Pay $1 at the door".to_vec()),
            Some(b"$2$3 '".to_vec()),
        ];
        let sql = "INSERT INTO activities (user_id, title, message, type) VALUES ($1, $2, $3, 'note')";
        let bound = bind_text_params(sql, &params);
        assert_eq!(
            bound,
            format!(
                "INSERT INTO activities (user_id, title, message, type) \
                 VALUES ('{user}', 'Pay $1 at the door', '$2$3 ''', 'note')"
            )
        );

        assert_eq!(
            sql::parse_sql(&bound).unwrap(),
            Command::InsertActivity {
                user_id: user,
                title: "Pay $1 at the door".into(),
                message: "$2$3 '".into(),
                kind: "note".into(),
            }
        );
    }

    #[test]
    fn unbound_placeholders_and_bare_dollars_pass_through() {
        let params = vec![Some(b"x".to_vec())];
        assert_eq!(bind_text_params("$1 $2 $ $0", &params), "'x' $2 $ $0");
    }

    #[test]
    fn describe_picks_schema_by_table() {
        let names = |s: Vec<FieldInfo>| s.iter().map(|f| f.name().to_string()).collect::<Vec<_>>();
        assert_eq!(
            names(result_schema("SELECT * FROM bookings WHERE owner_id = $1"))[3],
            "owner_id"
        );
        assert_eq!(
            names(result_schema("insert into slots (offer_id, start_time, end_time) values ($1, $2, $3)"))[4],
            "is_booked"
        );
        assert_eq!(
            names(result_schema("SELECT * FROM activities WHERE user_id = $1"))[4],
            "type"
        );
        assert!(result_schema("DELETE FROM slots WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstates() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::AlreadyBooked(id)), "23505");
        assert_eq!(sqlstate(&EngineError::ActiveBooking(id)), "23505");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "22023");
        assert_eq!(sqlstate(&EngineError::Cancelled), "57014");
        assert_eq!(sqlstate(&EngineError::Storage("disk".into())), "XX000");
    }
}
