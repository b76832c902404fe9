use std::fmt::Debug;
use std::io;
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
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;

use crate::auth::SeatbookAuthSource;
use crate::limits::DEFAULT_PAGE_SIZE;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ConflictTarget, Decision};
use crate::venue::{Venue, VenueManager};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct SeatbookHandler {
    venues: Arc<VenueManager>,
    query_parser: Arc<SeatbookQueryParser>,
}

impl SeatbookHandler {
    pub fn new(venues: Arc<VenueManager>) -> Self {
        Self {
            venues,
            query_parser: Arc::new(SeatbookQueryParser),
        }
    }

    fn resolve_venue<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Venue>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.venues.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("venue error: {e}"),
            )))
        })
    }

    async fn run_sql(&self, venue: &Venue, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(venue, cmd).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, venue: &Venue, cmd: Command) -> PgWireResult<Response> {
        let engine = &venue.engine;
        let service = &venue.service;
        match cmd {
            Command::InsertSpace { id, name } => {
                engine.create_space(id, name).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertChair { id, space_id, name } => {
                engine
                    .create_chair(id, space_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeactivateResource { id } => {
                engine.deactivate_resource(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertUser {
                id,
                email,
                nickname,
            } => {
                engine
                    .register_user(id, email, nickname)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeactivateUser { id } => {
                engine.deactivate_user(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertReservation {
                id,
                user_email,
                resource_id,
                start,
                end,
            } => {
                service
                    .reserve(id, &user_email, resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelReservation { id } => {
                service.cancel(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::TransitionReservation { id, decision } => {
                match decision {
                    Decision::Approve => service.approve(id).await,
                    Decision::Reject => service.reject(id).await,
                    Decision::Complete => service.complete(id).await,
                }
                .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SelectReservation { id } => {
                let info = service.get_reservation(id).await.map_err(engine_err)?;
                Ok(reservation_rows(vec![info]))
            }
            Command::SelectUserReservations {
                user_email,
                status,
                after,
                page_size,
            } => {
                let page = PageRequest {
                    after,
                    size: page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                };
                let slice = service
                    .list_user_reservations(&user_email, status, page)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_page_rows(slice))
            }
            Command::SelectConflicts { target, at } => {
                let infos = match target {
                    ConflictTarget::Chair(id) => service.conflicts_for_chair_and_date(id, at).await,
                    ConflictTarget::Space(id) => service.conflicts_for_space_and_date(id, at).await,
                }
                .map_err(engine_err)?;
                Ok(reservation_rows(infos))
            }
            Command::InsertCheckIn { id, reservation_id } => {
                service
                    .check_in(id, reservation_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertWalkIn {
                id,
                user_email,
                resource_id,
                end,
            } => {
                service
                    .walk_in(id, &user_email, resource_id, end)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertCheckOut { id } => {
                service.check_out(id).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::ForceCheckOut { id } => {
                service.force_check_out(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectOccupancy { id } => {
                let occupancy = service.get_occupancy(id).await.map_err(engine_err)?;
                Ok(occupancy_rows(vec![occupancy]))
            }
            Command::SelectResources => Ok(resource_rows(engine.list_resources().await)),
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn format_ts(dt: DateTime) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource_type", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
    ]
}

fn reservation_page_schema() -> Vec<FieldInfo> {
    let mut fields = reservation_schema();
    fields.push(text_field("has_next", Type::BOOL));
    fields
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("source", Type::VARCHAR),
        text_field("resource_type", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource_type", Type::VARCHAR),
        text_field("space_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("active", Type::BOOL),
    ]
}

fn encode_reservation(
    encoder: &mut DataRowEncoder,
    info: &ReservationInfo,
) -> PgWireResult<()> {
    encoder.encode_field(&info.id.to_string())?;
    encoder.encode_field(&info.resource.type_name().to_string())?;
    encoder.encode_field(&info.resource.id().to_string())?;
    encoder.encode_field(&format_ts(info.start))?;
    encoder.encode_field(&format_ts(info.end))?;
    encoder.encode_field(&info.status.as_str().to_string())?;
    Ok(())
}

fn reservation_rows(infos: Vec<ReservationInfo>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = infos
        .iter()
        .map(|info| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_reservation(&mut encoder, info)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Every row repeats the slice's `has_next` so clients can page without a second query.
fn reservation_page_rows(slice: Slice<ReservationInfo>) -> Response {
    let schema = Arc::new(reservation_page_schema());
    let has_next = slice.has_next;
    let rows: Vec<PgWireResult<_>> = slice
        .content
        .iter()
        .map(|info| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_reservation(&mut encoder, info)?;
            encoder.encode_field(&has_next)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn occupancy_rows(occupancies: Vec<Occupancy>) -> Response {
    let schema = Arc::new(occupancy_schema());
    let rows: Vec<PgWireResult<_>> = occupancies
        .iter()
        .map(|occ| {
            let resource = occ.resource();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&occ.id.to_string())?;
            encoder.encode_field(&occ.source_name().to_string())?;
            encoder.encode_field(&resource.type_name().to_string())?;
            encoder.encode_field(&resource.id().to_string())?;
            encoder.encode_field(&occ.user_id().to_string())?;
            encoder.encode_field(&format_ts(occ.schedule.start))?;
            encoder.encode_field(&format_ts(occ.schedule.end))?;
            encoder.encode_field(&occ.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn resource_rows(resources: Vec<ResourceInfo>) -> Response {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = resources
        .iter()
        .map(|info| {
            let space_id = match info.kind {
                ResourceKind::Chair { space_id } => Some(space_id.to_string()),
                ResourceKind::Space => None,
            };
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&info.id.to_string())?;
            encoder.encode_field(&info.resource_ref().type_name().to_string())?;
            encoder.encode_field(&space_id)?;
            encoder.encode_field(&info.name)?;
            encoder.encode_field(&(info.lifecycle == Lifecycle::Active))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns a statement will produce, guessed from its text so that
/// Describe works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("OCCUPANCIES") {
        occupancy_schema()
    } else if upper.contains("RESOURCES") {
        resource_schema()
    } else if upper.contains("CONFLICTS") {
        reservation_schema()
    } else if upper.contains("RESERVATIONS") && upper.contains("USER_EMAIL") {
        reservation_page_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SeatbookHandler {
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
        let venue = self.resolve_venue(client)?;
        Ok(vec![self.run_sql(&venue, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatbookQueryParser;

#[async_trait]
impl QueryParser for SeatbookQueryParser {
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
impl ExtendedQueryHandler for SeatbookHandler {
    type Statement = String;
    type QueryParser = SeatbookQueryParser;

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
        let venue = self.resolve_venue(client)?;
        let sql = substitute_params(portal);
        self.run_sql(&venue, &sql).await
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

/// Inline bound text parameters as quoted literals. Higher indexes go first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SeatbookFactory {
    handler: Arc<SeatbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SeatbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SeatbookFactory {
    pub fn new(venues: Arc<VenueManager>, password: String) -> Self {
        let auth_source = SeatbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SeatbookHandler::new(venues)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatbookFactory {
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
    venues: Arc<VenueManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    process_socket(socket, tls, SeatbookFactory::new(venues, password)).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM resources"), 0);
        assert_eq!(
            count_params("INSERT INTO reservations VALUES ($1, $2, $3, $4, $5)"),
            5
        );
        assert_eq!(count_params("SELECT $12, $3"), 12);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn schema_follows_table() {
        let names = |fields: Vec<FieldInfo>| -> Vec<String> {
            fields.iter().map(|f| f.name().to_string()).collect()
        };
        assert!(result_schema("INSERT INTO spaces VALUES ($1)").is_empty());
        assert_eq!(
            names(result_schema(
                "SELECT * FROM reservations WHERE user_email = $1 AND status = $2"
            ))
            .last()
            .map(String::as_str),
            Some("has_next")
        );
        assert_eq!(
            result_schema("select * from conflicts where chair_id = $1 and at = $2").len(),
            6
        );
        assert_eq!(result_schema("SELECT * FROM occupancies WHERE id = $1").len(), 8);
        assert_eq!(result_schema("SELECT * FROM resources").len(), 5);
    }

    #[test]
    fn timestamps_render_with_seconds() {
        let dt = chrono::NaiveDate::from_ymd_opt(2030, 3, 15)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert_eq!(format_ts(dt), "2030-03-15 09:30:00");
    }
}
