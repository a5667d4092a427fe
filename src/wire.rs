use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
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
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct OpdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<OpdQueryParser>,
}

impl OpdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(OpdQueryParser),
        }
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(
                observability::QUERIES_TOTAL,
                "command" => "unparsed",
                "status" => "error"
            )
            .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertDoctor { id, name } => {
                engine.register_doctor(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSlot {
                id,
                doctor_id,
                start,
                end,
                max_capacity,
            } => {
                engine
                    .open_slot(id, doctor_id, start, end, max_capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSlot { id } => {
                engine.close_slot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertToken {
                patient_name,
                category,
                slot_id,
            } => {
                let category: Category = category.parse().map_err(engine_err)?;
                let receipt = engine
                    .book_token(patient_name, category, slot_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![receipt_response(&receipt)?])
            }
            Command::InsertEmergencyToken {
                patient_name,
                slot_id,
            } => {
                let receipt = engine
                    .emergency_token(patient_name, slot_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![receipt_response(&receipt)?])
            }
            Command::DeleteToken { id } => {
                engine.cancel_token(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertNoShow { token_id } => {
                engine.mark_no_show(token_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertCompletion { token_id } => {
                engine.complete_token(token_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertReassignment { token_id, slot_id } => {
                engine
                    .reassign_token(token_id, slot_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectDoctors => {
                let schema = Arc::new(doctors_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_doctors()
                    .into_iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&d.id.to_string())?;
                        encoder.encode_field(&d.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots { doctor_id } => {
                let slots = engine.list_slots(doctor_id).map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.doctor_id.to_string())?;
                        encoder.encode_field(&s.span.start)?;
                        encoder.encode_field(&s.span.end)?;
                        encoder.encode_field(&(s.max_capacity as i32))?;
                        encoder.encode_field(&(s.occupied as i32))?;
                        encoder.encode_field(&if s.active { "OPEN" } else { "CLOSED" })?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSchedule { doctor_id } => {
                let schedules = match doctor_id {
                    Some(id) => vec![engine.doctor_schedule(id).await.map_err(engine_err)?],
                    None => engine.all_schedules().await,
                };
                let schema = Arc::new(schedule_schema());
                let mut rows: Vec<PgWireResult<_>> = Vec::new();
                for schedule in &schedules {
                    let doctor_id = schedule.doctor.id.to_string();
                    for slot in &schedule.slots {
                        let tokens = serde_json::to_string(&slot.tokens).map_err(|e| {
                            PgWireError::ApiError(Box::new(e))
                        })?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&doctor_id)?;
                        encoder.encode_field(&schedule.doctor.name)?;
                        encoder.encode_field(&slot.slot_id.to_string())?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&(slot.max_capacity as i32))?;
                        encoder.encode_field(&(slot.occupied as i32))?;
                        encoder.encode_field(&(slot.available as i32))?;
                        encoder.encode_field(&tokens)?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectToken { id } => {
                let token = engine.get_token(id).map_err(engine_err)?;
                Ok(vec![tokens_response(&[token])?])
            }
            Command::SelectStrandedTokens => Ok(vec![tokens_response(&engine.stranded_tokens())?]),
        }
    }
}

// ── Result shapes ────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn int4_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn doctors_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name")]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("doctor_id"),
        int8_field("start"),
        int8_field("end"),
        int4_field("max_capacity"),
        int4_field("occupied"),
        text_field("status"),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("doctor_id"),
        text_field("doctor_name"),
        text_field("slot_id"),
        int8_field("start"),
        int8_field("end"),
        int4_field("max_capacity"),
        int4_field("occupied"),
        int4_field("available"),
        text_field("tokens"),
    ]
}

fn token_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("token_number"),
        text_field("patient_name"),
        text_field("category"),
        int4_field("rank"),
        text_field("slot_id"),
        text_field("status"),
        int8_field("created_at"),
    ]
}

/// Token columns followed by how the booking was placed. Ids that do not
/// apply to the placement are empty strings.
fn receipt_schema() -> Vec<FieldInfo> {
    let mut schema = token_schema();
    schema.push(text_field("placement"));
    schema.push(text_field("displaced_token_id"));
    schema.push(text_field("relocated_to"));
    schema.push(text_field("requested_slot_id"));
    schema
}

fn encode_token(encoder: &mut DataRowEncoder, t: &Token) -> PgWireResult<()> {
    encoder.encode_field(&t.id.to_string())?;
    encoder.encode_field(&t.display_number())?;
    encoder.encode_field(&t.patient_name)?;
    encoder.encode_field(&t.category.as_str())?;
    encoder.encode_field(&(t.rank as i32))?;
    encoder.encode_field(&t.slot_id.to_string())?;
    encoder.encode_field(&t.status.as_str())?;
    encoder.encode_field(&t.created_at)?;
    Ok(())
}

fn tokens_response(tokens: &[Token]) -> PgWireResult<Response> {
    let schema = Arc::new(token_schema());
    let rows: Vec<PgWireResult<_>> = tokens
        .iter()
        .map(|t| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_token(&mut encoder, t)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn receipt_response(receipt: &BookingReceipt) -> PgWireResult<Response> {
    let schema = Arc::new(receipt_schema());
    let (displaced, relocated, requested) = match &receipt.placement {
        Placement::Direct | Placement::Overflow => (String::new(), String::new(), String::new()),
        Placement::Displaced {
            token_id,
            relocated_to,
        } => (
            token_id.to_string(),
            relocated_to.map(|id| id.to_string()).unwrap_or_default(),
            String::new(),
        ),
        Placement::Redirected { requested_slot } => {
            (String::new(), String::new(), requested_slot.to_string())
        }
    };

    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_token(&mut encoder, &receipt.token)?;
    encoder.encode_field(&receipt.placement.label())?;
    encoder.encode_field(&displaced)?;
    encoder.encode_field(&relocated)?;
    encoder.encode_field(&requested)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, by the table it reads or books into.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(sql) {
        Ok(Command::SelectDoctors) => doctors_schema(),
        Ok(Command::SelectSlots { .. }) => slots_schema(),
        Ok(Command::SelectSchedule { .. }) => schedule_schema(),
        Ok(Command::SelectToken { .. } | Command::SelectStrandedTokens) => token_schema(),
        Ok(Command::InsertToken { .. } | Command::InsertEmergencyToken { .. }) => receipt_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for OpdHandler {
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
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct OpdQueryParser;

#[async_trait]
impl QueryParser for OpdQueryParser {
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
        Ok(result_schema_for(&placeholders_as_strings(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for OpdHandler {
    type Statement = String;
    type QueryParser = OpdQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
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
        let schema = result_schema_for(&placeholders_as_strings(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let schema = result_schema_for(&placeholders_as_strings(&target.statement.statement));
        Ok(DescribePortalResponse::new(schema))
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

/// Rewrite every `$N` in one left-to-right pass. Text produced by `value_for`
/// is appended to the output and never scanned again.
fn bind_placeholders(sql: &str, value_for: impl Fn(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > start
                && let Ok(n) = sql[start..j].parse::<usize>()
            {
                out.push_str(&sql[copied..i]);
                out.push_str(&value_for(n));
                copied = j;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    out.push_str(&sql[copied..]);
    out
}

/// Replace `$N` placeholders with a parseable dummy so an unbound statement
/// can still be classified by table.
fn placeholders_as_strings(sql: &str) -> String {
    bind_placeholders(sql, |_| "'00000000000000000000000000'".to_string())
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params = &portal.parameters;
    bind_placeholders(&portal.statement.statement, |n| {
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            _ => "NULL".to_string(),
        }
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct OpdFactory {
    handler: Arc<OpdHandler>,
    noop: Arc<NoopHandler>,
}

impl OpdFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(OpdHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for OpdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, None, OpdFactory::new(engine)).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
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
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(
            count_params("INSERT INTO reassignments (token_id, slot_id) VALUES ($1, $2)"),
            2
        );
        assert_eq!(count_params("SELECT * FROM tokens WHERE id = $3"), 3);
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let sql = bind_placeholders(
            "INSERT INTO doctors (id, name) VALUES ($1, $2)",
            |n| match n {
                1 => "'01ARZ3NDEKTSV4RRFFQ69G5FAV'".to_string(),
                _ => "'Room $1 and $12'".to_string(),
            },
        );
        assert_eq!(
            sql,
            "INSERT INTO doctors (id, name) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'Room $1 and $12')"
        );
    }

    #[test]
    fn lone_dollar_left_alone() {
        assert_eq!(bind_placeholders("SELECT '$' FROM x", |_| "X".into()), "SELECT '$' FROM x");
    }

    #[test]
    fn booking_statements_describe_receipt() {
        let schema = result_schema_for(&placeholders_as_strings(
            "INSERT INTO tokens (patient_name, category, slot_id) VALUES ($1, $2, $3)",
        ));
        assert_eq!(schema.len(), receipt_schema().len());
    }

    #[test]
    fn mutations_have_no_result_columns() {
        let schema = result_schema_for(&placeholders_as_strings(
            "DELETE FROM tokens WHERE id = $1",
        ));
        assert!(schema.is_empty());
    }

    #[test]
    fn schedule_describe_without_params() {
        assert_eq!(
            result_schema_for("SELECT * FROM schedule").len(),
            schedule_schema().len()
        );
    }
}
