use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::engine::{BookingRequest, Engine, EngineError, VeterinarianFilter};
use crate::model::*;
use crate::notify::NotifyChannel;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Connection metadata key holding the acting user.
const ACTOR_KEY: &str = "vetbook.actor";

/// One LISTEN on this connection.
struct Listener {
    channel: NotifyChannel,
    rx: broadcast::Receiver<Event>,
}

/// Handles one connection; the factory builds a fresh one per socket.
pub struct VetbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<VetbookQueryParser>,
    listeners: Mutex<Vec<Listener>>,
}

impl VetbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(VetbookQueryParser),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain every event queued on this connection's channels.
    fn pending_notifications(&self, pid: i32) -> Vec<NotificationResponse> {
        let mut pending = Vec::new();
        for listener in self.listeners().iter_mut() {
            loop {
                match listener.rx.try_recv() {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(payload) => pending.push(NotificationResponse::new(
                            pid,
                            listener.channel.to_string(),
                            payload,
                        )),
                        Err(e) => tracing::warn!(error = %e, "unencodable notification dropped"),
                    },
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %listener.channel, skipped, "listener fell behind");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        pending
    }

    /// Notifications go out between commands, ahead of the command's own
    /// response. An idle connection receives them with its next query.
    async fn forward_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let (pid, _) = client.pid_and_secret_key();
        for notification in self.pending_notifications(pid) {
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("clinic unavailable: {e}"))
        })
    }

    /// Parse, bind the actor, run, and record RED metrics.
    async fn run_query<C: ClientInfo>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        match cmd {
            Command::SetActor { actor } => {
                client.metadata_mut().insert(ACTOR_KEY.to_string(), actor.to_string());
                return Ok(vec![Response::Execution(Tag::new("SET"))]);
            }
            Command::ResetActor => {
                client.metadata_mut().remove(ACTOR_KEY);
                return Ok(vec![Response::Execution(Tag::new("RESET"))]);
            }
            _ => {}
        }

        let engine = self.resolve_engine(client)?;
        let actor = client
            .metadata()
            .get(ACTOR_KEY)
            .and_then(|s| Ulid::from_string(s).ok());
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Option<Ulid>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let acting = || actor.ok_or_else(no_actor);
        match cmd {
            Command::SetActor { .. } | Command::ResetActor => Ok(vec![]),
            Command::Listen { channel } => {
                let rx = engine.listen(acting()?, channel).map_err(engine_err)?;
                let mut listeners = self.listeners();
                if !listeners.iter().any(|l| l.channel == channel) {
                    listeners.push(Listener { channel, rx });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let dropped: Vec<Listener> = {
                    let mut listeners = self.listeners();
                    let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *listeners)
                        .into_iter()
                        .partition(|l| channel.is_none_or(|c| c == l.channel));
                    *listeners = kept;
                    dropped
                };
                for listener in dropped {
                    let key = listener.channel.key();
                    drop(listener);
                    engine.notify.prune(&key);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::InsertUser { id, name, email, role } => {
                engine
                    .register_user(actor, id, &name, &email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertSpecialization { id, name, description } => {
                engine
                    .create_specialization(acting()?, id, &name, description)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertVeterinarian {
                id,
                user_id,
                license_number,
                experience_years,
                consultation_fee,
                bio,
            } => {
                engine
                    .create_veterinarian(
                        acting()?,
                        id,
                        user_id,
                        &license_number,
                        experience_years,
                        consultation_fee,
                        bio,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::AssignSpecialization {
                veterinarian_id,
                specialization_id,
            } => {
                engine
                    .assign_specialization(acting()?, veterinarian_id, specialization_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertPet { id, profile } => {
                engine
                    .register_pet(acting()?, id, profile)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdatePet { id, profile } => {
                engine
                    .update_pet(acting()?, id, profile)
                    .await
                    .map_err(engine_err)?;
                Ok(updated())
            }
            Command::DeletePet { id } => {
                engine.remove_pet(acting()?, id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertTimeSlot {
                id,
                veterinarian_id,
                start,
                end,
                blocked,
            } => {
                engine
                    .create_time_slot(acting()?, id, veterinarian_id, start, end, blocked)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteTimeSlot { id } => {
                engine
                    .remove_time_slot(acting()?, id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::BlockSlot { time_slot_id } => {
                engine
                    .set_slot_blocked(acting()?, time_slot_id, true)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UnblockSlot { time_slot_id } => {
                engine
                    .set_slot_blocked(acting()?, time_slot_id, false)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertAppointment {
                id,
                veterinarian_id,
                pet_id,
                time_slot_id,
            } => {
                let request = BookingRequest {
                    appointment_id: id,
                    veterinarian_id,
                    pet_id,
                    time_slot_id,
                };
                engine
                    .book_appointment(acting()?, request)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelAppointment { id } => {
                engine
                    .cancel_appointment(acting()?, id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::AdvanceAppointment {
                appointment_id,
                status,
            } => {
                engine
                    .advance_appointment(acting()?, appointment_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertPayment {
                id,
                appointment_id,
                gateway,
                transaction_id,
            } => {
                engine
                    .initiate_payment(acting()?, id, appointment_id, gateway, &transaction_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SettlePayment {
                payment_id,
                status,
                reference,
            } => {
                engine
                    .settle_payment(acting()?, payment_id, status, reference)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertHomepageContent {
                id,
                title,
                description,
                image_path,
                order,
                published,
            } => {
                engine
                    .create_homepage_content(
                        acting()?,
                        id,
                        &title,
                        description,
                        image_path,
                        order,
                        published,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteHomepageContent { id } => {
                engine
                    .remove_homepage_content(acting()?, id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SetHomepagePublished { id, published } => {
                engine
                    .set_homepage_published(acting()?, id, published)
                    .await
                    .map_err(engine_err)?;
                Ok(if published { inserted() } else { deleted() })
            }
            Command::SelectAvailability {
                veterinarian_id,
                start,
                end,
            } => {
                let slots = engine
                    .available_slots(veterinarian_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(slots))
            }
            Command::SelectTimeSlots {
                veterinarian_id,
                start,
                end,
            } => {
                let slots = engine
                    .slots_for_veterinarian(acting()?, veterinarian_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(slots))
            }
            Command::SelectOpenWindows {
                veterinarian_id,
                start,
                end,
            } => {
                let windows = engine
                    .open_windows_for(veterinarian_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let vet = veterinarian_id.to_string();
                Ok(rows(open_windows_schema(), windows, |enc, w| {
                    enc.encode_field(&vet)?;
                    enc.encode_field(&w.start)?;
                    enc.encode_field(&w.end)
                }))
            }
            Command::SelectVeterinarians {
                query,
                specialization_id,
                page,
            } => {
                let filter = VeterinarianFilter {
                    query,
                    specialization_id,
                    page,
                };
                Ok(veterinarian_rows(engine.search_veterinarians(&filter)))
            }
            Command::SelectVeterinarian { id } => {
                let vet = engine.veterinarian(id).map_err(engine_err)?;
                Ok(veterinarian_rows(vec![vet]))
            }
            Command::SelectSpecializations => Ok(rows(
                specializations_schema(),
                engine.list_specializations(),
                |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.description)
                },
            )),
            Command::SelectPets => Ok(rows(pets_schema(), engine.pets_for(acting()?), |enc, p| {
                enc.encode_field(&p.id.to_string())?;
                enc.encode_field(&p.profile.name)?;
                enc.encode_field(&p.profile.species.as_str())?;
                enc.encode_field(&p.profile.breed)?;
                enc.encode_field(&(p.profile.age as i32))?;
                enc.encode_field(&format_minor(i64::from(p.profile.weight_grams), 3))?;
                enc.encode_field(&p.profile.gender.as_str())?;
                enc.encode_field(&p.profile.medical_notes)
            })),
            Command::SelectAppointments { page } => {
                let details = engine
                    .appointments_for(acting()?, page)
                    .await
                    .map_err(engine_err)?;
                Ok(appointment_rows(details))
            }
            Command::SelectAppointment { id } => {
                let detail = engine
                    .appointment_detail(acting()?, id)
                    .await
                    .map_err(engine_err)?;
                Ok(appointment_rows(vec![detail]))
            }
            Command::SelectPayments => Ok(rows(
                payments_schema(),
                engine.payments_for(acting()?),
                |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.appointment_id.to_string())?;
                    enc.encode_field(&p.gateway.as_str())?;
                    enc.encode_field(&p.transaction_id)?;
                    enc.encode_field(&format_minor(p.amount, 2))?;
                    enc.encode_field(&format_minor(p.service_charge, 2))?;
                    enc.encode_field(&format_minor(p.total_amount, 2))?;
                    enc.encode_field(&p.status.as_str())?;
                    enc.encode_field(&p.reference)?;
                    enc.encode_field(&p.created_at)
                },
            )),
            Command::SelectNotifications => Ok(rows(
                notifications_schema(),
                engine.notifications_for(acting()?),
                |enc, n| {
                    enc.encode_field(&n.id.to_string())?;
                    enc.encode_field(&n.kind.as_str())?;
                    enc.encode_field(&n.appointment_id.to_string())?;
                    enc.encode_field(&n.payload)?;
                    enc.encode_field(&n.created_at)
                },
            )),
            Command::SelectHomepageContents => Ok(rows(
                homepage_schema(),
                engine.homepage_contents(actor),
                |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.title)?;
                    enc.encode_field(&c.description)?;
                    enc.encode_field(&c.image_path)?;
                    enc.encode_field(&c.order)?;
                    enc.encode_field(&c.is_published)
                },
            )),
        }
    }
}

fn inserted() -> Vec<Response> {
    vec![Response::Execution(Tag::new("INSERT").with_rows(1))]
}

fn updated() -> Vec<Response> {
    vec![Response::Execution(Tag::new("UPDATE").with_rows(1))]
}

fn deleted() -> Vec<Response> {
    vec![Response::Execution(Tag::new("DELETE").with_rows(1))]
}

/// Encode one row per item against a fixed schema.
fn rows<T, F>(schema: Vec<FieldInfo>, items: Vec<T>, mut encode: F) -> Vec<Response>
where
    F: FnMut(&mut DataRowEncoder, &T) -> PgWireResult<()>,
{
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    vec![Response::Query(QueryResponse::new(schema, stream::iter(data)))]
}

fn slot_rows(slots: Vec<SlotInfo>) -> Vec<Response> {
    rows(slots_schema(), slots, |enc, s| {
        enc.encode_field(&s.id.to_string())?;
        enc.encode_field(&s.veterinarian_id.to_string())?;
        enc.encode_field(&s.start)?;
        enc.encode_field(&s.end)?;
        enc.encode_field(&s.is_available)?;
        enc.encode_field(&s.is_blocked)
    })
}

fn veterinarian_rows(vets: Vec<VeterinarianInfo>) -> Vec<Response> {
    rows(veterinarians_schema(), vets, |enc, v| {
        enc.encode_field(&v.id.to_string())?;
        enc.encode_field(&v.user_id.to_string())?;
        enc.encode_field(&v.name)?;
        enc.encode_field(&v.license_number)?;
        enc.encode_field(&(v.experience_years as i32))?;
        enc.encode_field(&format_minor(v.consultation_fee, 2))?;
        enc.encode_field(&v.bio)?;
        enc.encode_field(&v.specializations.join(", "))
    })
}

fn appointment_rows(details: Vec<AppointmentDetail>) -> Vec<Response> {
    rows(appointments_schema(), details, |enc, d| {
        let a = &d.appointment;
        enc.encode_field(&a.id.to_string())?;
        enc.encode_field(&a.pet_id.to_string())?;
        enc.encode_field(&d.pet_name)?;
        enc.encode_field(&a.veterinarian_id.to_string())?;
        enc.encode_field(&d.veterinarian_name)?;
        enc.encode_field(&a.pet_owner_id.to_string())?;
        enc.encode_field(&d.pet_owner_name)?;
        enc.encode_field(&a.time_slot_id.to_string())?;
        enc.encode_field(&d.start)?;
        enc.encode_field(&d.end)?;
        enc.encode_field(&a.status.as_str())?;
        enc.encode_field(&a.created_at)
    })
}

/// Minor units as a fixed-point decimal string: `format_minor(50050, 2)` is "500.50".
fn format_minor(value: i64, scale: u32) -> String {
    let unit = 10_i64.pow(scale);
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let unit = unit as u64;
    format!(
        "{sign}{}.{:0width$}",
        abs / unit,
        abs % unit,
        width = scale as usize
    )
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("veterinarian_id"),
        int8("start"),
        int8("end"),
        boolean("is_available"),
        boolean("is_blocked"),
    ]
}

fn open_windows_schema() -> Vec<FieldInfo> {
    vec![text("veterinarian_id"), int8("start"), int8("end")]
}

fn veterinarians_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("name"),
        text("license_number"),
        int4("experience_years"),
        text("consultation_fee"),
        text("bio"),
        text("specializations"),
    ]
}

fn specializations_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), text("description")]
}

fn pets_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("species"),
        text("breed"),
        int4("age"),
        text("weight"),
        text("gender"),
        text("medical_notes"),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("pet_id"),
        text("pet_name"),
        text("veterinarian_id"),
        text("veterinarian_name"),
        text("pet_owner_id"),
        text("pet_owner_name"),
        text("time_slot_id"),
        int8("start"),
        int8("end"),
        text("status"),
        int8("created_at"),
    ]
}

fn payments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("appointment_id"),
        text("gateway"),
        text("transaction_id"),
        text("amount"),
        text("service_charge"),
        text("total_amount"),
        text("status"),
        text("reference"),
        int8("created_at"),
    ]
}

fn notifications_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("kind"),
        text("appointment_id"),
        text("payload"),
        int8("created_at"),
    ]
}

fn homepage_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("title"),
        text("description"),
        text("image_path"),
        int4("order"),
        boolean("is_published"),
    ]
}

/// Row description for a statement, empty for anything that is not a SELECT.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("availability") | Some("time_slots") => slots_schema(),
        Some("open_windows") => open_windows_schema(),
        Some("veterinarians") => veterinarians_schema(),
        Some("specializations") => specializations_schema(),
        Some("pets") => pets_schema(),
        Some("appointments") => appointments_schema(),
        Some("payments") => payments_schema(),
        Some("notifications") => notifications_schema(),
        Some("homepage_contents") => homepage_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for VetbookHandler {
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
        let result = self.run_query(client, query).await;
        self.forward_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VetbookQueryParser;

#[async_trait]
impl QueryParser for VetbookQueryParser {
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
impl ExtendedQueryHandler for VetbookHandler {
    type Statement = String;
    type QueryParser = VetbookQueryParser;

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
        let result = self.run_query(client, &sql).await;
        self.forward_notifications(client).await?;
        result?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "internal error".into()))
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

enum Piece<'a> {
    Text(&'a str),
    /// `$N`, one-based.
    Param(usize),
}

/// Split `sql` into literal text and `$N` placeholders in one left-to-right
/// pass. Dollar signs inside quoted strings and identifiers are text.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which keeps us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|c| !c.is_ascii_digit())
                    .map_or(bytes.len(), |p| i + 1 + p);
                match sql[i + 1..digits_end].parse::<usize>() {
                    Ok(n) if n > 0 => {
                        pieces.push(Piece::Text(&sql[text_start..i]));
                        pieces.push(Piece::Param(n));
                        i = digits_end;
                        text_start = i;
                    }
                    _ => i += 1,
                }
            }
            None => i += 1,
        }
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// The highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(*n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Inline text-format parameters as quoted literals. Bound values are never
/// rescanned, so a `$N` inside one stays text.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut bound = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => bound.push_str(text),
            Piece::Param(n) => match params.get(n - 1) {
                Some(Some(value)) => {
                    bound.push('\'');
                    bound.push_str(&value.replace('\'', "''"));
                    bound.push('\'');
                }
                Some(None) => bound.push_str("NULL"),
                // Unbound: leave it for the parser to reject.
                None => {
                    bound.push('$');
                    bound.push_str(&n.to_string());
                }
            },
        }
    }
    bound
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|param| {
            param
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        })
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

/// One server-wide password. The acting user is chosen per session with
/// `SET actor`, not by the login role.
#[derive(Debug)]
struct ServerPassword(String);

#[async_trait]
impl AuthSource for ServerPassword {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(
            user = login.user().unwrap_or("-"),
            clinic = login.database().unwrap_or("default"),
            "password login"
        );
        Ok(Password::new(None, self.0.as_bytes().to_vec()))
    }
}

pub struct VetbookFactory {
    handler: Arc<VetbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ServerPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VetbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ServerPassword(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VetbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VetbookFactory {
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
) -> io::Result<()> {
    let factory = VetbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn no_actor() -> PgWireError {
    user_error(
        "28000",
        "no acting user: run SET actor = '<user id>' first".into(),
    )
}

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotUnavailable(_) | EngineError::Overlap(_) => "23P01",
        EngineError::PetNotOwned(_) | EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) | EngineError::Duplicate(_) => "23505",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::InUse(_) => "23503",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

/// Internal failures are already logged by the engine; clients get no details.
fn client_message(e: &EngineError) -> String {
    if e.is_precondition() {
        e.to_string()
    } else {
        "internal error".to_string()
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), client_message(&e))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_and_weight_formatting() {
        assert_eq!(format_minor(50_050, 2), "500.50");
        assert_eq!(format_minor(5_000, 2), "50.00");
        assert_eq!(format_minor(28_500, 3), "28.500");
        assert_eq!(format_minor(-125, 2), "-1.25");
    }

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM pets"), 0);
        assert_eq!(
            count_params("INSERT INTO appointments VALUES ($1, $2, $3, $10)"),
            10
        );
    }

    #[test]
    fn placeholders_inside_quotes_are_text() {
        assert_eq!(count_params("SELECT * FROM pets WHERE name = '$4' AND id = $1"), 1);
        assert_eq!(count_params("SELECT \"$9\" FROM pets"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO pets (id, name, medical_notes) VALUES ($1, $2, $3)";
        let params = vec![
            Some("01J0000000000000000000000A".to_string()),
            Some("Bella".to_string()),
            Some("costs $2 per dose, owner's choice".to_string()),
        ];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO pets (id, name, medical_notes) VALUES \
             ('01J0000000000000000000000A', 'Bella', 'costs $2 per dose, owner''s choice')"
        );
    }

    #[test]
    fn null_and_two_digit_parameters() {
        let mut params: Vec<Option<String>> = (1..=10).map(|n| Some(n.to_string())).collect();
        params[1] = None;
        assert_eq!(bind_params("VALUES ($1, $2, $10)", &params), "VALUES ('1', NULL, '10')");
        assert_eq!(bind_params("VALUES ($11)", &params), "VALUES ($11)");
    }

    #[test]
    fn error_codes() {
        let slot = Ulid::new();
        assert_eq!(sqlstate(&EngineError::SlotUnavailable(slot)), "23P01");
        assert_eq!(sqlstate(&EngineError::PetNotOwned(slot)), "42501");
        assert_eq!(sqlstate(&EngineError::Duplicate("email")), "23505");
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                from: AppointmentStatus::Completed,
                to: AppointmentStatus::Cancelled,
            }),
            "55000"
        );

        let wal = EngineError::WalError("disk full".into());
        assert_eq!(sqlstate(&wal), "XX000");
        assert_eq!(client_message(&wal), "internal error");
        assert_eq!(
            client_message(&EngineError::SlotUnavailable(slot)),
            "The selected time slot is no longer available."
        );
    }

    #[test]
    fn schemas_follow_select_table() {
        assert_eq!(result_schema("SELECT * FROM availability WHERE veterinarian_id = $1").len(), 6);
        assert_eq!(result_schema("SELECT * FROM payments").len(), 10);
        assert!(result_schema("DELETE FROM pets WHERE id = $1").is_empty());
    }
}
