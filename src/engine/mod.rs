mod availability;
mod booking;
mod error;
mod mutations;
mod queries;
mod validation;

pub use availability::{bookable_in_window, merge_overlapping, open_windows};
pub use booking::BookingRequest;
pub use error::EngineError;
pub use queries::VeterinarianFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notifier::Outbox;
use crate::notify::{NotifyChannel, NotifyHub};
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;
pub type SharedSchedule = Arc<RwLock<Schedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), error = %e, "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes never ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = wal.compact(&events);
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Which lock an event is applied under.
enum Scope {
    /// One slot's row lock.
    Slot(Ulid),
    /// One veterinarian's schedule lock.
    Schedule(Ulid),
    /// Catalog maps (users, pets, payments, ...).
    Catalog,
}

fn event_scope(event: &Event) -> Scope {
    match event {
        Event::SlotBlockChanged { id, .. } => Scope::Slot(*id),
        Event::AppointmentBooked { time_slot_id, .. }
        | Event::AppointmentCancelled { time_slot_id, .. }
        | Event::AppointmentStatusChanged { time_slot_id, .. } => Scope::Slot(*time_slot_id),
        Event::SlotCreated { veterinarian_id, .. } | Event::SlotRemoved { veterinarian_id, .. } => {
            Scope::Schedule(*veterinarian_id)
        }
        Event::SlotRestored { slot } => Scope::Schedule(slot.veterinarian_id),
        _ => Scope::Catalog,
    }
}

/// All state for one clinic.
///
/// Lock order: `gate` (read) → `catalog` → schedule → slot. Every mutation
/// holds the gate for reading; compaction takes it for writing so its
/// snapshot never misses an event that is already in the WAL.
pub struct Engine {
    pub slots: DashMap<Ulid, SharedSlotState>,
    /// Veterinarian id → their slots.
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    /// Appointment id → time slot id.
    pub(super) appointment_to_slot: DashMap<Ulid, Ulid>,
    /// Pet owner id → appointment ids, oldest first.
    pub(super) owner_appointments: DashMap<Ulid, Vec<Ulid>>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) specializations: DashMap<Ulid, Specialization>,
    pub(super) veterinarians: DashMap<Ulid, Veterinarian>,
    /// User id → veterinarian profile id.
    pub(super) vet_by_user: DashMap<Ulid, Ulid>,
    pub(super) licenses: DashMap<String, Ulid>,
    pub(super) pets: DashMap<Ulid, Pet>,
    pub(super) payments: DashMap<Ulid, Payment>,
    pub(super) transactions: DashMap<String, Ulid>,
    pub(super) homepage: DashMap<Ulid, HomepageContent>,
    /// User id → notifications, oldest first.
    pub(super) inbox: DashMap<Ulid, Vec<Notification>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) gate: RwLock<()>,
    /// Serializes check-then-write on the catalog maps.
    pub(super) catalog: Mutex<()>,
    pub(super) outbox: Outbox,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, outbox: Outbox) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            schedules: DashMap::new(),
            appointment_to_slot: DashMap::new(),
            owner_appointments: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            specializations: DashMap::new(),
            veterinarians: DashMap::new(),
            vet_by_user: DashMap::new(),
            licenses: DashMap::new(),
            pets: DashMap::new(),
            payments: DashMap::new(),
            transactions: DashMap::new(),
            homepage: DashMap::new(),
            inbox: DashMap::new(),
            wal_tx,
            gate: RwLock::new(()),
            catalog: Mutex::new(()),
            outbox,
            notify,
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            engine.replay_event(event)?;
        }
        tracing::debug!(path = %wal_path.display(), events = events.len(), "WAL replayed");

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: lock contended");
        match event_scope(event) {
            Scope::Slot(slot_id) => {
                if let Some(slot) = self.get_slot(&slot_id) {
                    let mut guard = slot.try_write().map_err(|_| contended())?;
                    self.apply_to_slot(&mut guard, event);
                }
            }
            Scope::Schedule(vet_id) => {
                let schedule = self.schedule(vet_id);
                let mut guard = schedule.try_write().map_err(|_| contended())?;
                self.apply_to_schedule(&mut guard, event);
            }
            Scope::Catalog => self.apply_to_catalog(event),
        }
        Ok(())
    }

    /// Apply a slot-scoped event. The caller holds the slot's write lock.
    fn apply_to_slot(&self, slot: &mut SlotState, event: &Event) {
        match event {
            Event::SlotBlockChanged { blocked, .. } => slot.is_blocked = *blocked,
            Event::AppointmentBooked {
                id,
                time_slot_id,
                veterinarian_id,
                pet_owner_id,
                pet_id,
                at,
            } => {
                slot.appointments.push(Appointment {
                    id: *id,
                    pet_owner_id: *pet_owner_id,
                    veterinarian_id: *veterinarian_id,
                    pet_id: *pet_id,
                    time_slot_id: *time_slot_id,
                    status: AppointmentStatus::Pending,
                    created_at: *at,
                    updated_at: *at,
                });
                slot.is_available = false;
                self.index_appointment(*id, *time_slot_id, *pet_owner_id);
            }
            Event::AppointmentCancelled { id, release_slot, at, .. } => {
                if let Some(appointment) = slot.appointment_mut(*id) {
                    appointment.status = AppointmentStatus::Cancelled;
                    appointment.updated_at = *at;
                }
                if *release_slot {
                    slot.is_available = true;
                }
            }
            Event::AppointmentStatusChanged { id, status, at, .. } => {
                if let Some(appointment) = slot.appointment_mut(*id) {
                    appointment.status = *status;
                    appointment.updated_at = *at;
                }
            }
            _ => {}
        }
    }

    /// Apply a schedule-scoped event (caller holds the schedule's write lock).
    fn apply_to_schedule(&self, schedule: &mut Schedule, event: &Event) {
        match event {
            Event::SlotCreated {
                id,
                veterinarian_id,
                span,
                blocked,
            } => {
                schedule.insert(SlotRef { id: *id, span: *span });
                let slot = SlotState::new(*id, *veterinarian_id, *span, *blocked);
                self.slots.insert(*id, Arc::new(RwLock::new(slot)));
            }
            Event::SlotRestored { slot } => {
                schedule.insert(SlotRef {
                    id: slot.id,
                    span: slot.span,
                });
                for appointment in &slot.appointments {
                    self.index_appointment(appointment.id, slot.id, appointment.pet_owner_id);
                }
                self.slots.insert(slot.id, Arc::new(RwLock::new(slot.clone())));
            }
            Event::SlotRemoved { id, .. } => {
                schedule.remove(*id);
                self.slots.remove(id);
            }
            _ => {}
        }
    }

    fn apply_to_catalog(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, email, role } => {
                self.emails.insert(email.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        role: *role,
                    },
                );
            }
            Event::SpecializationCreated { id, name, description } => {
                self.specializations.insert(
                    *id,
                    Specialization {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                    },
                );
            }
            Event::VeterinarianCreated {
                id,
                user_id,
                license_number,
                experience_years,
                consultation_fee,
                bio,
            } => {
                self.licenses.insert(license_number.clone(), *id);
                self.vet_by_user.insert(*user_id, *id);
                self.veterinarians.insert(
                    *id,
                    Veterinarian {
                        id: *id,
                        user_id: *user_id,
                        license_number: license_number.clone(),
                        experience_years: *experience_years,
                        consultation_fee: *consultation_fee,
                        bio: bio.clone(),
                        specializations: Vec::new(),
                    },
                );
            }
            Event::SpecializationAssigned {
                veterinarian_id,
                specialization_id,
            } => {
                if let Some(mut vet) = self.veterinarians.get_mut(veterinarian_id)
                    && !vet.specializations.contains(specialization_id)
                {
                    vet.specializations.push(*specialization_id);
                }
            }
            Event::PetRegistered { id, owner_id, profile } => {
                self.pets.insert(
                    *id,
                    Pet {
                        id: *id,
                        owner_id: *owner_id,
                        profile: profile.clone(),
                        deleted_at: None,
                    },
                );
            }
            Event::PetUpdated { id, profile } => {
                if let Some(mut pet) = self.pets.get_mut(id) {
                    pet.profile = profile.clone();
                }
            }
            Event::PetRemoved { id, at } => {
                if let Some(mut pet) = self.pets.get_mut(id) {
                    pet.deleted_at = Some(*at);
                }
            }
            Event::PaymentInitiated {
                id,
                appointment_id,
                user_id,
                gateway,
                transaction_id,
                amount,
                service_charge,
                at,
            } => {
                self.transactions.insert(transaction_id.clone(), *id);
                self.payments.insert(
                    *id,
                    Payment {
                        id: *id,
                        appointment_id: *appointment_id,
                        user_id: *user_id,
                        gateway: *gateway,
                        transaction_id: transaction_id.clone(),
                        amount: *amount,
                        service_charge: *service_charge,
                        total_amount: amount + service_charge,
                        status: PaymentStatus::Pending,
                        reference: None,
                        created_at: *at,
                        settled_at: None,
                    },
                );
            }
            Event::PaymentSettled { id, status, reference, at } => {
                if let Some(mut payment) = self.payments.get_mut(id) {
                    payment.status = *status;
                    payment.reference = reference.clone();
                    payment.settled_at = Some(*at);
                }
            }
            Event::HomepageContentCreated {
                id,
                title,
                description,
                image_path,
                order,
                published,
            } => {
                self.homepage.insert(
                    *id,
                    HomepageContent {
                        id: *id,
                        title: title.clone(),
                        description: description.clone(),
                        image_path: image_path.clone(),
                        order: *order,
                        is_published: *published,
                    },
                );
            }
            Event::HomepagePublicationChanged { id, published } => {
                if let Some(mut content) = self.homepage.get_mut(id) {
                    content.is_published = *published;
                }
            }
            Event::HomepageContentRemoved { id } => {
                self.homepage.remove(id);
            }
            Event::NotificationRecorded {
                id,
                user_id,
                kind,
                appointment_id,
                payload,
                at,
            } => {
                let mut inbox = self.inbox.entry(*user_id).or_default();
                inbox.push(Notification {
                    id: *id,
                    user_id: *user_id,
                    kind: *kind,
                    appointment_id: *appointment_id,
                    payload: payload.clone(),
                    created_at: *at,
                });
                let overflow = inbox.len().saturating_sub(crate::limits::MAX_NOTIFICATIONS_PER_USER);
                inbox.drain(..overflow);
            }
            // Slot and schedule events never reach the catalog.
            _ => {}
        }
    }

    fn index_appointment(&self, appointment_id: Ulid, slot_id: Ulid, pet_owner_id: Ulid) {
        self.appointment_to_slot.insert(appointment_id, slot_id);
        let mut owned = self.owner_appointments.entry(pet_owner_id).or_default();
        if !owned.contains(&appointment_id) {
            owned.push(appointment_id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for an event under a slot's write lock.
    pub(super) async fn persist_slot_event(
        &self,
        slot: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_slot(slot, event);
        self.notify.send(slot.veterinarian_id, event);
        Ok(())
    }

    /// WAL-append + apply + notify for an event under a schedule's write lock.
    pub(super) async fn persist_schedule_event(
        &self,
        veterinarian_id: Ulid,
        schedule: &mut Schedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_schedule(schedule, event);
        self.notify.send(veterinarian_id, event);
        Ok(())
    }

    /// WAL-append + apply for a catalog event, broadcasting on `channel` if given.
    pub(super) async fn persist_catalog_event(
        &self,
        channel: Option<Ulid>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_catalog(event);
        if let Some(key) = channel {
            self.notify.send(key, event);
        }
        Ok(())
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a slot that is still in the clinic. A removal that won the
    /// lock first leaves the waiter holding an orphaned state, which must
    /// never take a write.
    pub(super) async fn live_slot_write(&self, id: &Ulid) -> Option<OwnedRwLockWriteGuard<SlotState>> {
        let slot = self.get_slot(id)?;
        let guard = slot.clone().write_owned().await;
        let live = self
            .slots
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &slot));
        live.then_some(guard)
    }

    /// The veterinarian's schedule, created empty on first use.
    pub(super) fn schedule(&self, veterinarian_id: Ulid) -> SharedSchedule {
        self.schedules.entry(veterinarian_id).or_default().value().clone()
    }

    /// Lookup appointment → slot, acquire the slot's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot = self.appointment_slot(appointment_id)?;
        let guard = slot.write_owned().await;
        // The index entry may be a booking still in flight.
        if guard.appointment(*appointment_id).is_none() {
            return Err(EngineError::NotFound(*appointment_id));
        }
        Ok(guard)
    }

    pub(super) async fn resolve_appointment_read(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<SlotState>, EngineError> {
        let slot = self.appointment_slot(appointment_id)?;
        let guard = slot.read_owned().await;
        if guard.appointment(*appointment_id).is_none() {
            return Err(EngineError::NotFound(*appointment_id));
        }
        Ok(guard)
    }

    fn appointment_slot(&self, appointment_id: &Ulid) -> Result<SharedSlotState, EngineError> {
        let slot_id = self
            .appointment_to_slot
            .get(appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*appointment_id))?;
        self.get_slot(&slot_id).ok_or(EngineError::NotFound(*appointment_id))
    }

    // ── Actors ───────────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub(super) fn has_role(&self, actor: Ulid, role: Role) -> bool {
        self.users.get(&actor).is_some_and(|u| u.role == role)
    }

    pub(super) fn require_role(&self, actor: Ulid, role: Role) -> Result<(), EngineError> {
        if self.has_role(actor, role) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(match role {
                Role::PetOwner => "pet owners only",
                Role::Veterinarian => "veterinarians only",
                Role::Admin => "admins only",
            }))
        }
    }

    /// The user account behind a veterinarian profile.
    pub(super) fn veterinarian_user(&self, veterinarian_id: &Ulid) -> Option<Ulid> {
        self.veterinarians.get(veterinarian_id).map(|v| v.user_id)
    }

    /// Listen on a channel. A schedule is visible to its veterinarian and
    /// admins; a user channel to that user and admins.
    pub fn listen(
        &self,
        actor: Ulid,
        channel: NotifyChannel,
    ) -> Result<broadcast::Receiver<Event>, EngineError> {
        match channel {
            NotifyChannel::Veterinarian(id) => self.require_schedule_owner(actor, &id)?,
            NotifyChannel::User(id) => {
                if !self.users.contains_key(&id) {
                    return Err(EngineError::NotFound(id));
                }
                if actor != id && !self.has_role(actor, Role::Admin) {
                    return Err(EngineError::Forbidden("only the user may listen to their inbox"));
                }
            }
        }
        Ok(self.notify.subscribe(channel.key()))
    }

    /// The veterinarian's own account or an admin.
    pub(super) fn require_schedule_owner(
        &self,
        actor: Ulid,
        veterinarian_id: &Ulid,
    ) -> Result<(), EngineError> {
        let vet_user = self
            .veterinarian_user(veterinarian_id)
            .ok_or(EngineError::NotFound(*veterinarian_id))?;
        if actor == vet_user || self.has_role(actor, Role::Admin) {
            Ok(())
        } else {
            Err(EngineError::Forbidden("only the veterinarian may manage this schedule"))
        }
    }
}
