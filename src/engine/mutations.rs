use std::collections::HashMap;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notifier::{self, Notice};

use super::validation::{
    check_no_overlap, normalize_email, now_ms, optional_text, required_name, validate_pet_profile,
    validate_span,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Users ────────────────────────────────────────────

    /// Register an account. Anyone may sign up as a pet owner or veterinarian;
    /// admins are created by admins, except the very first one.
    pub async fn register_user(
        &self,
        actor: Option<Ulid>,
        id: Ulid,
        name: &str,
        email: &str,
        role: Role,
    ) -> Result<User, EngineError> {
        let name = required_name("name", name)?;
        let email = normalize_email(email)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if role == Role::Admin {
            let bootstrap = !self.users.iter().any(|u| u.role == Role::Admin);
            let by_admin = actor.is_some_and(|a| self.has_role(a, Role::Admin));
            if !bootstrap && !by_admin {
                return Err(EngineError::Forbidden("admins only"));
            }
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.emails.contains_key(&email) {
            return Err(EngineError::Duplicate("email"));
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
            role,
        };
        self.persist_catalog_event(None, &event).await?;
        tracing::info!(user = %id, role = role.as_str(), "user registered");
        Ok(User { id, name, email, role })
    }

    // ── Veterinarians ────────────────────────────────────

    pub async fn create_specialization(
        &self,
        actor: Ulid,
        id: Ulid,
        name: &str,
        description: Option<String>,
    ) -> Result<Specialization, EngineError> {
        self.require_role(actor, Role::Admin)?;
        let name = required_name("name", name)?;
        let description = optional_text(description)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.specializations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self
            .specializations
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(&name))
        {
            return Err(EngineError::Duplicate("specialization name"));
        }

        let event = Event::SpecializationCreated {
            id,
            name: name.clone(),
            description: description.clone(),
        };
        self.persist_catalog_event(None, &event).await?;
        Ok(Specialization { id, name, description })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_veterinarian(
        &self,
        actor: Ulid,
        id: Ulid,
        user_id: Ulid,
        license_number: &str,
        experience_years: u32,
        consultation_fee: Cents,
        bio: Option<String>,
    ) -> Result<(), EngineError> {
        self.require_role(actor, Role::Admin)?;
        let license_number = required_name("license_number", license_number)?;
        let bio = optional_text(bio)?;
        if consultation_fee < 0 {
            return Err(EngineError::Invalid("consultation fee must not be negative".into()));
        }

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.veterinarians.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.has_role(user_id, Role::Veterinarian) {
            return Err(EngineError::Invalid(format!(
                "user {user_id} is not registered as a veterinarian"
            )));
        }
        if self.vet_by_user.contains_key(&user_id) {
            return Err(EngineError::Duplicate("veterinarian profile"));
        }
        if self.licenses.contains_key(&license_number) {
            return Err(EngineError::Duplicate("license number"));
        }

        let event = Event::VeterinarianCreated {
            id,
            user_id,
            license_number,
            experience_years,
            consultation_fee,
            bio,
        };
        self.persist_catalog_event(None, &event).await
    }

    /// Idempotent: assigning a specialization twice is a no-op.
    pub async fn assign_specialization(
        &self,
        actor: Ulid,
        veterinarian_id: Ulid,
        specialization_id: Ulid,
    ) -> Result<(), EngineError> {
        self.require_role(actor, Role::Admin)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if !self.specializations.contains_key(&specialization_id) {
            return Err(EngineError::NotFound(specialization_id));
        }
        let already = self
            .veterinarians
            .get(&veterinarian_id)
            .ok_or(EngineError::NotFound(veterinarian_id))?
            .specializations
            .contains(&specialization_id);
        if already {
            return Ok(());
        }

        let event = Event::SpecializationAssigned {
            veterinarian_id,
            specialization_id,
        };
        self.persist_catalog_event(None, &event).await
    }

    // ── Pets ─────────────────────────────────────────────

    pub async fn register_pet(
        &self,
        actor: Ulid,
        id: Ulid,
        profile: PetProfile,
    ) -> Result<Pet, EngineError> {
        self.require_role(actor, Role::PetOwner)?;
        let profile = validate_pet_profile(profile)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.pets.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let owned = self.pets.iter().filter(|p| p.is_owned_by(actor)).count();
        if owned >= MAX_PETS_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many pets"));
        }

        let event = Event::PetRegistered {
            id,
            owner_id: actor,
            profile: profile.clone(),
        };
        self.persist_catalog_event(None, &event).await?;
        Ok(Pet {
            id,
            owner_id: actor,
            profile,
            deleted_at: None,
        })
    }

    /// Replace a pet's profile. The same rules as registration apply.
    pub async fn update_pet(
        &self,
        actor: Ulid,
        id: Ulid,
        profile: PetProfile,
    ) -> Result<Pet, EngineError> {
        let profile = validate_pet_profile(profile)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        let mut pet = self
            .pets
            .get(&id)
            .filter(|p| p.deleted_at.is_none())
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if pet.owner_id != actor {
            return Err(EngineError::PetNotOwned(id));
        }

        let event = Event::PetUpdated {
            id,
            profile: profile.clone(),
        };
        self.persist_catalog_event(None, &event).await?;
        pet.profile = profile;
        Ok(pet)
    }

    /// Soft delete. Past appointments keep pointing at the pet.
    pub async fn remove_pet(&self, actor: Ulid, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        let owned = self
            .pets
            .get(&id)
            .filter(|p| p.deleted_at.is_none())
            .ok_or(EngineError::NotFound(id))?
            .owner_id
            == actor;
        if !owned {
            return Err(EngineError::PetNotOwned(id));
        }

        let event = Event::PetRemoved { id, at: now_ms() };
        self.persist_catalog_event(None, &event).await
    }

    // ── Schedules ────────────────────────────────────────

    pub async fn create_time_slot(
        &self,
        actor: Ulid,
        id: Ulid,
        veterinarian_id: Ulid,
        start: Ms,
        end: Ms,
        blocked: bool,
    ) -> Result<SlotInfo, EngineError> {
        let span = validate_span(start, end)?;
        self.require_schedule_owner(actor, &veterinarian_id)?;

        let _gate = self.gate.read().await;
        let schedule = self.schedule(veterinarian_id);
        let mut guard = schedule.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_VETERINARIAN {
            return Err(EngineError::LimitExceeded("too many time slots"));
        }
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        check_no_overlap(&guard, &span)?;

        let event = Event::SlotCreated {
            id,
            veterinarian_id,
            span,
            blocked,
        };
        self.persist_schedule_event(veterinarian_id, &mut guard, &event)
            .await?;
        Ok(SlotState::new(id, veterinarian_id, span, blocked).info())
    }

    /// Block or unblock a slot. A blocked slot cannot be booked; an existing
    /// appointment on it is left alone.
    pub async fn set_slot_blocked(
        &self,
        actor: Ulid,
        slot_id: Ulid,
        blocked: bool,
    ) -> Result<SlotInfo, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self
            .live_slot_write(&slot_id)
            .await
            .ok_or(EngineError::NotFound(slot_id))?;
        self.require_schedule_owner(actor, &guard.veterinarian_id)?;
        if guard.is_blocked == blocked {
            return Ok(guard.info());
        }

        let event = Event::SlotBlockChanged {
            id: slot_id,
            veterinarian_id: guard.veterinarian_id,
            blocked,
        };
        self.persist_slot_event(&mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Delete a slot nobody ever booked.
    pub async fn remove_time_slot(&self, actor: Ulid, slot_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let veterinarian_id = {
            let slot = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
            let guard = slot.read().await;
            guard.veterinarian_id
        };
        self.require_schedule_owner(actor, &veterinarian_id)?;

        let schedule = self.schedule(veterinarian_id);
        let mut schedule_guard = schedule.write().await;
        let slot = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let slot_guard = slot.write().await;
        if !slot_guard.appointments.is_empty() {
            return Err(EngineError::InUse(slot_id));
        }

        let event = Event::SlotRemoved {
            id: slot_id,
            veterinarian_id,
        };
        self.persist_schedule_event(veterinarian_id, &mut schedule_guard, &event)
            .await
    }

    // ── Payments ─────────────────────────────────────────

    /// Start a gateway payment for an appointment. The amount is the
    /// veterinarian's consultation fee; the total adds the service charge.
    pub async fn initiate_payment(
        &self,
        actor: Ulid,
        id: Ulid,
        appointment_id: Ulid,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> Result<Payment, EngineError> {
        let transaction_id = required_name("transaction_id", transaction_id)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        let slot = self.resolve_appointment_read(&appointment_id).await?;
        let appointment = slot
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        drop(slot);

        if appointment.pet_owner_id != actor {
            return Err(EngineError::Forbidden("only the pet owner may pay"));
        }
        if appointment.status == AppointmentStatus::Cancelled {
            return Err(EngineError::Invalid("appointment is cancelled".into()));
        }
        if self.payments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.transactions.contains_key(&transaction_id) {
            return Err(EngineError::Duplicate("transaction id"));
        }
        let paid = self.payments.iter().any(|p| {
            p.appointment_id == appointment_id && p.status == PaymentStatus::Completed
        });
        if paid {
            return Err(EngineError::Invalid("appointment already paid".into()));
        }
        let amount = self
            .veterinarians
            .get(&appointment.veterinarian_id)
            .map(|v| v.consultation_fee)
            .ok_or(EngineError::NotFound(appointment.veterinarian_id))?;

        let event = Event::PaymentInitiated {
            id,
            appointment_id,
            user_id: actor,
            gateway,
            transaction_id,
            amount,
            service_charge: SERVICE_CHARGE,
            at: now_ms(),
        };
        self.persist_catalog_event(Some(actor), &event).await?;
        self.payments
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Record the gateway's verdict on a pending payment. Only an admin may
    /// settle; the payer never confirms their own payment.
    pub async fn settle_payment(
        &self,
        actor: Ulid,
        id: Ulid,
        status: PaymentStatus,
        reference: Option<String>,
    ) -> Result<Payment, EngineError> {
        self.require_role(actor, Role::Admin)?;
        if status == PaymentStatus::Pending {
            return Err(EngineError::Invalid("a payment settles as completed or failed".into()));
        }
        let reference = optional_text(reference)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        let (current, payer) = self
            .payments
            .get(&id)
            .map(|p| (p.status, p.user_id))
            .ok_or(EngineError::NotFound(id))?;
        if current != PaymentStatus::Pending {
            return Err(EngineError::Invalid(format!("payment already {}", current.as_str())));
        }

        let event = Event::PaymentSettled {
            id,
            status,
            reference,
            at: now_ms(),
        };
        self.persist_catalog_event(Some(payer), &event).await?;
        tracing::info!(payment = %id, status = status.as_str(), "payment settled");
        self.payments
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    // ── Homepage ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_homepage_content(
        &self,
        actor: Ulid,
        id: Ulid,
        title: &str,
        description: Option<String>,
        image_path: Option<String>,
        order: i32,
        published: bool,
    ) -> Result<(), EngineError> {
        self.require_role(actor, Role::Admin)?;
        let title = required_name("title", title)?;
        let description = optional_text(description)?;
        let image_path = optional_text(image_path)?;

        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.homepage.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::HomepageContentCreated {
            id,
            title,
            description,
            image_path,
            order,
            published,
        };
        self.persist_catalog_event(None, &event).await
    }

    pub async fn set_homepage_published(
        &self,
        actor: Ulid,
        id: Ulid,
        published: bool,
    ) -> Result<(), EngineError> {
        self.require_role(actor, Role::Admin)?;
        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        let current = self
            .homepage
            .get(&id)
            .map(|c| c.is_published)
            .ok_or(EngineError::NotFound(id))?;
        if current == published {
            return Ok(());
        }
        let event = Event::HomepagePublicationChanged { id, published };
        self.persist_catalog_event(None, &event).await
    }

    pub async fn remove_homepage_content(&self, actor: Ulid, id: Ulid) -> Result<(), EngineError> {
        self.require_role(actor, Role::Admin)?;
        let _gate = self.gate.read().await;
        let _catalog = self.catalog.lock().await;
        if !self.homepage.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog_event(None, &Event::HomepageContentRemoved { id })
            .await
    }

    // ── Notifications ────────────────────────────────────

    /// Store a notice in the recipient's inbox and broadcast it on their channel.
    pub async fn record_notification(
        &self,
        recipient: Ulid,
        notice: &Notice,
    ) -> Result<Notification, EngineError> {
        if !self.users.contains_key(&recipient) {
            return Err(EngineError::NotFound(recipient));
        }
        let detail = {
            let slot = self.resolve_appointment_read(&notice.appointment_id).await?;
            let appointment = slot
                .appointment(notice.appointment_id)
                .cloned()
                .ok_or(EngineError::NotFound(notice.appointment_id))?;
            self.detail_of(appointment, slot.span)
        };
        let payload = notifier::render_payload(notice.kind, &detail);

        let _gate = self.gate.read().await;
        let notification = Notification {
            id: Ulid::new(),
            user_id: recipient,
            kind: notice.kind,
            appointment_id: notice.appointment_id,
            payload,
            created_at: now_ms(),
        };
        let event = Event::NotificationRecorded {
            id: notification.id,
            user_id: recipient,
            kind: notification.kind,
            appointment_id: notification.appointment_id,
            payload: notification.payload.clone(),
            at: notification.created_at,
        };
        self.persist_catalog_event(Some(recipient), &event).await?;
        Ok(notification)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no mutation is between its WAL append and its apply.
        let _gate = self.gate.write().await;
        let mut events = Vec::new();

        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserRegistered {
            id: u.id,
            name: u.name,
            email: u.email,
            role: u.role,
        }));

        let mut specializations: Vec<Specialization> =
            self.specializations.iter().map(|s| s.value().clone()).collect();
        specializations.sort_by_key(|s| s.id);
        events.extend(specializations.into_iter().map(|s| Event::SpecializationCreated {
            id: s.id,
            name: s.name,
            description: s.description,
        }));

        let mut vets: Vec<Veterinarian> =
            self.veterinarians.iter().map(|v| v.value().clone()).collect();
        vets.sort_by_key(|v| v.id);
        for vet in vets {
            events.push(Event::VeterinarianCreated {
                id: vet.id,
                user_id: vet.user_id,
                license_number: vet.license_number,
                experience_years: vet.experience_years,
                consultation_fee: vet.consultation_fee,
                bio: vet.bio,
            });
            events.extend(vet.specializations.into_iter().map(|specialization_id| {
                Event::SpecializationAssigned {
                    veterinarian_id: vet.id,
                    specialization_id,
                }
            }));
        }

        let mut pets: Vec<Pet> = self.pets.iter().map(|p| p.value().clone()).collect();
        pets.sort_by_key(|p| p.id);
        for pet in pets {
            events.push(Event::PetRegistered {
                id: pet.id,
                owner_id: pet.owner_id,
                profile: pet.profile,
            });
            if let Some(at) = pet.deleted_at {
                events.push(Event::PetRemoved { id: pet.id, at });
            }
        }

        let slot_arcs: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut slots = Vec::with_capacity(slot_arcs.len());
        for slot in slot_arcs {
            slots.push(slot.read().await.clone());
        }
        slots.sort_by_key(|s| (s.veterinarian_id, s.span.start));
        events.extend(slots.into_iter().map(|slot| Event::SlotRestored { slot }));

        let mut payments: Vec<Payment> = self.payments.iter().map(|p| p.value().clone()).collect();
        payments.sort_by_key(|p| p.id);
        for payment in payments {
            events.push(Event::PaymentInitiated {
                id: payment.id,
                appointment_id: payment.appointment_id,
                user_id: payment.user_id,
                gateway: payment.gateway,
                transaction_id: payment.transaction_id,
                amount: payment.amount,
                service_charge: payment.service_charge,
                at: payment.created_at,
            });
            if let Some(at) = payment.settled_at {
                events.push(Event::PaymentSettled {
                    id: payment.id,
                    status: payment.status,
                    reference: payment.reference,
                    at,
                });
            }
        }

        let mut contents: Vec<HomepageContent> =
            self.homepage.iter().map(|c| c.value().clone()).collect();
        contents.sort_by_key(|c| c.id);
        events.extend(contents.into_iter().map(|c| Event::HomepageContentCreated {
            id: c.id,
            title: c.title,
            description: c.description,
            image_path: c.image_path,
            order: c.order,
            published: c.is_published,
        }));

        let inboxes: HashMap<Ulid, Vec<Notification>> = self
            .inbox
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut recipients: Vec<&Ulid> = inboxes.keys().collect();
        recipients.sort();
        for recipient in recipients {
            events.extend(inboxes[recipient].iter().map(|n| Event::NotificationRecorded {
                id: n.id,
                user_id: n.user_id,
                kind: n.kind,
                appointment_id: n.appointment_id,
                payload: n.payload.clone(),
                at: n.created_at,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
