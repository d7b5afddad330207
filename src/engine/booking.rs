use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::notifier::Notice;
use crate::observability::{APPOINTMENTS_BOOKED_TOTAL, APPOINTMENTS_CANCELLED_TOTAL, BOOKING_CONFLICTS_TOTAL};

use super::validation::now_ms;
use super::{Engine, EngineError};

/// A pet owner's request for one time slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub appointment_id: Ulid,
    pub veterinarian_id: Ulid,
    pub pet_id: Ulid,
    pub time_slot_id: Ulid,
}

impl Engine {
    /// Book a time slot for one of the actor's pets.
    ///
    /// The slot's write lock is held from the availability check until the
    /// appointment and the slot flip are durable, so concurrent requests for
    /// the same slot see it taken. Both parties are notified after the lock
    /// is released; a notification failure never undoes the booking.
    pub async fn book_appointment(
        &self,
        actor: Ulid,
        request: BookingRequest,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.gate.read().await;
        let result = self.try_book(actor, &request).await;
        match &result {
            Ok(appointment) => {
                metrics::counter!(APPOINTMENTS_BOOKED_TOTAL).increment(1);
                info!(
                    appointment = %appointment.id,
                    slot = %request.time_slot_id,
                    actor = %actor,
                    "appointment booked"
                );
            }
            Err(EngineError::SlotUnavailable(slot)) => {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!(slot = %slot, actor = %actor, "slot unavailable");
            }
            Err(e) if e.is_precondition() => {
                debug!(slot = %request.time_slot_id, actor = %actor, error = %e, "booking rejected");
            }
            Err(e) => {
                error!(
                    slot = %request.time_slot_id,
                    pet = %request.pet_id,
                    actor = %actor,
                    error = %e,
                    "booking failed"
                );
            }
        }
        result
    }

    async fn try_book(&self, actor: Ulid, request: &BookingRequest) -> Result<Appointment, EngineError> {
        self.require_role(actor, Role::PetOwner)?;

        let mut guard = self
            .live_slot_write(&request.time_slot_id)
            .await
            .ok_or(EngineError::SlotUnavailable(request.time_slot_id))?;

        if !guard.is_bookable() {
            return Err(EngineError::SlotUnavailable(guard.id));
        }
        if guard.veterinarian_id != request.veterinarian_id {
            return Err(EngineError::Invalid(
                "time slot belongs to another veterinarian".into(),
            ));
        }
        let owned = self
            .pets
            .get(&request.pet_id)
            .is_some_and(|pet| pet.is_owned_by(actor));
        if !owned {
            return Err(EngineError::PetNotOwned(request.pet_id));
        }
        match self.appointment_to_slot.entry(request.appointment_id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(request.appointment_id)),
            Entry::Vacant(slot_ref) => {
                slot_ref.insert(guard.id);
            }
        }

        let event = Event::AppointmentBooked {
            id: request.appointment_id,
            time_slot_id: guard.id,
            veterinarian_id: guard.veterinarian_id,
            pet_owner_id: actor,
            pet_id: request.pet_id,
            at: now_ms(),
        };
        if let Err(e) = self.persist_slot_event(&mut guard, &event).await {
            self.appointment_to_slot.remove(&request.appointment_id);
            return Err(e);
        }
        let appointment = guard
            .appointment(request.appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(request.appointment_id))?;
        drop(guard);

        self.outbox.publish(Notice::new(
            NoticeKind::AppointmentBooked,
            appointment.id,
            self.parties(&appointment),
        ));
        Ok(appointment)
    }

    /// Cancel an appointment on behalf of its pet owner or veterinarian.
    ///
    /// The status change and the slot release are one WAL event. Cancelling
    /// an already-cancelled appointment returns it unchanged and writes
    /// nothing, so a slot that was rebooked in between stays taken.
    pub async fn cancel_appointment(
        &self,
        actor: Ulid,
        appointment_id: Ulid,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.gate.read().await;
        let result = self.try_cancel(actor, appointment_id).await;
        match &result {
            Ok(appointment) => {
                info!(appointment = %appointment.id, actor = %actor, "appointment cancelled");
            }
            Err(e) if e.is_precondition() => {
                debug!(appointment = %appointment_id, actor = %actor, error = %e, "cancellation rejected");
            }
            Err(e) => {
                error!(appointment = %appointment_id, actor = %actor, error = %e, "cancellation failed");
            }
        }
        result
    }

    async fn try_cancel(&self, actor: Ulid, appointment_id: Ulid) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_appointment_write(&appointment_id).await?;
        let current = guard
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;

        let vet_user = self.veterinarian_user(&current.veterinarian_id);
        if actor != current.pet_owner_id && Some(actor) != vet_user {
            return Err(EngineError::Forbidden(
                "only the pet owner or the assigned veterinarian may cancel",
            ));
        }

        match current.status {
            AppointmentStatus::Cancelled => return Ok(current),
            AppointmentStatus::Completed => {
                return Err(EngineError::InvalidTransition {
                    from: AppointmentStatus::Completed,
                    to: AppointmentStatus::Cancelled,
                });
            }
            _ => {}
        }

        let release_slot = guard
            .active_appointment()
            .is_some_and(|active| active.id == appointment_id);
        let event = Event::AppointmentCancelled {
            id: appointment_id,
            time_slot_id: guard.id,
            veterinarian_id: guard.veterinarian_id,
            release_slot,
            at: now_ms(),
        };
        self.persist_slot_event(&mut guard, &event).await?;
        let cancelled = guard
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        drop(guard);

        metrics::counter!(APPOINTMENTS_CANCELLED_TOTAL).increment(1);
        self.outbox.publish(Notice::new(
            NoticeKind::AppointmentCancelled,
            cancelled.id,
            self.parties(&cancelled),
        ));
        Ok(cancelled)
    }

    /// Move an appointment one step along pending → confirmed → in_progress →
    /// completed. Only the assigned veterinarian or an admin may do this.
    pub async fn advance_appointment(
        &self,
        actor: Ulid,
        appointment_id: Ulid,
        to: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.gate.read().await;
        let mut guard = self.resolve_appointment_write(&appointment_id).await?;
        let current = guard
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;

        let vet_user = self.veterinarian_user(&current.veterinarian_id);
        if Some(actor) != vet_user && !self.has_role(actor, Role::Admin) {
            return Err(EngineError::Forbidden(
                "only the assigned veterinarian may update an appointment",
            ));
        }
        if current.status.next() != Some(to) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        let event = Event::AppointmentStatusChanged {
            id: appointment_id,
            time_slot_id: guard.id,
            veterinarian_id: guard.veterinarian_id,
            status: to,
            at: now_ms(),
        };
        self.persist_slot_event(&mut guard, &event).await?;
        debug!(appointment = %appointment_id, status = to.as_str(), "appointment status changed");
        guard
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))
    }

    /// Pet owner first, then the veterinarian's account if it still exists.
    fn parties(&self, appointment: &Appointment) -> Vec<Ulid> {
        let mut recipients = vec![appointment.pet_owner_id];
        recipients.extend(self.veterinarian_user(&appointment.veterinarian_id));
        recipients
    }
}
