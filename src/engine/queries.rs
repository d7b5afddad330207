use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{bookable_in_window, open_windows};
use super::validation::validate_query_window;
use super::{Engine, EngineError};

/// Veterinarian directory search. Pages are zero-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VeterinarianFilter {
    /// Case-insensitive substring of the veterinarian's name or bio.
    pub query: Option<String>,
    pub specialization_id: Option<Ulid>,
    pub page: usize,
}

impl Engine {
    // ── Schedules ────────────────────────────────────────

    /// Snapshot of a veterinarian's slots starting in `[from, to]`.
    async fn slots_starting_within(&self, veterinarian_id: Ulid, from: Ms, to: Ms) -> Vec<SlotInfo> {
        let Some(schedule) = self.schedules.get(&veterinarian_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let ids: Vec<Ulid> = schedule
            .read()
            .await
            .starting_within(from, to)
            .map(|s| s.id)
            .collect();
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(slot) = self.get_slot(&id) {
                infos.push(slot.read().await.info());
            }
        }
        infos
    }

    /// Bookable slots of one veterinarian whose start lies in `[from, to]`.
    pub async fn available_slots(
        &self,
        veterinarian_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        validate_query_window(from, to)?;
        let slots = self.slots_starting_within(veterinarian_id, from, to).await;
        Ok(bookable_in_window(&slots, from, to))
    }

    /// Bookable time merged into contiguous windows.
    pub async fn open_windows_for(
        &self,
        veterinarian_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let bookable = self.available_slots(veterinarian_id, from, to).await?;
        Ok(open_windows(&bookable))
    }

    /// Every slot in the window, taken and blocked ones included. For the
    /// veterinarian managing the schedule.
    pub async fn slots_for_veterinarian(
        &self,
        actor: Ulid,
        veterinarian_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        validate_query_window(from, to)?;
        self.require_schedule_owner(actor, &veterinarian_id)?;
        Ok(self.slots_starting_within(veterinarian_id, from, to).await)
    }

    // ── Directory ────────────────────────────────────────

    fn veterinarian_info(&self, vet: &Veterinarian) -> VeterinarianInfo {
        let name = self
            .users
            .get(&vet.user_id)
            .map(|u| u.name.clone())
            .unwrap_or_default();
        let mut specializations: Vec<String> = vet
            .specializations
            .iter()
            .filter_map(|id| self.specializations.get(id).map(|s| s.name.clone()))
            .collect();
        specializations.sort();
        VeterinarianInfo {
            id: vet.id,
            user_id: vet.user_id,
            name,
            license_number: vet.license_number.clone(),
            experience_years: vet.experience_years,
            consultation_fee: vet.consultation_fee,
            bio: vet.bio.clone(),
            specializations,
        }
    }

    pub fn veterinarian(&self, id: Ulid) -> Result<VeterinarianInfo, EngineError> {
        let vet = self
            .veterinarians
            .get(&id)
            .map(|v| v.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        Ok(self.veterinarian_info(&vet))
    }

    /// Sorted by name, then id.
    pub fn search_veterinarians(&self, filter: &VeterinarianFilter) -> Vec<VeterinarianInfo> {
        let needle = filter
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let vets: Vec<Veterinarian> = self
            .veterinarians
            .iter()
            .filter(|v| {
                filter
                    .specialization_id
                    .is_none_or(|s| v.specializations.contains(&s))
            })
            .map(|v| v.value().clone())
            .collect();

        let mut hits: Vec<VeterinarianInfo> = vets
            .iter()
            .map(|v| self.veterinarian_info(v))
            .filter(|info| match &needle {
                None => true,
                Some(needle) => {
                    info.name.to_lowercase().contains(needle)
                        || info
                            .bio
                            .as_deref()
                            .is_some_and(|bio| bio.to_lowercase().contains(needle))
                }
            })
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        hits.into_iter()
            .skip(filter.page.saturating_mul(VETERINARIAN_PAGE_SIZE))
            .take(VETERINARIAN_PAGE_SIZE)
            .collect()
    }

    pub fn list_specializations(&self) -> Vec<Specialization> {
        let mut all: Vec<Specialization> =
            self.specializations.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // ── Pets ─────────────────────────────────────────────

    /// The actor's pets, removed ones excluded.
    pub fn pets_for(&self, actor: Ulid) -> Vec<Pet> {
        let mut pets: Vec<Pet> = self
            .pets
            .iter()
            .filter(|p| p.is_owned_by(actor))
            .map(|p| p.value().clone())
            .collect();
        pets.sort_by_key(|p| p.id);
        pets
    }

    // ── Appointments ─────────────────────────────────────

    pub(super) fn detail_of(&self, appointment: Appointment, span: Span) -> AppointmentDetail {
        let pet_name = self
            .pets
            .get(&appointment.pet_id)
            .map(|p| p.profile.name.clone())
            .unwrap_or_default();
        let veterinarian_name = self
            .veterinarian_user(&appointment.veterinarian_id)
            .and_then(|user| self.users.get(&user).map(|u| u.name.clone()))
            .unwrap_or_default();
        let pet_owner_name = self
            .users
            .get(&appointment.pet_owner_id)
            .map(|u| u.name.clone())
            .unwrap_or_default();
        AppointmentDetail {
            appointment,
            start: span.start,
            end: span.end,
            pet_name,
            veterinarian_name,
            pet_owner_name,
        }
    }

    /// Pet owners see their own appointments, veterinarians those assigned to
    /// them. Newest first, one page at a time.
    pub async fn appointments_for(
        &self,
        actor: Ulid,
        page: usize,
    ) -> Result<Vec<AppointmentDetail>, EngineError> {
        let role = self
            .users
            .get(&actor)
            .map(|u| u.role)
            .ok_or(EngineError::Forbidden("unknown user"))?;

        let mut details = Vec::new();
        match role {
            Role::PetOwner => {
                let ids = self
                    .owner_appointments
                    .get(&actor)
                    .map(|ids| ids.value().clone())
                    .unwrap_or_default();
                for id in ids {
                    // Skip entries whose booking is still in flight.
                    if let Ok(slot) = self.resolve_appointment_read(&id).await
                        && let Some(appointment) = slot.appointment(id).cloned()
                    {
                        details.push(self.detail_of(appointment, slot.span));
                    }
                }
            }
            Role::Veterinarian => {
                let Some(vet_id) = self.vet_by_user.get(&actor).map(|v| *v.value()) else {
                    return Ok(Vec::new());
                };
                let ids: Vec<Ulid> = match self.schedules.get(&vet_id).map(|s| s.value().clone()) {
                    Some(schedule) => schedule.read().await.slots.iter().map(|s| s.id).collect(),
                    None => Vec::new(),
                };
                for id in ids {
                    if let Some(slot) = self.get_slot(&id) {
                        let guard = slot.read().await;
                        for appointment in &guard.appointments {
                            details.push(self.detail_of(appointment.clone(), guard.span));
                        }
                    }
                }
            }
            Role::Admin => {}
        }

        details.sort_by(|a, b| {
            b.appointment
                .created_at
                .cmp(&a.appointment.created_at)
                .then(b.appointment.id.cmp(&a.appointment.id))
        });
        Ok(details
            .into_iter()
            .skip(page.saturating_mul(APPOINTMENT_PAGE_SIZE))
            .take(APPOINTMENT_PAGE_SIZE)
            .collect())
    }

    /// Visible to the pet owner, the assigned veterinarian and admins.
    pub async fn appointment_detail(
        &self,
        actor: Ulid,
        appointment_id: Ulid,
    ) -> Result<AppointmentDetail, EngineError> {
        let slot = self.resolve_appointment_read(&appointment_id).await?;
        let appointment = slot
            .appointment(appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        let allowed = actor == appointment.pet_owner_id
            || Some(actor) == self.veterinarian_user(&appointment.veterinarian_id)
            || self.has_role(actor, Role::Admin);
        if !allowed {
            return Err(EngineError::Forbidden("not your appointment"));
        }
        Ok(self.detail_of(appointment, slot.span))
    }

    // ── Payments ─────────────────────────────────────────

    /// Newest first.
    pub fn payments_for(&self, actor: Ulid) -> Vec<Payment> {
        let mut payments: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.user_id == actor)
            .map(|p| p.value().clone())
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        payments
    }

    // ── Notifications ────────────────────────────────────

    /// Newest first.
    pub fn notifications_for(&self, actor: Ulid) -> Vec<Notification> {
        let mut inbox = self
            .inbox
            .get(&actor)
            .map(|n| n.value().clone())
            .unwrap_or_default();
        inbox.reverse();
        inbox
    }

    // ── Homepage ─────────────────────────────────────────

    /// Published content in display order. Admins also see drafts.
    pub fn homepage_contents(&self, actor: Option<Ulid>) -> Vec<HomepageContent> {
        let include_drafts = actor.is_some_and(|a| self.has_role(a, Role::Admin));
        let mut contents: Vec<HomepageContent> = self
            .homepage
            .iter()
            .filter(|c| include_drafts || c.is_published)
            .map(|c| c.value().clone())
            .collect();
        contents.sort_by_key(|c| (c.order, c.id));
        contents
    }
}
