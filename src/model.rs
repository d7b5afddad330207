use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Money in minor units (paisa). 100 = 1.00 TK.
pub type Cents = i64;

/// Flat platform fee added to every consultation payment (50.00 TK).
pub const SERVICE_CHARGE: Cents = 5_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    PetOwner,
    Veterinarian,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::PetOwner => "pet_owner",
            Role::Veterinarian => "veterinarian",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pet_owner" => Some(Role::PetOwner),
            "veterinarian" => Some(Role::Veterinarian),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Species {
    Dog,
    Cat,
    Bird,
    Rabbit,
    Hamster,
    Cow,
    Goat,
    Sheep,
    Chicken,
    Duck,
    Horse,
    Pig,
    Other,
}

impl Species {
    pub const ALL: [Species; 13] = [
        Species::Dog,
        Species::Cat,
        Species::Bird,
        Species::Rabbit,
        Species::Hamster,
        Species::Cow,
        Species::Goat,
        Species::Sheep,
        Species::Chicken,
        Species::Duck,
        Species::Horse,
        Species::Pig,
        Species::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Species::Dog => "dog",
            Species::Cat => "cat",
            Species::Bird => "bird",
            Species::Rabbit => "rabbit",
            Species::Hamster => "hamster",
            Species::Cow => "cow",
            Species::Goat => "goat",
            Species::Sheep => "sheep",
            Species::Chicken => "chicken",
            Species::Duck => "duck",
            Species::Horse => "horse",
            Species::Pig => "pig",
            Species::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL.into_iter().find(|sp| sp.as_str() == lower)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            _ => None,
        }
    }
}

/// Appointment lifecycle. `Cancelled` is the only state that frees the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "in_progress" => Some(AppointmentStatus::InProgress),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }

    /// The single forward step a veterinarian may take from this status.
    pub fn next(self) -> Option<Self> {
        match self {
            AppointmentStatus::Pending => Some(AppointmentStatus::Confirmed),
            AppointmentStatus::Confirmed => Some(AppointmentStatus::InProgress),
            AppointmentStatus::InProgress => Some(AppointmentStatus::Completed),
            AppointmentStatus::Completed | AppointmentStatus::Cancelled => None,
        }
    }

    pub fn holds_slot(self) -> bool {
        self != AppointmentStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentGateway {
    Bkash,
    Nagad,
}

impl PaymentGateway {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentGateway::Bkash => "bkash",
            PaymentGateway::Nagad => "nagad",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bkash" => Some(PaymentGateway::Bkash),
            "nagad" => Some(PaymentGateway::Nagad),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    AppointmentBooked,
    AppointmentCancelled,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::AppointmentBooked => "appointment_booked",
            NoticeKind::AppointmentCancelled => "appointment_cancelled",
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specialization {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Veterinarian {
    pub id: Ulid,
    pub user_id: Ulid,
    pub license_number: String,
    pub experience_years: u32,
    pub consultation_fee: Cents,
    pub bio: Option<String>,
    pub specializations: Vec<Ulid>,
}

/// Owner-editable description of a pet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetProfile {
    pub name: String,
    pub species: Species,
    pub breed: String,
    pub age: u32,
    pub weight_grams: u32,
    pub gender: Gender,
    pub medical_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pet {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub profile: PetProfile,
    /// Soft-delete marker. Removed pets keep their appointment history.
    pub deleted_at: Option<Ms>,
}

impl Pet {
    pub fn is_owned_by(&self, user_id: Ulid) -> bool {
        self.owner_id == user_id && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub pet_owner_id: Ulid,
    pub veterinarian_id: Ulid,
    pub pet_id: Ulid,
    pub time_slot_id: Ulid,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A bookable time slot together with every appointment ever made against it.
/// Guarded by its own lock: holding the write guard is the row lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    pub id: Ulid,
    pub veterinarian_id: Ulid,
    pub span: Span,
    pub is_available: bool,
    pub is_blocked: bool,
    /// Oldest first. At most one entry holds the slot.
    pub appointments: Vec<Appointment>,
}

impl SlotState {
    pub fn new(id: Ulid, veterinarian_id: Ulid, span: Span, is_blocked: bool) -> Self {
        Self {
            id,
            veterinarian_id,
            span,
            is_available: true,
            is_blocked,
            appointments: Vec::new(),
        }
    }

    pub fn is_bookable(&self) -> bool {
        self.is_available && !self.is_blocked
    }

    pub fn active_appointment(&self) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.status.holds_slot())
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id,
            veterinarian_id: self.veterinarian_id,
            start: self.span.start,
            end: self.span.end,
            is_available: self.is_available,
            is_blocked: self.is_blocked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub id: Ulid,
    pub span: Span,
}

/// One veterinarian's slots, sorted by `span.start`. Slot spans never overlap.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub slots: Vec<SlotRef>,
}

impl Schedule {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, slot: SlotRef) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<SlotRef> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &SlotRef> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// Slots whose start lies in `[from, to]`.
    pub fn starting_within(&self, from: Ms, to: Ms) -> impl Iterator<Item = &SlotRef> {
        let left = self.slots.partition_point(|s| s.span.start < from);
        let right = self.slots.partition_point(|s| s.span.start <= to);
        self.slots[left..right.max(left)].iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub user_id: Ulid,
    pub gateway: PaymentGateway,
    pub transaction_id: String,
    pub amount: Cents,
    pub service_charge: Cents,
    pub total_amount: Cents,
    pub status: PaymentStatus,
    /// Opaque gateway reference, recorded on settlement.
    pub reference: Option<String>,
    pub created_at: Ms,
    pub settled_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomepageContent {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub order: i32,
    pub is_published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: NoticeKind,
    pub appointment_id: Ulid,
    /// JSON document rendered at delivery time.
    pub payload: String,
    pub created_at: Ms,
}

/// The WAL record format. One event carries every write of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    SpecializationCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    VeterinarianCreated {
        id: Ulid,
        user_id: Ulid,
        license_number: String,
        experience_years: u32,
        consultation_fee: Cents,
        bio: Option<String>,
    },
    SpecializationAssigned {
        veterinarian_id: Ulid,
        specialization_id: Ulid,
    },
    PetRegistered {
        id: Ulid,
        owner_id: Ulid,
        profile: PetProfile,
    },
    PetUpdated {
        id: Ulid,
        profile: PetProfile,
    },
    PetRemoved {
        id: Ulid,
        at: Ms,
    },
    SlotCreated {
        id: Ulid,
        veterinarian_id: Ulid,
        span: Span,
        blocked: bool,
    },
    SlotBlockChanged {
        id: Ulid,
        veterinarian_id: Ulid,
        blocked: bool,
    },
    SlotRemoved {
        id: Ulid,
        veterinarian_id: Ulid,
    },
    /// Full slot image written by compaction.
    SlotRestored {
        slot: SlotState,
    },
    AppointmentBooked {
        id: Ulid,
        time_slot_id: Ulid,
        veterinarian_id: Ulid,
        pet_owner_id: Ulid,
        pet_id: Ulid,
        at: Ms,
    },
    AppointmentCancelled {
        id: Ulid,
        time_slot_id: Ulid,
        veterinarian_id: Ulid,
        release_slot: bool,
        at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        time_slot_id: Ulid,
        veterinarian_id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    PaymentInitiated {
        id: Ulid,
        appointment_id: Ulid,
        user_id: Ulid,
        gateway: PaymentGateway,
        transaction_id: String,
        amount: Cents,
        service_charge: Cents,
        at: Ms,
    },
    PaymentSettled {
        id: Ulid,
        status: PaymentStatus,
        reference: Option<String>,
        at: Ms,
    },
    HomepageContentCreated {
        id: Ulid,
        title: String,
        description: Option<String>,
        image_path: Option<String>,
        order: i32,
        published: bool,
    },
    HomepagePublicationChanged {
        id: Ulid,
        published: bool,
    },
    HomepageContentRemoved {
        id: Ulid,
    },
    NotificationRecorded {
        id: Ulid,
        user_id: Ulid,
        kind: NoticeKind,
        appointment_id: Ulid,
        payload: String,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub veterinarian_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub is_available: bool,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VeterinarianInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub name: String,
    pub license_number: String,
    pub experience_years: u32,
    pub consultation_fee: Cents,
    pub bio: Option<String>,
    pub specializations: Vec<String>,
}

/// An appointment with the names and slot times it is displayed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentDetail {
    pub appointment: Appointment,
    pub start: Ms,
    pub end: Ms,
    pub pet_name: String,
    pub veterinarian_name: String,
    pub pet_owner_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_ref(start: Ms, end: Ms) -> SlotRef {
        SlotRef {
            id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    fn appointment(status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            pet_owner_id: Ulid::new(),
            veterinarian_id: Ulid::new(),
            pet_id: Ulid::new(),
            time_slot_id: Ulid::new(),
            status,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn schedule_keeps_start_order() {
        let mut schedule = Schedule::default();
        schedule.insert(slot_ref(300, 400));
        schedule.insert(slot_ref(100, 200));
        schedule.insert(slot_ref(200, 300));
        let starts: Vec<Ms> = schedule.slots.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn schedule_remove_middle_preserves_order() {
        let mut schedule = Schedule::default();
        let refs: Vec<SlotRef> = (0..3).map(|i| slot_ref(i * 100, i * 100 + 50)).collect();
        for r in &refs {
            schedule.insert(*r);
        }
        assert_eq!(schedule.remove(refs[1].id), Some(refs[1]));
        assert_eq!(schedule.slots, vec![refs[0], refs[2]]);
        assert!(schedule.remove(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut schedule = Schedule::default();
        schedule.insert(slot_ref(100, 200));
        schedule.insert(slot_ref(450, 600));
        schedule.insert(slot_ref(1000, 1100));

        let hits: Vec<_> = schedule.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut schedule = Schedule::default();
        schedule.insert(slot_ref(100, 200));
        assert_eq!(schedule.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(schedule.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(schedule.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn starting_within_is_inclusive_on_both_ends() {
        let mut schedule = Schedule::default();
        for i in 0..5 {
            schedule.insert(slot_ref(i * 100, i * 100 + 50));
        }
        let starts: Vec<Ms> = schedule
            .starting_within(100, 300)
            .map(|s| s.span.start)
            .collect();
        assert_eq!(starts, vec![100, 200, 300]);
        assert_eq!(schedule.starting_within(1000, 2000).count(), 0);
        assert_eq!(schedule.starting_within(300, 100).count(), 0);
    }

    #[test]
    fn slot_bookable_needs_available_and_unblocked() {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), Span::new(0, 100), false);
        assert!(slot.is_bookable());
        slot.is_blocked = true;
        assert!(!slot.is_bookable());
        slot.is_blocked = false;
        slot.is_available = false;
        assert!(!slot.is_bookable());
    }

    #[test]
    fn active_appointment_ignores_cancelled() {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), Span::new(0, 100), false);
        slot.appointments.push(appointment(AppointmentStatus::Cancelled));
        assert!(slot.active_appointment().is_none());
        let live = appointment(AppointmentStatus::Confirmed);
        slot.appointments.push(live.clone());
        assert_eq!(slot.active_appointment(), Some(&live));
    }

    #[test]
    fn status_steps_forward_only() {
        use AppointmentStatus::*;
        assert_eq!(Pending.next(), Some(Confirmed));
        assert_eq!(Confirmed.next(), Some(InProgress));
        assert_eq!(InProgress.next(), Some(Completed));
        assert_eq!(Completed.next(), None);
        assert_eq!(Cancelled.next(), None);
        assert!(!Cancelled.holds_slot());
        assert!(Completed.holds_slot());
    }

    #[test]
    fn enum_names_round_trip() {
        for species in Species::ALL {
            assert_eq!(Species::parse(species.as_str()), Some(species));
        }
        assert_eq!(Species::parse("DOG"), Some(Species::Dog));
        assert_eq!(Species::parse("dragon"), None);
        assert_eq!(Role::parse("pet_owner"), Some(Role::PetOwner));
        assert_eq!(AppointmentStatus::parse("in_progress"), Some(AppointmentStatus::InProgress));
        assert_eq!(PaymentGateway::parse("bkash"), Some(PaymentGateway::Bkash));
        assert_eq!(PaymentGateway::parse("paypal"), None);
        assert_eq!(Gender::parse("female"), Some(Gender::Female));
    }

    #[test]
    fn removed_pet_is_not_owned() {
        let owner = Ulid::new();
        let mut pet = Pet {
            id: Ulid::new(),
            owner_id: owner,
            profile: PetProfile {
                name: "Milo".into(),
                species: Species::Cat,
                breed: "Tabby".into(),
                age: 3,
                weight_grams: 4_200,
                gender: Gender::Male,
                medical_notes: None,
            },
            deleted_at: None,
        };
        assert!(pet.is_owned_by(owner));
        assert!(!pet.is_owned_by(Ulid::new()));
        pet.deleted_at = Some(1);
        assert!(!pet.is_owned_by(owner));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), Span::new(0, 1_800_000), false);
        slot.is_available = false;
        slot.appointments.push(appointment(AppointmentStatus::Pending));
        let event = Event::SlotRestored { slot };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
