use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A unique field (e-mail, license number, transaction id) is taken.
    Duplicate(&'static str),
    /// The slot is missing, already taken, or blocked.
    SlotUnavailable(Ulid),
    /// Another of the veterinarian's slots already covers part of this span.
    Overlap(Ulid),
    /// The pet is missing, removed, or belongs to someone else.
    PetNotOwned(Ulid),
    Forbidden(&'static str),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Still referenced (a slot with appointment history).
    InUse(Ulid),
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True for rejections the caller can act on; false for internal failures.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Duplicate(field) => write!(f, "{field} is already taken"),
            EngineError::SlotUnavailable(_) => {
                write!(f, "The selected time slot is no longer available.")
            }
            EngineError::Overlap(id) => write!(f, "overlaps existing time slot {id}"),
            EngineError::PetNotOwned(_) => write!(f, "The selected pet does not belong to you."),
            EngineError::Forbidden(what) => write!(f, "not allowed: {what}"),
            EngineError::InvalidTransition { from, to } => write!(
                f,
                "cannot move appointment from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::InUse(id) => write!(f, "still referenced by appointments: {id}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
