use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Invalid("start must be before end".into()));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("time slot too long"));
    }
    Ok(span)
}

pub(crate) fn validate_query_window(from: Ms, to: Ms) -> Result<(), EngineError> {
    if to < from {
        return Err(EngineError::Invalid("window end before start".into()));
    }
    if to.checked_sub(from).is_none_or(|width| width > MAX_QUERY_WINDOW_MS) {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// A veterinarian's slots may touch but never overlap.
pub(crate) fn check_no_overlap(schedule: &Schedule, span: &Span) -> Result<(), EngineError> {
    match schedule.overlapping(span).next() {
        Some(existing) => Err(EngineError::Overlap(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn required_name(field: &'static str, value: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Invalid(format!("{field} is required")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(trimmed.to_string())
}

/// Blank text collapses to `None`.
pub(crate) fn optional_text(value: Option<String>) -> Result<Option<String>, EngineError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) if text.chars().count() > MAX_TEXT_LEN => {
            Err(EngineError::LimitExceeded("text too long"))
        }
        Some(text) => Ok(Some(text.to_string())),
    }
}

/// E-mail addresses are compared case-insensitively.
pub(crate) fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = required_name("email", email)?.to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.starts_with('.') => {
            Ok(email)
        }
        _ => Err(EngineError::Invalid(format!("malformed email: {email}"))),
    }
}

pub(crate) fn validate_pet_profile(profile: PetProfile) -> Result<PetProfile, EngineError> {
    if profile.age > MAX_PET_AGE_YEARS {
        return Err(EngineError::Invalid("age out of range".into()));
    }
    if profile.weight_grams > MAX_PET_WEIGHT_GRAMS {
        return Err(EngineError::Invalid("weight out of range".into()));
    }
    Ok(PetProfile {
        name: required_name("name", &profile.name)?,
        breed: required_name("breed", &profile.breed)?,
        medical_notes: optional_text(profile.medical_notes)?,
        ..profile
    })
}
