use crate::model::Ms;

// ── Tenants ───────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Text fields ───────────────────────────────────────────────

/// Names, titles, breeds, license numbers, e-mail addresses.
pub const MAX_NAME_LEN: usize = 255;
/// Bios, descriptions, medical notes, gateway references.
pub const MAX_TEXT_LEN: usize = 4096;

// ── Time ──────────────────────────────────────────────────────

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
pub const MAX_SLOT_DURATION_MS: Ms = 24 * 3_600_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

// ── Pets ──────────────────────────────────────────────────────

pub const MAX_PET_AGE_YEARS: u32 = 200;
pub const MAX_PET_WEIGHT_GRAMS: u32 = 2_000_000;

// ── Collections ───────────────────────────────────────────────

pub const MAX_SLOTS_PER_VETERINARIAN: usize = 20_000;
pub const MAX_PETS_PER_OWNER: usize = 100;
pub const MAX_NOTIFICATIONS_PER_USER: usize = 1_000;

// ── Pagination ────────────────────────────────────────────────

pub const VETERINARIAN_PAGE_SIZE: usize = 12;
pub const APPOINTMENT_PAGE_SIZE: usize = 10;
