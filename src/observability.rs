use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "vetbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "vetbook_query_duration_seconds";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: appointments booked.
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "vetbook_appointments_booked_total";

/// Counter: appointments cancelled (no-op re-cancels excluded).
pub const APPOINTMENTS_CANCELLED_TOTAL: &str = "vetbook_appointments_cancelled_total";

/// Counter: bookings rejected because the slot was taken, blocked or missing.
pub const BOOKING_CONFLICTS_TOTAL: &str = "vetbook_booking_conflicts_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: per-recipient deliveries that succeeded. Labels: sink.
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "vetbook_notifications_delivered_total";

/// Counter: per-recipient deliveries that failed. Labels: sink.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "vetbook_notifications_failed_total";

/// Counter: notices dropped before dispatch. Labels: reason.
pub const NOTICES_DROPPED_TOTAL: &str = "vetbook_notices_dropped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "vetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "vetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "vetbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "vetbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vetbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!(error = %e, "failed to install Prometheus metrics exporter"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SetActor { .. } => "set_actor",
        Command::ResetActor => "reset_actor",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertSpecialization { .. } => "insert_specialization",
        Command::InsertVeterinarian { .. } => "insert_veterinarian",
        Command::AssignSpecialization { .. } => "assign_specialization",
        Command::InsertPet { .. } => "insert_pet",
        Command::UpdatePet { .. } => "update_pet",
        Command::DeletePet { .. } => "delete_pet",
        Command::InsertTimeSlot { .. } => "insert_time_slot",
        Command::DeleteTimeSlot { .. } => "delete_time_slot",
        Command::BlockSlot { .. } => "block_slot",
        Command::UnblockSlot { .. } => "unblock_slot",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::AdvanceAppointment { .. } => "advance_appointment",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SettlePayment { .. } => "settle_payment",
        Command::InsertHomepageContent { .. } => "insert_homepage_content",
        Command::DeleteHomepageContent { .. } => "delete_homepage_content",
        Command::SetHomepagePublished { .. } => "set_homepage_published",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOpenWindows { .. } => "select_open_windows",
        Command::SelectTimeSlots { .. } => "select_time_slots",
        Command::SelectVeterinarians { .. } => "select_veterinarians",
        Command::SelectVeterinarian { .. } => "select_veterinarian",
        Command::SelectSpecializations => "select_specializations",
        Command::SelectPets => "select_pets",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectPayments => "select_payments",
        Command::SelectNotifications => "select_notifications",
        Command::SelectHomepageContents => "select_homepage_contents",
    }
}
