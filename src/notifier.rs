use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{AppointmentDetail, NoticeKind};
use crate::observability::{
    NOTICES_DROPPED_TOTAL, NOTIFICATIONS_DELIVERED_TOTAL, NOTIFICATIONS_FAILED_TOTAL,
};

/// Something happened to an appointment that its parties should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub appointment_id: Ulid,
    pub recipients: Vec<Ulid>,
}

impl Notice {
    pub fn new(kind: NoticeKind, appointment_id: Ulid, recipients: Vec<Ulid>) -> Self {
        Self {
            kind,
            appointment_id,
            recipients,
        }
    }
}

/// Sending half of the notice queue. Publishing never waits.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Notice>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a notice for delivery. A full or closed queue drops it.
    pub fn publish(&self, notice: Notice) {
        match self.tx.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notice)) => {
                metrics::counter!(NOTICES_DROPPED_TOTAL, "reason" => "full").increment(1);
                warn!(appointment = %notice.appointment_id, kind = notice.kind.as_str(), "outbox full, notice dropped");
            }
            Err(mpsc::error::TrySendError::Closed(notice)) => {
                metrics::counter!(NOTICES_DROPPED_TOTAL, "reason" => "closed").increment(1);
                warn!(appointment = %notice.appointment_id, kind = notice.kind.as_str(), "outbox closed, notice dropped");
            }
        }
    }
}

#[derive(Debug)]
pub enum DeliveryError {
    /// The channel refused the message.
    Rejected(String),
    Engine(EngineError),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Rejected(msg) => write!(f, "delivery rejected: {msg}"),
            DeliveryError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<EngineError> for DeliveryError {
    fn from(e: EngineError) -> Self {
        DeliveryError::Engine(e)
    }
}

/// A delivery channel (in-app inbox, mail, push ...).
#[async_trait]
pub trait NoticeSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, recipient: Ulid, notice: &Notice) -> Result<(), DeliveryError>;
}

/// Records notices in the recipient's inbox. Holds the engine weakly: the
/// engine owns the outbox that feeds this sink.
pub struct InboxSink {
    engine: Weak<Engine>,
}

impl InboxSink {
    pub fn new(engine: &Arc<Engine>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }
}

#[async_trait]
impl NoticeSink for InboxSink {
    fn name(&self) -> &'static str {
        "inbox"
    }

    async fn deliver(&self, recipient: Ulid, notice: &Notice) -> Result<(), DeliveryError> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| DeliveryError::Rejected("engine shut down".into()))?;
        engine.record_notification(recipient, notice).await?;
        Ok(())
    }
}

/// Drain the queue, handing each notice to every sink once per recipient.
/// Failures are logged and counted; they never reach the operation that
/// published the notice.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<Notice>, sinks: Vec<Arc<dyn NoticeSink>>) {
    while let Some(notice) = rx.recv().await {
        for recipient in &notice.recipients {
            for sink in &sinks {
                match sink.deliver(*recipient, &notice).await {
                    Ok(()) => {
                        metrics::counter!(NOTIFICATIONS_DELIVERED_TOTAL, "sink" => sink.name())
                            .increment(1);
                        debug!(
                            sink = sink.name(),
                            recipient = %recipient,
                            appointment = %notice.appointment_id,
                            kind = notice.kind.as_str(),
                            "notice delivered"
                        );
                    }
                    Err(e) => {
                        metrics::counter!(NOTIFICATIONS_FAILED_TOTAL, "sink" => sink.name())
                            .increment(1);
                        warn!(
                            sink = sink.name(),
                            recipient = %recipient,
                            appointment = %notice.appointment_id,
                            error = %e,
                            "notice delivery failed"
                        );
                    }
                }
            }
        }
    }
    debug!("outbox closed, dispatcher exiting");
}

/// JSON document stored with an inbox entry.
pub fn render_payload(kind: NoticeKind, detail: &AppointmentDetail) -> String {
    let message = match kind {
        NoticeKind::AppointmentBooked => format!(
            "Appointment for {} with {} has been booked.",
            detail.pet_name, detail.veterinarian_name
        ),
        NoticeKind::AppointmentCancelled => format!(
            "Appointment for {} with {} has been cancelled.",
            detail.pet_name, detail.veterinarian_name
        ),
    };
    serde_json::json!({
        "type": kind.as_str(),
        "appointment_id": detail.appointment.id.to_string(),
        "pet_name": detail.pet_name,
        "veterinarian_name": detail.veterinarian_name,
        "pet_owner_name": detail.pet_owner_name,
        "time_slot": {
            "start_time": detail.start,
            "end_time": detail.end,
        },
        "status": detail.appointment.status.as_str(),
        "message": message,
    })
    .to_string()
}
