use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// A LISTEN channel name: `vet_<id>` or `user_<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyChannel {
    /// Slot and appointment changes on one veterinarian's schedule.
    Veterinarian(Ulid),
    /// Inbox deliveries and payment updates for one user.
    User(Ulid),
}

impl NotifyChannel {
    /// The hub key. Veterinarian and user ids never collide.
    pub fn key(&self) -> Ulid {
        match self {
            NotifyChannel::Veterinarian(id) | NotifyChannel::User(id) => *id,
        }
    }
}

impl fmt::Display for NotifyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyChannel::Veterinarian(id) => write!(f, "vet_{id}"),
            NotifyChannel::User(id) => write!(f, "user_{id}"),
        }
    }
}

impl FromStr for NotifyChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_matches('"');
        let (ctor, id): (fn(Ulid) -> Self, &str) = if let Some(id) = s.strip_prefix("vet_") {
            (NotifyChannel::Veterinarian, id)
        } else if let Some(id) = s.strip_prefix("user_") {
            (NotifyChannel::User, id)
        } else {
            return Err(format!("invalid channel: {s} (expected vet_{{id}} or user_{{id}})"));
        };
        Ulid::from_string(id)
            .map(ctor)
            .map_err(|e| format!("bad ULID in channel: {e}"))
    }
}

/// In-process broadcast hub. Channels are keyed by veterinarian id (slot and
/// appointment changes on their schedule) and by user id (inbox deliveries).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, key: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening; a channel whose
    /// receivers are all gone is dropped.
    pub fn send(&self, key: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&key) {
            if sender.send(event.clone()).is_ok() {
                return;
            }
        }
        self.prune(&key);
    }

    /// Drop a channel once it has no receivers left.
    pub fn prune(&self, key: &Ulid) {
        self.channels
            .remove_if(key, |_, sender| sender.receiver_count() == 0);
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
