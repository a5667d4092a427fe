use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-doctor broadcast of committed schedule events.
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

    /// Subscribe to a doctor's events. Creates the channel if needed.
    pub fn subscribe(&self, doctor_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(doctor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, doctor_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&doctor_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose receivers are all gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
