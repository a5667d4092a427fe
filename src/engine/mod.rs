mod allocation;
mod capacity;
mod error;
mod lifecycle;
mod locator;
mod queries;
mod registry;
pub mod store;

pub use allocation::{Plan, plan_booking};
pub use capacity::{effective_limit, has_capacity, occupied_count};
pub use error::EngineError;
pub use locator::next_available_slot;
pub use store::{DoctorDirectory, InMemoryStore, SlotRegistry, Store, TokenLedger};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub struct Engine {
    store: Arc<dyn Store>,
    pub notify: Arc<NotifyHub>,
    /// Doctor id → lock over that doctor's entire slot set. Displacement and
    /// relocation touch two slots of the same doctor, so a per-slot lock is not enough.
    schedule_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes doctor registration so the directory limit holds.
    registration: Mutex<()>,
    /// Last issued token sequence number.
    seq: AtomicU64,
}

impl Engine {
    pub fn new(notify: Arc<NotifyHub>) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), notify)
    }

    /// Build an engine over an existing store. Token numbering resumes after
    /// the highest sequence already in the ledger.
    pub fn with_store(store: Arc<dyn Store>, notify: Arc<NotifyHub>) -> Self {
        let last = store.last_seq();
        Self {
            store,
            notify,
            schedule_locks: DashMap::new(),
            registration: Mutex::new(()),
            seq: AtomicU64::new(last),
        }
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    /// Events for one doctor's schedule.
    pub fn subscribe(&self, doctor_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(doctor_id)
    }

    pub(super) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Acquire exclusive access to a doctor's slot set.
    pub(super) async fn lock_schedule(&self, doctor_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self
            .schedule_locks
            .entry(doctor_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Look up an active slot.
    pub(super) fn active_slot(&self, slot_id: &Ulid) -> Result<Slot, EngineError> {
        self.store
            .find_slot(slot_id)
            .filter(|s| s.active)
            .ok_or(EngineError::SlotNotFound(*slot_id))
    }

    /// Lookup token → slot → doctor, lock the doctor's schedule, then re-read the
    /// token so the caller sees the state as of lock acquisition.
    pub(super) async fn lock_token(
        &self,
        token_id: &Ulid,
    ) -> Result<(OwnedMutexGuard<()>, Token), EngineError> {
        let token = self
            .store
            .find_token(token_id)
            .ok_or(EngineError::TokenNotFound(*token_id))?;
        let slot = self
            .store
            .find_slot(&token.slot_id)
            .ok_or(EngineError::SlotNotFound(token.slot_id))?;
        let guard = self.lock_schedule(slot.doctor_id).await;
        let token = self
            .store
            .find_token(token_id)
            .ok_or(EngineError::TokenNotFound(*token_id))?;
        Ok((guard, token))
    }

    /// Recompute the occupied snapshot of a slot from the ledger.
    pub(super) fn refresh_capacity(&self, slot_id: &Ulid) -> u32 {
        capacity::refresh(&*self.store, slot_id)
    }

    pub(super) fn publish(&self, doctor_id: Ulid, event: &Event) {
        self.notify.send(doctor_id, event);
    }
}
