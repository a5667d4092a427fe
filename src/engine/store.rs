use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Doctor lookup. Doctors are immutable once inserted.
pub trait DoctorDirectory: Send + Sync {
    fn find_doctor(&self, id: &Ulid) -> Option<Doctor>;
    fn insert_doctor(&self, doctor: Doctor);
    fn list_doctors(&self) -> Vec<Doctor>;
    fn doctor_count(&self) -> usize;
}

/// Slot storage. Listing by doctor is ordered by start time.
pub trait SlotRegistry: Send + Sync {
    fn find_slot(&self, id: &Ulid) -> Option<Slot>;
    fn insert_slot(&self, slot: Slot);
    /// Replace a stored slot. Doctor and span must not change.
    fn update_slot(&self, slot: Slot);
    fn list_by_doctor(&self, doctor_id: &Ulid) -> Vec<Slot>;

    fn list_active_by_doctor(&self, doctor_id: &Ulid) -> Vec<Slot> {
        let mut slots = self.list_by_doctor(doctor_id);
        slots.retain(|s| s.active);
        slots
    }
}

/// Sole owner of token records.
pub trait TokenLedger: Send + Sync {
    fn find_token(&self, id: &Ulid) -> Option<Token>;
    fn insert_token(&self, token: Token);
    /// Replace a stored token, following a changed `slot_id`.
    fn update_token(&self, token: Token);
    fn list_by_slot(&self, slot_id: &Ulid, status: TokenStatus) -> Vec<Token>;
    /// All tokens in `status`, in booking order.
    fn list_by_status(&self, status: TokenStatus) -> Vec<Token>;
    /// Highest token sequence number ever stored, 0 when empty.
    fn last_seq(&self) -> u64;
}

/// Everything the engine needs from its backing store.
pub trait Store: DoctorDirectory + SlotRegistry + TokenLedger {}

impl<T: DoctorDirectory + SlotRegistry + TokenLedger> Store for T {}

pub struct InMemoryStore {
    doctors: DashMap<Ulid, Doctor>,
    slots: DashMap<Ulid, Slot>,
    /// Doctor → `(start, slot_id)`, sorted by start.
    doctor_slots: DashMap<Ulid, Vec<(Ms, Ulid)>>,
    tokens: DashMap<Ulid, Token>,
    /// Slot → ids of every token that currently references it.
    slot_tokens: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            doctors: DashMap::new(),
            slots: DashMap::new(),
            doctor_slots: DashMap::new(),
            tokens: DashMap::new(),
            slot_tokens: DashMap::new(),
        }
    }

    fn link_token(&self, slot_id: Ulid, token_id: Ulid) {
        self.slot_tokens.entry(slot_id).or_default().push(token_id);
    }

    fn unlink_token(&self, slot_id: &Ulid, token_id: &Ulid) {
        if let Some(mut ids) = self.slot_tokens.get_mut(slot_id) {
            ids.retain(|t| t != token_id);
        }
    }
}

// ── Doctors ──────────────────────────────────────────────────

impl DoctorDirectory for InMemoryStore {
    fn find_doctor(&self, id: &Ulid) -> Option<Doctor> {
        self.doctors.get(id).map(|e| e.value().clone())
    }

    fn insert_doctor(&self, doctor: Doctor) {
        self.doctors.insert(doctor.id, doctor);
    }

    fn list_doctors(&self) -> Vec<Doctor> {
        let mut doctors: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        doctors.sort_by_key(|d| d.id);
        doctors
    }

    fn doctor_count(&self) -> usize {
        self.doctors.len()
    }
}

// ── Slots ────────────────────────────────────────────────────

impl SlotRegistry for InMemoryStore {
    fn find_slot(&self, id: &Ulid) -> Option<Slot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    fn insert_slot(&self, slot: Slot) {
        let mut index = self.doctor_slots.entry(slot.doctor_id).or_default();
        // Equal starts keep insertion order.
        let pos = index.partition_point(|(start, _)| *start <= slot.span.start);
        index.insert(pos, (slot.span.start, slot.id));
        drop(index);
        self.slots.insert(slot.id, slot);
    }

    fn update_slot(&self, slot: Slot) {
        self.slots.insert(slot.id, slot);
    }

    fn list_by_doctor(&self, doctor_id: &Ulid) -> Vec<Slot> {
        let ids: Vec<Ulid> = self
            .doctor_slots
            .get(doctor_id)
            .map(|e| e.value().iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.find_slot(id)).collect()
    }
}

// ── Tokens ───────────────────────────────────────────────────

impl TokenLedger for InMemoryStore {
    fn find_token(&self, id: &Ulid) -> Option<Token> {
        self.tokens.get(id).map(|e| e.value().clone())
    }

    fn insert_token(&self, token: Token) {
        self.link_token(token.slot_id, token.id);
        self.tokens.insert(token.id, token);
    }

    fn update_token(&self, token: Token) {
        let previous_slot = self.tokens.get(&token.id).map(|e| e.slot_id);
        match previous_slot {
            Some(prev) if prev != token.slot_id => {
                self.unlink_token(&prev, &token.id);
                self.link_token(token.slot_id, token.id);
            }
            Some(_) => {}
            None => self.link_token(token.slot_id, token.id),
        }
        self.tokens.insert(token.id, token);
    }

    fn list_by_slot(&self, slot_id: &Ulid, status: TokenStatus) -> Vec<Token> {
        let ids: Vec<Ulid> = self
            .slot_tokens
            .get(slot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.find_token(id))
            .filter(|t| t.status == status)
            .collect()
    }

    fn list_by_status(&self, status: TokenStatus) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .tokens
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.value().clone())
            .collect();
        tokens.sort_by_key(|t| t.seq);
        tokens
    }

    fn last_seq(&self) -> u64 {
        self.tokens.iter().map(|e| e.seq).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_at(doctor_id: Ulid, start: Ms) -> Slot {
        Slot::new(Ulid::new(), doctor_id, Span::new(start, start + 100), 2)
    }

    fn token_in(slot_id: Ulid, seq: u64) -> Token {
        Token::new(Ulid::new(), format!("p{seq}"), Category::Online, slot_id, 0, seq)
    }

    #[test]
    fn slots_listed_by_start_time() {
        let store = InMemoryStore::new();
        let doc = Ulid::new();
        let late = slot_at(doc, 3000);
        let early = slot_at(doc, 1000);
        let mid = slot_at(doc, 2000);
        store.insert_slot(late.clone());
        store.insert_slot(early.clone());
        store.insert_slot(mid.clone());

        let ids: Vec<Ulid> = store.list_by_doctor(&doc).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![early.id, mid.id, late.id]);
    }

    #[test]
    fn inactive_slots_hidden_from_active_listing() {
        let store = InMemoryStore::new();
        let doc = Ulid::new();
        let a = slot_at(doc, 1000);
        let mut b = slot_at(doc, 2000);
        store.insert_slot(a.clone());
        store.insert_slot(b.clone());
        b.active = false;
        store.update_slot(b);

        assert_eq!(store.list_by_doctor(&doc).len(), 2);
        let active = store.list_active_by_doctor(&doc);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[test]
    fn slots_of_other_doctors_not_listed() {
        let store = InMemoryStore::new();
        store.insert_slot(slot_at(Ulid::new(), 1000));
        assert!(store.list_by_doctor(&Ulid::new()).is_empty());
    }

    #[test]
    fn list_by_slot_filters_status() {
        let store = InMemoryStore::new();
        let slot = Ulid::new();
        let booked = token_in(slot, 1);
        let mut cancelled = token_in(slot, 2);
        store.insert_token(booked.clone());
        store.insert_token(cancelled.clone());
        cancelled.status = TokenStatus::Cancelled;
        store.update_token(cancelled.clone());

        let live = store.list_by_slot(&slot, TokenStatus::Booked);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, booked.id);
        assert_eq!(store.list_by_slot(&slot, TokenStatus::Cancelled)[0].id, cancelled.id);
    }

    #[test]
    fn update_token_follows_slot_change() {
        let store = InMemoryStore::new();
        let from = Ulid::new();
        let to = Ulid::new();
        let mut t = token_in(from, 1);
        store.insert_token(t.clone());

        t.slot_id = to;
        store.update_token(t.clone());

        assert!(store.list_by_slot(&from, TokenStatus::Booked).is_empty());
        assert_eq!(store.list_by_slot(&to, TokenStatus::Booked)[0].id, t.id);
    }

    #[test]
    fn list_by_status_in_booking_order() {
        let store = InMemoryStore::new();
        let slot = Ulid::new();
        for seq in [3, 1, 2] {
            let mut t = token_in(slot, seq);
            t.status = TokenStatus::Reallocated;
            store.insert_token(t);
        }
        let seqs: Vec<u64> = store
            .list_by_status(TokenStatus::Reallocated)
            .iter()
            .map(|t| t.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn doctor_directory_roundtrip() {
        let store = InMemoryStore::new();
        let d = Doctor { id: Ulid::new(), name: "Dr. Smith".into() };
        store.insert_doctor(d.clone());
        assert_eq!(store.find_doctor(&d.id), Some(d));
        assert_eq!(store.doctor_count(), 1);
        assert!(store.find_doctor(&Ulid::new()).is_none());
    }
}
