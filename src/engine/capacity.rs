use ulid::Ulid;

use crate::model::*;

use super::store::{SlotRegistry, TokenLedger};

/// Booked tokens currently referencing the slot, counted from the ledger.
pub fn occupied_count<L: TokenLedger + ?Sized>(ledger: &L, slot_id: &Ulid) -> u32 {
    ledger.list_by_slot(slot_id, TokenStatus::Booked).len() as u32
}

/// Emergencies may use one unit above `max_capacity`.
pub fn effective_limit(slot: &Slot, category: Category) -> u32 {
    match category {
        Category::Emergency => slot.max_capacity + 1,
        _ => slot.max_capacity,
    }
}

pub fn has_capacity<L: TokenLedger + ?Sized>(ledger: &L, slot: &Slot, category: Category) -> bool {
    occupied_count(ledger, &slot.id) < effective_limit(slot, category)
}

/// Re-derive the slot's occupied snapshot from the ledger and store it.
/// Must run after every ledger write touching the slot.
pub fn refresh<S: SlotRegistry + TokenLedger + ?Sized>(store: &S, slot_id: &Ulid) -> u32 {
    let occupied = occupied_count(store, slot_id);
    if let Some(mut slot) = store.find_slot(slot_id) {
        debug_assert!(
            occupied <= slot.max_capacity + 1,
            "slot {slot_id} holds {occupied} tokens, ceiling is {}",
            slot.max_capacity + 1
        );
        if slot.occupied != occupied {
            slot.occupied = occupied;
            store.update_slot(slot);
        }
    }
    occupied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::InMemoryStore;

    fn setup(max_capacity: u32, booked: usize) -> (InMemoryStore, Slot) {
        let store = InMemoryStore::new();
        let slot = Slot::new(Ulid::new(), Ulid::new(), Span::new(1000, 2000), max_capacity);
        store.insert_slot(slot.clone());
        for seq in 0..booked {
            store.insert_token(Token::new(
                Ulid::new(),
                format!("p{seq}"),
                Category::WalkIn,
                slot.id,
                0,
                seq as u64,
            ));
        }
        (store, slot)
    }

    #[test]
    fn occupied_counts_only_booked() {
        let (store, slot) = setup(3, 2);
        let mut t = store.list_by_slot(&slot.id, TokenStatus::Booked)[0].clone();
        t.status = TokenStatus::NoShow;
        store.update_token(t);
        assert_eq!(occupied_count(&store, &slot.id), 1);
    }

    #[test]
    fn full_slot_has_no_regular_capacity() {
        let (store, slot) = setup(2, 2);
        assert!(!has_capacity(&store, &slot, Category::PaidPriority));
        assert!(!has_capacity(&store, &slot, Category::WalkIn));
    }

    #[test]
    fn emergency_gets_one_extra_unit() {
        let (store, slot) = setup(2, 2);
        assert!(has_capacity(&store, &slot, Category::Emergency));

        let (store, slot) = setup(2, 3);
        assert!(!has_capacity(&store, &slot, Category::Emergency));
    }

    #[test]
    fn refresh_writes_snapshot() {
        let (store, slot) = setup(3, 2);
        assert_eq!(store.find_slot(&slot.id).unwrap().occupied, 0);
        assert_eq!(refresh(&store, &slot.id), 2);
        assert_eq!(store.find_slot(&slot.id).unwrap().occupied, 2);
    }

    #[test]
    fn refresh_unknown_slot_is_zero() {
        let store = InMemoryStore::new();
        assert_eq!(refresh(&store, &Ulid::new()), 0);
    }
}
