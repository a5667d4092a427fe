use ulid::Ulid;

use crate::model::*;

use super::capacity::occupied_count;
use super::store::{SlotRegistry, TokenLedger};

/// Earliest active slot of `doctor_id` starting strictly after `after` with
/// room below `max_capacity`. Relocation targets never get the emergency allowance.
pub fn next_available_slot<S: SlotRegistry + TokenLedger + ?Sized>(
    store: &S,
    doctor_id: &Ulid,
    after: Ms,
) -> Option<Slot> {
    store
        .list_active_by_doctor(doctor_id)
        .into_iter()
        .filter(|s| s.span.start > after)
        .find(|s| occupied_count(store, &s.id) < s.max_capacity)
}
