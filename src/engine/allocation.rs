use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::capacity::{effective_limit, occupied_count};
use super::locator::next_available_slot;
use super::store::{SlotRegistry, TokenLedger};
use super::{Engine, EngineError};

/// Booking decision, computed against a locked schedule before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Create the token in `slot`.
    Admit { slot: Slot, placement: Placement },
    /// Move `victim` out of `slot` (to `relocate_to` when a later slot has room),
    /// then create the token in `slot`.
    Displace {
        slot: Slot,
        victim: Token,
        relocate_to: Option<Slot>,
    },
}

/// The token a higher-priority booking would push out: the worst rank, and
/// among equal ranks the most recently booked one.
fn displacement_candidate(booked: &[Token]) -> Option<&Token> {
    booked.iter().max_by_key(|t| (t.rank, t.seq))
}

/// Decide how a `category` request for `slot` is satisfied.
///
/// 1. Below the effective limit (`max_capacity`, or `max_capacity + 1` for
///    emergencies) the token goes straight in.
/// 2. Otherwise, if the incoming rank beats the displacement candidate, that
///    token is moved to the doctor's next slot with room.
/// 3. Otherwise the request itself goes to the next slot with room.
pub fn plan_booking<S: SlotRegistry + TokenLedger + ?Sized>(
    store: &S,
    slot: &Slot,
    category: Category,
) -> Result<Plan, EngineError> {
    let occupied = occupied_count(store, &slot.id);
    if occupied < effective_limit(slot, category) {
        let placement = if occupied >= slot.max_capacity {
            Placement::Overflow
        } else {
            Placement::Direct
        };
        return Ok(Plan::Admit {
            slot: slot.clone(),
            placement,
        });
    }

    let booked = store.list_by_slot(&slot.id, TokenStatus::Booked);
    if let Some(victim) = displacement_candidate(&booked)
        && category.rank() < victim.rank
    {
        return Ok(Plan::Displace {
            slot: slot.clone(),
            victim: victim.clone(),
            relocate_to: next_available_slot(store, &slot.doctor_id, slot.span.start),
        });
    }

    match next_available_slot(store, &slot.doctor_id, slot.span.start) {
        Some(target) => Ok(Plan::Admit {
            slot: target,
            placement: Placement::Redirected {
                requested_slot: slot.id,
            },
        }),
        None => Err(EngineError::NoCapacity(slot.id)),
    }
}

impl Engine {
    /// Book a token for `patient_name` in `slot_id`, displacing or redirecting
    /// as the priority rules require.
    pub async fn book_token(
        &self,
        patient_name: String,
        category: Category,
        slot_id: Ulid,
    ) -> Result<BookingReceipt, EngineError> {
        if patient_name.len() > crate::limits::MAX_PATIENT_NAME_LEN {
            return Err(EngineError::LimitExceeded("patient name too long"));
        }
        let doctor_id = self.active_slot(&slot_id)?.doctor_id;
        let _guard = self.lock_schedule(doctor_id).await;
        let slot = self.active_slot(&slot_id)?;

        let plan = plan_booking(self.store(), &slot, category).inspect_err(|_| {
            metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL).increment(1);
        })?;

        let receipt = match plan {
            Plan::Admit { slot, placement } => {
                if let Placement::Redirected { requested_slot } = placement {
                    debug!("slot {requested_slot} full, redirecting {category} booking to {}", slot.id);
                }
                let token = self.create_token(patient_name, category, &slot);
                BookingReceipt { token, placement }
            }
            Plan::Displace {
                slot,
                victim,
                relocate_to,
            } => {
                let relocated_to = self.displace(&slot, victim.clone(), relocate_to.as_ref());
                let token = self.create_token(patient_name, category, &slot);
                BookingReceipt {
                    token,
                    placement: Placement::Displaced {
                        token_id: victim.id,
                        relocated_to,
                    },
                }
            }
        };

        metrics::counter!(
            crate::observability::BOOKINGS_TOTAL,
            "placement" => receipt.placement.label()
        )
        .increment(1);
        Ok(receipt)
    }

    /// Emergency booking: same rules, category forced to `Emergency`.
    pub async fn emergency_token(
        &self,
        patient_name: String,
        slot_id: Ulid,
    ) -> Result<BookingReceipt, EngineError> {
        self.book_token(patient_name, Category::Emergency, slot_id).await
    }

    /// Move `victim` out of `from`. Without a target the token is left
    /// `Reallocated` on its old slot reference and reported as stranded.
    fn displace(&self, from: &Slot, mut victim: Token, target: Option<&Slot>) -> Option<Ulid> {
        metrics::counter!(crate::observability::DISPLACEMENTS_TOTAL).increment(1);
        let event = match target {
            Some(target) => {
                victim.slot_id = target.id;
                victim.status = TokenStatus::Booked;
                info!(
                    "token {} ({}) displaced from slot {} to slot {}",
                    victim.display_number(),
                    victim.category,
                    from.id,
                    target.id
                );
                Event::TokenRelocated {
                    id: victim.id,
                    from_slot: from.id,
                    to_slot: target.id,
                }
            }
            None => {
                victim.status = TokenStatus::Reallocated;
                warn!(
                    "token {} ({}) displaced from slot {} with no later slot free; stranded",
                    victim.display_number(),
                    victim.category,
                    from.id
                );
                metrics::counter!(crate::observability::STRANDED_TOTAL).increment(1);
                Event::TokenStranded {
                    id: victim.id,
                    slot_id: from.id,
                }
            }
        };

        self.store().update_token(victim);
        self.refresh_capacity(&from.id);
        if let Some(target) = target {
            self.refresh_capacity(&target.id);
        }
        self.publish(from.doctor_id, &event);
        target.map(|t| t.id)
    }
}
