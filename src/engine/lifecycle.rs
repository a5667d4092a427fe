use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::store::{SlotRegistry, TokenLedger};
use super::{Engine, EngineError, now_ms};

impl Engine {
    /// Commit a new `Booked` token in `slot`. Caller holds the doctor's schedule
    /// lock and has already checked capacity.
    pub(super) fn create_token(&self, patient_name: String, category: Category, slot: &Slot) -> Token {
        let token = Token::new(
            Ulid::new(),
            patient_name,
            category,
            slot.id,
            now_ms(),
            self.next_seq(),
        );
        self.store().insert_token(token.clone());
        self.refresh_capacity(&slot.id);
        debug!(
            "booked {} ({category}) in slot {}",
            token.display_number(),
            slot.id
        );
        self.publish(
            slot.doctor_id,
            &Event::TokenBooked {
                id: token.id,
                slot_id: slot.id,
                category,
            },
        );
        token
    }

    /// Write a status change and free the slot unit it held.
    fn transition(&self, mut token: Token, to: TokenStatus) -> Result<Token, EngineError> {
        let doctor_id = self
            .store()
            .find_slot(&token.slot_id)
            .map(|s| s.doctor_id)
            .ok_or(EngineError::SlotNotFound(token.slot_id))?;
        let from = token.status;
        token.status = to;
        self.store().update_token(token.clone());
        self.refresh_capacity(&token.slot_id);

        let (id, slot_id) = (token.id, token.slot_id);
        let event = match to {
            TokenStatus::Cancelled => Event::TokenCancelled { id, slot_id },
            TokenStatus::NoShow => Event::TokenNoShow { id, slot_id },
            _ => Event::TokenCompleted { id, slot_id },
        };
        self.publish(doctor_id, &event);
        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "to" => to.as_str()
        )
        .increment(1);
        info!("token {} {from} -> {to}", token.display_number());
        Ok(token)
    }

    /// Cancel a booked or stranded token.
    pub async fn cancel_token(&self, token_id: Ulid) -> Result<Token, EngineError> {
        let (_guard, token) = self.lock_token(&token_id).await?;
        if token.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(token_id));
        }
        self.transition(token, TokenStatus::Cancelled)
    }

    /// Mark a booked token as no-show. Repeating the call on a no-show token is
    /// a no-op that returns the token unchanged.
    pub async fn mark_no_show(&self, token_id: Ulid) -> Result<Token, EngineError> {
        let (_guard, token) = self.lock_token(&token_id).await?;
        match token.status {
            TokenStatus::Booked => self.transition(token, TokenStatus::NoShow),
            TokenStatus::NoShow => Ok(token),
            TokenStatus::Cancelled | TokenStatus::Completed => {
                Err(EngineError::AlreadyTerminal(token_id))
            }
            TokenStatus::Reallocated => Err(EngineError::InvalidTransition {
                id: token_id,
                from: token.status,
                to: TokenStatus::NoShow,
            }),
        }
    }

    pub async fn complete_token(&self, token_id: Ulid) -> Result<Token, EngineError> {
        let (_guard, token) = self.lock_token(&token_id).await?;
        match token.status {
            TokenStatus::Booked => self.transition(token, TokenStatus::Completed),
            s if s.is_terminal() => Err(EngineError::AlreadyTerminal(token_id)),
            from => Err(EngineError::InvalidTransition {
                id: token_id,
                from,
                to: TokenStatus::Completed,
            }),
        }
    }

    /// Place a stranded token into `slot_id` by hand. The target must be an
    /// active slot of the same doctor with room below `max_capacity`.
    pub async fn reassign_token(&self, token_id: Ulid, slot_id: Ulid) -> Result<Token, EngineError> {
        let (_guard, mut token) = self.lock_token(&token_id).await?;
        if token.status != TokenStatus::Reallocated {
            if token.status.is_terminal() {
                return Err(EngineError::AlreadyTerminal(token_id));
            }
            return Err(EngineError::InvalidTransition {
                id: token_id,
                from: token.status,
                to: TokenStatus::Booked,
            });
        }

        let from = self
            .store()
            .find_slot(&token.slot_id)
            .ok_or(EngineError::SlotNotFound(token.slot_id))?;
        let target = self.active_slot(&slot_id)?;
        if target.doctor_id != from.doctor_id {
            return Err(EngineError::SlotNotFound(slot_id));
        }
        if super::occupied_count(self.store(), &target.id) >= target.max_capacity {
            return Err(EngineError::NoCapacity(slot_id));
        }

        token.slot_id = target.id;
        token.status = TokenStatus::Booked;
        self.store().update_token(token.clone());
        self.refresh_capacity(&from.id);
        self.refresh_capacity(&target.id);
        info!(
            "stranded token {} reassigned to slot {}",
            token.display_number(),
            target.id
        );
        self.publish(
            target.doctor_id,
            &Event::TokenRelocated {
                id: token.id,
                from_slot: from.id,
                to_slot: target.id,
            },
        );
        Ok(token)
    }
}
