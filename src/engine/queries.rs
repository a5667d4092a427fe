use ulid::Ulid;

use crate::model::*;

use super::capacity::occupied_count;
use super::store::{DoctorDirectory, SlotRegistry, TokenLedger};
use super::{Engine, EngineError};

impl Engine {
    pub fn get_token(&self, token_id: Ulid) -> Result<Token, EngineError> {
        self.store()
            .find_token(&token_id)
            .ok_or(EngineError::TokenNotFound(token_id))
    }

    pub fn list_doctors(&self) -> Vec<Doctor> {
        self.store().list_doctors()
    }

    /// Every slot of the doctor, closed ones included, ordered by start.
    pub fn list_slots(&self, doctor_id: Ulid) -> Result<Vec<Slot>, EngineError> {
        if self.store().find_doctor(&doctor_id).is_none() {
            return Err(EngineError::DoctorNotFound(doctor_id));
        }
        Ok(self.store().list_by_doctor(&doctor_id))
    }

    /// Booked count of a slot, derived from the ledger.
    pub fn occupancy(&self, slot_id: Ulid) -> Result<u32, EngineError> {
        if self.store().find_slot(&slot_id).is_none() {
            return Err(EngineError::SlotNotFound(slot_id));
        }
        Ok(occupied_count(self.store(), &slot_id))
    }

    /// Tokens displaced with nowhere to go, oldest booking first.
    pub fn stranded_tokens(&self) -> Vec<Token> {
        self.store().list_by_status(TokenStatus::Reallocated)
    }

    /// Active slots by start, each with its booked tokens by priority. Taken
    /// under the schedule lock so counts and token lists agree.
    pub async fn doctor_schedule(&self, doctor_id: Ulid) -> Result<DoctorSchedule, EngineError> {
        let doctor = self
            .store()
            .find_doctor(&doctor_id)
            .ok_or(EngineError::DoctorNotFound(doctor_id))?;
        let _guard = self.lock_schedule(doctor_id).await;

        let slots = self
            .store()
            .list_active_by_doctor(&doctor_id)
            .into_iter()
            .map(|slot| {
                let mut tokens = self.store().list_by_slot(&slot.id, TokenStatus::Booked);
                tokens.sort_by_key(|t| (t.rank, t.seq));
                let occupied = tokens.len() as u32;
                ScheduleSlot {
                    slot_id: slot.id,
                    start: slot.span.start,
                    end: slot.span.end,
                    max_capacity: slot.max_capacity,
                    occupied,
                    available: slot.max_capacity.saturating_sub(occupied),
                    tokens,
                }
            })
            .collect();

        Ok(DoctorSchedule { doctor, slots })
    }

    pub async fn all_schedules(&self) -> Vec<DoctorSchedule> {
        let mut out = Vec::new();
        for doctor in self.list_doctors() {
            if let Ok(schedule) = self.doctor_schedule(doctor.id).await {
                out.push(schedule);
            }
        }
        out
    }
}
