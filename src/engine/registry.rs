use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::{DoctorDirectory, SlotRegistry};
use super::{Engine, EngineError};

/// Reject slot windows outside the accepted range. Callers check `start < end` first.
fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_doctor(&self, id: Ulid, name: String) -> Result<Doctor, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("doctor name too long"));
        }
        let _guard = self.registration.lock().await;
        if self.store().find_doctor(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store().doctor_count() >= MAX_DOCTORS {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }

        let doctor = Doctor { id, name };
        self.store().insert_doctor(doctor.clone());
        info!("registered doctor {id} ({})", doctor.name);
        self.publish(
            id,
            &Event::DoctorRegistered {
                id,
                name: doctor.name.clone(),
            },
        );
        Ok(doctor)
    }

    pub async fn open_slot(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        start: Ms,
        end: Ms,
        max_capacity: u32,
    ) -> Result<Slot, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidSlot("start must be before end"));
        }
        if max_capacity == 0 {
            return Err(EngineError::InvalidSlot("max_capacity must be positive"));
        }
        if max_capacity > MAX_SLOT_CAPACITY {
            return Err(EngineError::LimitExceeded("slot capacity too large"));
        }
        let span = Span::new(start, end);
        validate_span(&span)?;

        if self.store().find_doctor(&doctor_id).is_none() {
            return Err(EngineError::DoctorNotFound(doctor_id));
        }
        let _guard = self.lock_schedule(doctor_id).await;
        if self.store().find_slot(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store().list_by_doctor(&doctor_id).len() >= MAX_SLOTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many slots for doctor"));
        }

        let slot = Slot::new(id, doctor_id, span, max_capacity);
        self.store().insert_slot(slot.clone());
        self.publish(
            doctor_id,
            &Event::SlotOpened {
                id,
                doctor_id,
                span,
                max_capacity,
            },
        );
        Ok(slot)
    }

    /// Deactivate a slot. Its tokens keep their status and slot reference, but
    /// the slot takes no new bookings and is no longer a relocation target.
    /// Closing a closed slot is a no-op.
    pub async fn close_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let doctor_id = self
            .store()
            .find_slot(&id)
            .map(|s| s.doctor_id)
            .ok_or(EngineError::SlotNotFound(id))?;
        let _guard = self.lock_schedule(doctor_id).await;
        let mut slot = self
            .store()
            .find_slot(&id)
            .ok_or(EngineError::SlotNotFound(id))?;
        if !slot.active {
            return Ok(slot);
        }

        slot.active = false;
        self.store().update_slot(slot.clone());
        info!("closed slot {id} with {} booked", slot.occupied);
        self.publish(doctor_id, &Event::SlotClosed { id, doctor_id });
        Ok(slot)
    }
}
