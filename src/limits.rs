//! Hard limits enforced at the engine boundary.

use crate::model::Ms;

pub const MAX_DOCTORS: usize = 10_000;
pub const MAX_SLOTS_PER_DOCTOR: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PATIENT_NAME_LEN: usize = 256;

/// Largest `max_capacity` a slot may declare.
pub const MAX_SLOT_CAPACITY: u32 = 1_000;

/// A single consultation window may not exceed one day.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * 3_600_000;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
