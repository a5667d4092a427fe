use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

// ── Priority policy ──────────────────────────────────────────────

/// Booking channel of a token. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Emergency,
    PaidPriority,
    FollowUp,
    Online,
    WalkIn,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Emergency,
        Category::PaidPriority,
        Category::FollowUp,
        Category::Online,
        Category::WalkIn,
    ];

    /// Lower rank = served first. Emergency is 1, walk-in is 5.
    pub fn rank(self) -> u8 {
        match self {
            Category::Emergency => 1,
            Category::PaidPriority => 2,
            Category::FollowUp => 3,
            Category::Online => 4,
            Category::WalkIn => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Emergency => "EMERGENCY",
            Category::PaidPriority => "PAID_PRIORITY",
            Category::FollowUp => "FOLLOW_UP",
            Category::Online => "ONLINE",
            Category::WalkIn => "WALK_IN",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| EngineError::InvalidCategory(s.to_string()))
    }
}

/// Parse free-form category text into its rank.
pub fn rank_of(category: &str) -> Result<u8, EngineError> {
    category.parse::<Category>().map(Category::rank)
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Booked,
    Cancelled,
    NoShow,
    /// Displaced from its slot. Stays here only when relocation found no room.
    Reallocated,
    Completed,
}

impl TokenStatus {
    /// Cancelled, no-show and completed tokens never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenStatus::Cancelled | TokenStatus::NoShow | TokenStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Booked => "BOOKED",
            TokenStatus::Cancelled => "CANCELLED",
            TokenStatus::NoShow => "NO_SHOW",
            TokenStatus::Reallocated => "REALLOCATED",
            TokenStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub span: Span,
    pub max_capacity: u32,
    pub active: bool,
    /// Snapshot of the booked-token count, refreshed after every ledger write.
    /// Allocation decisions never read it.
    pub occupied: u32,
}

impl Slot {
    pub fn new(id: Ulid, doctor_id: Ulid, span: Span, max_capacity: u32) -> Self {
        Self {
            id,
            doctor_id,
            span,
            max_capacity,
            active: true,
            occupied: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Ulid,
    pub patient_name: String,
    pub category: Category,
    pub rank: u8,
    pub slot_id: Ulid,
    pub status: TokenStatus,
    pub created_at: Ms,
    /// Monotonic booking sequence; also orders equal-rank tokens.
    pub seq: u64,
}

impl Token {
    pub fn new(
        id: Ulid,
        patient_name: String,
        category: Category,
        slot_id: Ulid,
        created_at: Ms,
        seq: u64,
    ) -> Self {
        Self {
            id,
            patient_name,
            category,
            rank: category.rank(),
            slot_id,
            status: TokenStatus::Booked,
            created_at,
            seq,
        }
    }

    /// Human-facing token number, e.g. `TKN-000042`.
    pub fn display_number(&self) -> String {
        format!("TKN-{:06}", self.seq)
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Committed state changes, broadcast per doctor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    DoctorRegistered {
        id: Ulid,
        name: String,
    },
    SlotOpened {
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        max_capacity: u32,
    },
    SlotClosed {
        id: Ulid,
        doctor_id: Ulid,
    },
    TokenBooked {
        id: Ulid,
        slot_id: Ulid,
        category: Category,
    },
    TokenRelocated {
        id: Ulid,
        from_slot: Ulid,
        to_slot: Ulid,
    },
    TokenStranded {
        id: Ulid,
        slot_id: Ulid,
    },
    TokenCancelled {
        id: Ulid,
        slot_id: Ulid,
    },
    TokenNoShow {
        id: Ulid,
        slot_id: Ulid,
    },
    TokenCompleted {
        id: Ulid,
        slot_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// How a booking request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The requested slot had room.
    Direct,
    /// Emergency admitted above `max_capacity`.
    Overflow,
    /// A lower-priority token was moved out of the requested slot.
    Displaced {
        token_id: Ulid,
        relocated_to: Option<Ulid>,
    },
    /// The requested slot was full; booked into a later slot of the same doctor.
    Redirected { requested_slot: Ulid },
}

impl Placement {
    pub fn label(&self) -> &'static str {
        match self {
            Placement::Direct => "direct",
            Placement::Overflow => "overflow",
            Placement::Displaced { .. } => "displaced",
            Placement::Redirected { .. } => "redirected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub token: Token,
    pub placement: Placement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub slot_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub max_capacity: u32,
    pub occupied: u32,
    pub available: u32,
    /// Booked tokens, emergency first.
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorSchedule {
    pub doctor: Doctor,
    pub slots: Vec<ScheduleSlot>,
}
