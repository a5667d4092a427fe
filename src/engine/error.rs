use ulid::Ulid;

use crate::model::TokenStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    SlotNotFound(Ulid),
    DoctorNotFound(Ulid),
    TokenNotFound(Ulid),
    /// No committable outcome for a booking on this slot.
    NoCapacity(Ulid),
    AlreadyTerminal(Ulid),
    InvalidCategory(String),
    InvalidTransition {
        id: Ulid,
        from: TokenStatus,
        to: TokenStatus,
    },
    AlreadyExists(Ulid),
    InvalidSlot(&'static str),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotNotFound(id) => write!(f, "slot not found or inactive: {id}"),
            EngineError::DoctorNotFound(id) => write!(f, "doctor not found: {id}"),
            EngineError::TokenNotFound(id) => write!(f, "token not found: {id}"),
            EngineError::NoCapacity(id) => {
                write!(f, "no capacity: slot {id} is full and no later slot has room")
            }
            EngineError::AlreadyTerminal(id) => {
                write!(f, "token {id} is already cancelled, completed or no-show")
            }
            EngineError::InvalidCategory(c) => write!(f, "invalid token category: {c:?}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "token {id} cannot move from {from} to {to}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidSlot(msg) => write!(f, "invalid slot: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
