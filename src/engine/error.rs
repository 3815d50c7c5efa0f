use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input. Carries a display-ready reason.
    Validation(String),
    /// The requested time is held by this booking.
    AlreadyBooked(Ulid),
    NotFound(&'static str),
    Forbidden(&'static str),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    RateLimited {
        reset_at: Ms,
    },
    /// The log could not be written. Retryable; writes never fail open.
    StoreUnavailable(String),
}

/// Coarse error classes, one per wire-level error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    NotFound,
    Forbidden,
    RateLimited,
    Unavailable,
}

impl ErrorClass {
    pub fn sqlstate(self) -> &'static str {
        match self {
            ErrorClass::Validation => "22023",
            ErrorClass::Conflict => "23P01",
            ErrorClass::NotFound => "P0002",
            ErrorClass::Forbidden => "42501",
            ErrorClass::RateLimited => "53400",
            ErrorClass::Unavailable => "58030",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Conflict => "conflict",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Unavailable => "unavailable",
        }
    }
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Validation(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::LimitExceeded(_) => ErrorClass::Validation,
            EngineError::AlreadyBooked(_) => ErrorClass::Conflict,
            EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::Forbidden(_) => ErrorClass::Forbidden,
            EngineError::RateLimited { .. } => ErrorClass::RateLimited,
            EngineError::StoreUnavailable(_) => ErrorClass::Unavailable,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => f.write_str(msg),
            // The conflicting booking may belong to another owner.
            EngineError::AlreadyBooked(_) => f.write_str("already booked: the requested time is taken"),
            EngineError::NotFound(what) => write!(f, "{what} not found"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "booking cannot move from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::RateLimited { reset_at } => {
                write!(f, "too many requests, retry after {reset_at}")
            }
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable, retry later: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
