//! Conflict resolution for keyed candle writes.
//!
//! Storage engines enforce the same rules at the SQL level; this function
//! is the authoritative, unit-testable statement of them.

use candela_types::{Candle, ValidationError};

/// Why a candle write was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The incoming candle violates a data invariant.
    Invalid(ValidationError),
    /// The stored row is confirmed and the incoming values differ.
    ConfirmedImmutable,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(err) => write!(f, "invalid: {err}"),
            Self::ConfirmedImmutable => write!(f, "stored row is confirmed and immutable"),
        }
    }
}

/// Outcome of resolving an incoming candle against the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Insert or overwrite the stored row with the incoming values.
    Apply,
    /// No-op: the stored row is confirmed and the values already match.
    Skip,
    /// Do not write; report the reason.
    Reject(RejectReason),
}

/// Decides whether an incoming candle may replace the stored row.
///
/// Rules, in order:
/// 1. An incoming candle that fails validation is rejected outright.
/// 2. A confirmed stored row is immutable: differing values are rejected,
///    identical values are a harmless no-op.
/// 3. Everything else applies — last write wins while the bucket is open.
#[must_use]
pub fn resolve(existing: Option<&Candle>, incoming: &Candle, now_ms: i64) -> Resolution {
    if let Err(err) = incoming.validate(now_ms) {
        return Resolution::Reject(RejectReason::Invalid(err));
    }
    match existing {
        Some(stored) if stored.confirmed => {
            if stored.same_values(incoming) {
                Resolution::Skip
            } else {
                Resolution::Reject(RejectReason::ConfirmedImmutable)
            }
        }
        _ => Resolution::Apply,
    }
}
