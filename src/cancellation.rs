//! Refund/fee decision for a cancellation request.
//!
//! Pure: the decision depends only on the booking start, the current instant,
//! the booking total and the reference zone. Executing the refund belongs to
//! the payment collaborator.

use serde::Serialize;

use crate::calendar::ReferenceZone;
use crate::model::{Cents, HOUR_MS, Ms};

/// Cancelling this far ahead, before local noon, refunds everything.
pub const FULL_REFUND_NOTICE_MS: Ms = 24 * HOUR_MS;
/// Local hour from which a same-notice cancellation drops to the partial tier.
pub const FULL_REFUND_CUTOFF_HOUR: u32 = 12;
pub const PARTIAL_REFUND_PCT: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationTier {
    /// The booking has started or is in the past.
    TooLate,
    Full,
    Partial,
    /// Unreachable with a consistent clock; kept so every input has an answer.
    NoRefund,
}

impl CancellationTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CancellationTier::TooLate => "too_late",
            CancellationTier::Full => "full",
            CancellationTier::Partial => "partial",
            CancellationTier::NoRefund => "no_refund",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationDecision {
    pub can_cancel: bool,
    pub tier: CancellationTier,
    /// One of 0, 50, 100.
    pub refund_pct: u8,
    pub refund_amount: Cents,
    pub fee_amount: Cents,
    pub reason: &'static str,
}

impl CancellationDecision {
    fn new(can_cancel: bool, tier: CancellationTier, refund_pct: u8, total: Cents, reason: &'static str) -> Self {
        let refund_amount = percent_of(total, refund_pct);
        Self {
            can_cancel,
            tier,
            refund_pct,
            refund_amount,
            fee_amount: total - refund_amount,
            reason,
        }
    }
}

/// `total * pct / 100` rounded half-up to the minor unit.
pub fn percent_of(total: Cents, pct: u8) -> Cents {
    let scaled = i128::from(total) * i128::from(pct);
    let rounded = if scaled >= 0 {
        (scaled + 50) / 100
    } else {
        (scaled - 50) / 100
    };
    rounded as Cents
}

pub fn decide(booking_start: Ms, now: Ms, total: Cents, zone: &ReferenceZone) -> CancellationDecision {
    if now >= booking_start {
        return CancellationDecision::new(
            false,
            CancellationTier::TooLate,
            0,
            total,
            "the booking has already started and can no longer be cancelled",
        );
    }
    if booking_start - now >= FULL_REFUND_NOTICE_MS && zone.hour_of_day(now) < FULL_REFUND_CUTOFF_HOUR {
        return CancellationDecision::new(
            true,
            CancellationTier::Full,
            100,
            total,
            "cancelled at least 24 hours ahead and before noon: full refund",
        );
    }
    if booking_start > now {
        return CancellationDecision::new(
            true,
            CancellationTier::Partial,
            PARTIAL_REFUND_PCT,
            total,
            "late cancellation: 50% refund",
        );
    }
    CancellationDecision::new(true, CancellationTier::NoRefund, 0, total, "no refund applies")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn zone() -> ReferenceZone {
        ReferenceZone::from_offset_minutes(9 * 60).unwrap()
    }

    fn at(day: u32, hour: u16) -> Ms {
        zone().at(NaiveDate::from_ymd_opt(2026, 10, day).unwrap(), hour * 60)
    }

    #[test]
    fn started_booking_cannot_be_cancelled() {
        let d = decide(at(20, 10), at(20, 10), 10_000, &zone());
        assert!(!d.can_cancel);
        assert_eq!(d.tier, CancellationTier::TooLate);
        assert_eq!(d.refund_pct, 0);
        assert_eq!(d.refund_amount, 0);
        assert_eq!(d.fee_amount, 10_000);

        let past = decide(at(20, 10), at(21, 8), 10_000, &zone());
        assert!(!past.can_cancel);
    }

    #[test]
    fn early_morning_with_notice_is_full_refund() {
        let d = decide(at(22, 15), at(20, 11), 10_000, &zone());
        assert!(d.can_cancel);
        assert_eq!(d.refund_pct, 100);
        assert_eq!(d.refund_amount, 10_000);
        assert_eq!(d.fee_amount, 0);
    }

    #[test]
    fn afternoon_cancellation_is_partial_even_with_notice() {
        let d = decide(at(25, 9), at(20, 12), 10_000, &zone());
        assert_eq!(d.tier, CancellationTier::Partial);
        assert_eq!(d.refund_pct, 50);
        assert_eq!(d.refund_amount, 5_000);
        assert_eq!(d.fee_amount, 5_000);
    }

    #[test]
    fn short_notice_morning_is_partial() {
        let d = decide(at(20, 20), at(20, 9), 10_000, &zone());
        assert_eq!(d.refund_pct, 50);
    }

    #[test]
    fn exactly_24h_counts_as_notice() {
        let d = decide(at(21, 9), at(20, 9), 10_000, &zone());
        assert_eq!(d.refund_pct, 100);
    }

    #[test]
    fn noon_uses_reference_zone_hour() {
        // 04:00 UTC is 13:00 in UTC+9.
        let utc = ReferenceZone::utc();
        let now = utc.at(NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(), 4 * 60);
        let start = now + 3 * FULL_REFUND_NOTICE_MS;
        assert_eq!(decide(start, now, 100, &utc).refund_pct, 100);
        assert_eq!(decide(start, now, 100, &zone()).refund_pct, 50);
    }

    #[test]
    fn half_up_rounding_to_minor_unit() {
        assert_eq!(percent_of(1_001, 50), 501);
        assert_eq!(percent_of(999, 50), 500);
        assert_eq!(percent_of(1_000, 50), 500);
        assert_eq!(percent_of(0, 100), 0);
        let d = decide(at(20, 20), at(20, 9), 1_001, &zone());
        assert_eq!(d.refund_amount + d.fee_amount, 1_001);
    }
}
