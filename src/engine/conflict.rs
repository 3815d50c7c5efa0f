use chrono::NaiveDate;

use crate::calendar::ReferenceZone;
use crate::limits::*;
use crate::model::*;

use super::availability::{day_view, project_bookings};
use super::{EngineError, SlotPolicy};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::validation("booking end must be after its start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_service_id(service_id: &str) -> Result<(), EngineError> {
    if service_id.trim().is_empty() {
        return Err(EngineError::validation("service id is required"));
    }
    if service_id.len() > MAX_SERVICE_ID_LEN {
        return Err(EngineError::LimitExceeded("service id too long"));
    }
    Ok(())
}

/// Each slot well-formed, declared slots pairwise disjoint.
pub(crate) fn validate_slots(slots: &[Slot]) -> Result<(), EngineError> {
    if slots.len() > MAX_SLOTS_PER_ENTRY {
        return Err(EngineError::LimitExceeded("too many slots in one day"));
    }
    for slot in slots {
        if !slot.is_well_formed() {
            return Err(EngineError::validation(format!(
                "invalid slot {slot}: end must be after start and within the day"
            )));
        }
    }
    let mut sorted = slots.to_vec();
    sorted.sort();
    if let Some(pair) = sorted.windows(2).find(|w| w[0].overlaps(&w[1])) {
        return Err(EngineError::validation(format!(
            "slots {} and {} overlap",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

/// The reference-zone date a booking falls on, and its minute-of-day slot.
/// A booking may end exactly at the next midnight but not later.
pub(crate) fn booking_day(zone: &ReferenceZone, span: &Span) -> Result<(NaiveDate, Slot), EngineError> {
    let date = zone.normalize_to_midnight(span.start);
    if span.end > zone.day_span(date).end {
        return Err(EngineError::validation(
            "a booking must start and end on the same day",
        ));
    }
    let slot = zone
        .project(span, date)
        .ok_or_else(|| EngineError::validation("booking does not fall on a calendar day"))?;
    Ok((date, slot))
}

/// Decide whether `span` can be booked with this caregiver for `service_id`.
/// Caller holds the caregiver lock for as long as the answer must stay true.
pub(crate) fn check_bookable(
    cs: &CaregiverState,
    service_id: &str,
    span: &Span,
    zone: &ReferenceZone,
    policy: SlotPolicy,
) -> Result<(), EngineError> {
    let (date, requested) = booking_day(zone, span)?;

    // The caregiver's time is shared across services.
    if let Some(existing) = cs.active_bookings_overlapping(span).next() {
        return Err(EngineError::AlreadyBooked(existing.id));
    }

    let entry = match cs.entry(service_id, date) {
        Some(entry) => entry,
        None => {
            return Err(EngineError::validation(format!(
                "caregiver has no availability for {service_id} on {date}"
            )));
        }
    };
    if entry.blocked {
        return Err(EngineError::validation(format!(
            "caregiver is unavailable on {date}"
        )));
    }

    let booked = project_bookings(cs, zone, date);
    match policy {
        SlotPolicy::WholeSlot => {
            let container = entry
                .slots
                .iter()
                .find(|slot| slot.contains(&requested))
                .ok_or_else(outside_declared)?;
            if let Some((id, _)) = booked.iter().find(|(_, b)| b.overlaps(container)) {
                return Err(EngineError::AlreadyBooked(*id));
            }
        }
        SlotPolicy::Split => {
            let booked_slots: Vec<Slot> = booked.iter().map(|(_, s)| *s).collect();
            let view = day_view(date, Some(entry), &booked_slots);
            if !view.free.iter().any(|free| free.contains(&requested)) {
                if let Some((id, _)) = booked.iter().find(|(_, b)| b.overlaps(&requested)) {
                    return Err(EngineError::AlreadyBooked(*id));
                }
                return Err(outside_declared());
            }
        }
    }
    Ok(())
}

fn outside_declared() -> EngineError {
    EngineError::validation("requested time is outside the caregiver's declared availability")
}
