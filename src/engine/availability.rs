use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::ReferenceZone;
use crate::model::*;

// ── Merge algorithm ───────────────────────────────────────────────

/// Project a caregiver's active bookings onto `date`, sorted by start minute.
pub fn project_bookings(
    cs: &CaregiverState,
    zone: &ReferenceZone,
    date: NaiveDate,
) -> Vec<(Ulid, Slot)> {
    let day = zone.day_span(date);
    let mut projected: Vec<(Ulid, Slot)> = cs
        .active_bookings_overlapping(&day)
        .filter_map(|b| zone.project(&b.span, date).map(|slot| (b.id, slot)))
        .collect();
    projected.sort_by_key(|(_, slot)| slot.start);
    projected
}

/// Declared slots that can take a new booking.
///
/// No entry or a blocked entry yields nothing. Otherwise a declared slot that
/// overlaps any booked minute is excluded whole, even if only partly taken.
pub fn bookable_slots(entry: Option<&AvailabilityEntry>, booked: &[Slot]) -> Vec<Slot> {
    let Some(entry) = entry else {
        return Vec::new();
    };
    if entry.blocked {
        return Vec::new();
    }
    let mut slots: Vec<Slot> = entry
        .slots
        .iter()
        .filter(|slot| !booked.iter().any(|b| b.overlaps(slot)))
        .copied()
        .collect();
    slots.sort();
    slots
}

/// The rendering view for one day: `{bookable, free, booked, blocked}`.
pub fn day_view(date: NaiveDate, entry: Option<&AvailabilityEntry>, booked: &[Slot]) -> DaySlots {
    let mut booked_sorted = booked.to_vec();
    booked_sorted.sort();
    let booked = merge_overlapping(&booked_sorted);

    let blocked = entry.is_some_and(|e| e.blocked);
    let free = match entry {
        Some(e) if !e.blocked => {
            let mut declared = e.slots.clone();
            declared.sort();
            subtract_intervals(&merge_overlapping(&declared), &booked)
        }
        _ => Vec::new(),
    };

    DaySlots {
        date,
        bookable: bookable_slots(entry, &booked),
        free,
        booked,
        blocked,
    }
}

/// Merge sorted overlapping/adjacent slots into disjoint slots.
pub fn merge_overlapping(sorted: &[Slot]) -> Vec<Slot> {
    let mut merged: Vec<Slot> = Vec::new();
    for &slot in sorted {
        if let Some(last) = merged.last_mut()
            && slot.start <= last.end
        {
            last.end = last.end.max(slot.end);
            continue;
        }
        merged.push(slot);
    }
    merged
}

/// Both inputs sorted by start; `to_remove` must be disjoint.
pub fn subtract_intervals(base: &[Slot], to_remove: &[Slot]) -> Vec<Slot> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Slot::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Slot::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(start: u16, end: u16) -> Slot {
        Slot::new(start, end)
    }

    fn entry(slots: Vec<Slot>, blocked: bool) -> AvailabilityEntry {
        AvailabilityEntry {
            caregiver_id: Ulid::nil(),
            service_id: "DOG_WALKING".into(),
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            slots,
            blocked,
        }
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let merged = merge_overlapping(&[s(0, 60), s(60, 120), s(100, 200), s(300, 400)]);
        assert_eq!(merged, vec![s(0, 200), s(300, 400)]);
    }

    #[test]
    fn subtract_splits_base() {
        let free = subtract_intervals(&[s(540, 1020)], &[s(600, 660), s(900, 960)]);
        assert_eq!(free, vec![s(540, 600), s(660, 900), s(960, 1020)]);
    }

    #[test]
    fn subtract_removes_fully_covered() {
        assert!(subtract_intervals(&[s(600, 660)], &[s(500, 700)]).is_empty());
    }

    #[test]
    fn no_entry_means_nothing_bookable() {
        assert!(bookable_slots(None, &[]).is_empty());
    }

    #[test]
    fn blocked_entry_dominates_slots() {
        let e = entry(vec![s(540, 720)], true);
        assert!(bookable_slots(Some(&e), &[]).is_empty());
        let view = day_view(e.date, Some(&e), &[]);
        assert!(view.blocked);
        assert!(view.free.is_empty());
        assert!(view.bookable.is_empty());
    }

    #[test]
    fn partially_booked_slot_excluded_whole() {
        let e = entry(vec![s(540, 720), s(840, 1020)], false);
        let bookable = bookable_slots(Some(&e), &[s(600, 630)]);
        assert_eq!(bookable, vec![s(840, 1020)]);
    }

    #[test]
    fn adjacent_booking_does_not_exclude() {
        let e = entry(vec![s(540, 720)], false);
        assert_eq!(bookable_slots(Some(&e), &[s(720, 780)]), vec![s(540, 720)]);
    }

    #[test]
    fn view_reports_free_and_booked() {
        let e = entry(vec![s(540, 720)], false);
        let view = day_view(e.date, Some(&e), &[s(600, 630), s(610, 640)]);
        assert_eq!(view.booked, vec![s(600, 640)]);
        assert_eq!(view.free, vec![s(540, 600), s(640, 720)]);
        assert!(view.bookable.is_empty());
        assert!(!view.blocked);
    }
}
