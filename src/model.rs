use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for absolute instants (booking times, counters).
pub type Ms = i64;

/// Money in the currency's minor unit.
pub type Cents = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;
pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open instant interval `[start, end)`.
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

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Half-open minute-of-day interval `[start, end)` on a single reference-zone date.
///
/// Construction through struct literals is allowed so that callers can carry
/// unvalidated input to the engine, which rejects anything that is not
/// `0 <= start < end <= 1440`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: u16,
    pub end: u16,
}

impl Slot {
    pub const FULL_DAY: Slot = Slot {
        start: 0,
        end: MINUTES_PER_DAY,
    };

    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start < end && end <= MINUTES_PER_DAY, "malformed slot {start}..{end}");
        Self { start, end }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end && self.end <= MINUTES_PER_DAY
    }

    pub fn minutes(&self) -> u16 {
        self.end - self.start
    }

    /// `[s1,e1)` and `[s2,e2)` overlap iff `max(s1,s2) < min(e1,e2)`.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }

    pub fn contains(&self, other: &Slot) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_minute(&self, minute: u16) -> bool {
        self.start <= minute && minute < self.end
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

/// A caregiver's declaration for one service on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityEntry {
    pub caregiver_id: Ulid,
    pub service_id: String,
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
    /// Full-day override: nothing on this date is bookable, whatever `slots` says.
    pub blocked: bool,
}

impl AvailabilityEntry {
    pub fn is_available(&self) -> bool {
        !self.blocked && !self.slots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Declined,
    Paid,
    Completed,
    Cancelled,
    Refunded,
    Archived,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Declined => "declined",
            BookingStatus::Paid => "paid",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Refunded => "refunded",
            BookingStatus::Archived => "archived",
        }
    }

    /// Whether a booking in this status still occupies the caregiver's time.
    pub fn holds_time(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::Declined)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Accepted | BookingStatus::Paid
        )
    }

    /// Lifecycle edges other than cancellation, which goes through the policy engine.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Declined)
                | (Accepted, Paid)
                | (Paid, Completed)
                | (Refunded, Cancelled)
                | (Completed, Archived)
                | (Cancelled, Archived)
                | (Declined, Archived)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "accepted" => Ok(BookingStatus::Accepted),
            "declined" => Ok(BookingStatus::Declined),
            "paid" => Ok(BookingStatus::Paid),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "refunded" => Ok(BookingStatus::Refunded),
            "archived" => Ok(BookingStatus::Archived),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub caregiver_id: Ulid,
    pub service_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub amount: Cents,
}

/// Caregiver attributes used for eligibility and ranking.
///
/// `services` and `work_regions` hold the serialized text the profile
/// collaborator stores (JSON arrays of strings). They are parsed on access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaregiverProfile {
    pub id: Ulid,
    pub approved: bool,
    pub active: bool,
    pub services: String,
    pub region: Option<String>,
    pub work_regions: String,
    pub postal_code: Option<String>,
}

impl CaregiverProfile {
    pub fn service_list(&self) -> Vec<String> {
        parse_string_list(&self.services, self.id, "services")
    }

    pub fn work_region_list(&self) -> Vec<String> {
        parse_string_list(&self.work_regions, self.id, "work_regions")
    }

    pub fn offers(&self, service_id: &str) -> bool {
        self.service_list()
            .iter()
            .any(|s| s.eq_ignore_ascii_case(service_id))
    }
}

/// Decode a serialized string list. Blank text is an empty list; anything
/// that is not a JSON array of strings is treated as empty and logged.
pub fn parse_string_list(raw: &str, caregiver_id: Ulid, field: &'static str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(trimmed) {
        Ok(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!(%caregiver_id, field, "malformed serialized list, treating as empty: {e}");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub key: String,
    pub window_start: Ms,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Caregiver,
    Admin,
}

/// The caller as resolved by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn owner(user_id: Ulid) -> Self {
        Self {
            user_id,
            role: Role::Owner,
        }
    }

    pub fn caregiver(user_id: Ulid) -> Self {
        Self {
            user_id,
            role: Role::Caregiver,
        }
    }

    pub fn admin() -> Self {
        Self {
            user_id: Ulid::nil(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act for anyone; everyone else only for themselves in their own role.
    pub fn acts_as(&self, role: Role, user_id: Ulid) -> bool {
        self.is_admin() || (self.role == role && self.user_id == user_id)
    }
}

/// Everything the engine knows about one caregiver.
#[derive(Debug, Clone)]
pub struct CaregiverState {
    pub profile: CaregiverProfile,
    /// Registration order, used as the stable tie-break when ranking.
    pub seq: u64,
    /// Declared availability keyed by (date, service).
    pub availability: BTreeMap<(NaiveDate, String), AvailabilityEntry>,
    /// All bookings, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl CaregiverState {
    pub fn new(profile: CaregiverProfile, seq: u64) -> Self {
        Self {
            profile,
            seq,
            availability: BTreeMap::new(),
            bookings: Vec::new(),
        }
    }

    pub fn entry(&self, service_id: &str, date: NaiveDate) -> Option<&AvailabilityEntry> {
        self.availability.get(&(date, service_id.to_string()))
    }

    /// Entries for one service between `from` and `to`, both inclusive.
    pub fn entries_between(
        &self,
        service_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> impl Iterator<Item = &AvailabilityEntry> {
        self.availability
            .range((from, String::new())..)
            .take_while(move |((date, _), _)| *date <= to)
            .filter(move |((_, service), _)| service == service_id)
            .map(|(_, entry)| entry)
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings still holding time whose span overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn active_bookings_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start && b.status.holds_time())
    }
}

/// WAL record format. One event is one atomic state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CaregiverUpserted {
        profile: CaregiverProfile,
    },
    /// Replace-for-key: supersedes whatever was declared for (caregiver, service, date).
    AvailabilitySet {
        entry: AvailabilityEntry,
    },
    AvailabilityCleared {
        caregiver_id: Ulid,
        service_id: String,
        date: NaiveDate,
    },
    /// Drops every entry dated strictly before `before`, for all caregivers.
    AvailabilityPurged {
        before: NaiveDate,
    },
    BookingRequested {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        caregiver_id: Ulid,
        status: BookingStatus,
    },
    CounterUpdated {
        counter: RateLimitCounter,
    },
    CounterSwept {
        key: String,
    },
}

/// The per-day view of a caregiver's calendar for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySlots {
    pub date: NaiveDate,
    /// Declared slots that can take a new booking under whole-slot validation.
    pub bookable: Vec<Slot>,
    /// Declared time minus booked time, for rendering partial occupancy.
    pub free: Vec<Slot>,
    pub booked: Vec<Slot>,
    pub blocked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            caregiver_id: Ulid::nil(),
            service_id: "DOG_WALKING".into(),
            span: Span::new(start, end),
            status,
            amount: 1000,
        }
    }

    fn profile(services: &str) -> CaregiverProfile {
        CaregiverProfile {
            id: Ulid::new(),
            approved: true,
            active: true,
            services: services.into(),
            region: None,
            work_regions: String::new(),
            postal_code: None,
        }
    }

    #[test]
    fn slot_overlap_is_half_open() {
        let a = Slot::new(540, 720);
        let b = Slot::new(600, 660);
        let c = Slot::new(720, 780);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent
        assert!(a.contains(&b));
        assert!(!b.contains(&a));
    }

    #[test]
    fn slot_well_formedness() {
        assert!(Slot::FULL_DAY.is_well_formed());
        assert!(!Slot { start: 600, end: 600 }.is_well_formed());
        assert!(!Slot { start: 700, end: 600 }.is_well_formed());
        assert!(!Slot { start: 0, end: 1441 }.is_well_formed());
    }

    #[test]
    fn slot_display() {
        assert_eq!(Slot::new(540, 1080).to_string(), "09:00-18:00");
        assert_eq!(Slot::FULL_DAY.to_string(), "00:00-24:00");
    }

    #[test]
    fn only_cancelled_and_declined_release_time() {
        use BookingStatus::*;
        for status in [Pending, Accepted, Paid, Completed, Refunded, Archived] {
            assert!(status.holds_time(), "{status} should hold time");
        }
        assert!(!Cancelled.holds_time());
        assert!(!Declined.holds_time());
    }

    #[test]
    fn lifecycle_edges() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(Paid));
        assert!(Paid.can_transition_to(Completed));
        assert!(Refunded.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Archived.can_transition_to(Archived));
        assert!(!Pending.can_transition_to(Paid));
    }

    #[test]
    fn status_parse_roundtrip_and_spelling() {
        assert_eq!("ACCEPTED".parse::<BookingStatus>().unwrap(), BookingStatus::Accepted);
        assert_eq!("canceled".parse::<BookingStatus>().unwrap(), BookingStatus::Cancelled);
        assert!("bogus".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn malformed_service_list_reads_as_empty() {
        assert!(profile("not json").service_list().is_empty());
        assert!(profile("{\"a\":1}").service_list().is_empty());
        assert!(profile("").service_list().is_empty());
        assert_eq!(
            profile(r#"["DOG_WALKING", " PET_SITTING "]"#).service_list(),
            vec!["DOG_WALKING".to_string(), "PET_SITTING".to_string()]
        );
    }

    #[test]
    fn offers_is_case_insensitive() {
        let p = profile(r#"["DOG_WALKING"]"#);
        assert!(p.offers("dog_walking"));
        assert!(!p.offers("GROOMING"));
    }

    #[test]
    fn actor_permissions() {
        let me = Ulid::new();
        assert!(Actor::caregiver(me).acts_as(Role::Caregiver, me));
        assert!(!Actor::caregiver(me).acts_as(Role::Owner, me));
        assert!(!Actor::owner(me).acts_as(Role::Owner, Ulid::new()));
        assert!(Actor::admin().acts_as(Role::Caregiver, Ulid::new()));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut cs = CaregiverState::new(profile("[]"), 0);
        cs.insert_booking(booking(300, 400, BookingStatus::Pending));
        cs.insert_booking(booking(100, 200, BookingStatus::Pending));
        cs.insert_booking(booking(200, 300, BookingStatus::Pending));
        let starts: Vec<Ms> = cs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_released_bookings() {
        let mut cs = CaregiverState::new(profile("[]"), 0);
        cs.insert_booking(booking(100, 200, BookingStatus::Cancelled));
        cs.insert_booking(booking(150, 250, BookingStatus::Accepted));
        cs.insert_booking(booking(1000, 1100, BookingStatus::Pending));
        let hits: Vec<_> = cs.active_bookings_overlapping(&Span::new(120, 180)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(150, 250));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut cs = CaregiverState::new(profile("[]"), 0);
        cs.insert_booking(booking(100, 200, BookingStatus::Pending));
        assert_eq!(cs.active_bookings_overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn entries_between_filters_service_and_range() {
        let mut cs = CaregiverState::new(profile("[]"), 0);
        let d = |day| NaiveDate::from_ymd_opt(2026, 10, day).unwrap();
        for (day, service) in [(19, "A"), (20, "A"), (20, "B"), (22, "A"), (25, "A")] {
            cs.availability.insert(
                (d(day), service.to_string()),
                AvailabilityEntry {
                    caregiver_id: cs.profile.id,
                    service_id: service.into(),
                    date: d(day),
                    slots: vec![Slot::new(540, 600)],
                    blocked: false,
                },
            );
        }
        let dates: Vec<NaiveDate> = cs.entries_between("A", d(20), d(22)).map(|e| e.date).collect();
        assert_eq!(dates, vec![d(20), d(22)]);
        assert!(cs.entry("B", d(20)).is_some_and(AvailabilityEntry::is_available));
        assert!(cs.entry("B", d(21)).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AvailabilitySet {
            entry: AvailabilityEntry {
                caregiver_id: Ulid::new(),
                service_id: "DOG_WALKING".into(),
                date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
                slots: vec![Slot::new(540, 720)],
                blocked: false,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
