//! Calendar dates, minute-of-day slots and coarse day windows.
//!
//! Everything downstream of this module works with a [`NaiveDate`] plus
//! minute offsets in the reference zone. Absolute instants are projected here
//! and nowhere else.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, FixedOffset, NaiveDate, Offset, Utc};

use crate::model::{DAY_MS, MINUTE_MS, MINUTES_PER_DAY, Ms, Slot, Span};

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    BadTime(String),
    BadSlot(String),
    BadDate(String),
    BadWindow(String),
}

impl fmt::Display for CalendarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarError::BadTime(s) => write!(f, "invalid time of day: {s} (expected HH:MM)"),
            CalendarError::BadSlot(s) => write!(f, "invalid slot: {s} (expected HH:MM-HH:MM)"),
            CalendarError::BadDate(s) => write!(f, "invalid date: {s} (expected YYYY-MM-DD)"),
            CalendarError::BadWindow(s) => {
                write!(f, "invalid window: {s} (expected morning, afternoon, evening or night)")
            }
        }
    }
}

impl std::error::Error for CalendarError {}

/// Coarse named period of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::Morning,
        TimeWindow::Afternoon,
        TimeWindow::Evening,
        TimeWindow::Night,
    ];

    pub fn start_minute(self) -> u16 {
        match self {
            TimeWindow::Morning => 6 * 60,
            TimeWindow::Afternoon => 12 * 60,
            TimeWindow::Evening => 17 * 60,
            TimeWindow::Night => 21 * 60,
        }
    }

    /// The window runs until the next one starts; night runs to midnight.
    pub fn slot(self) -> Slot {
        let end = match self {
            TimeWindow::Morning => TimeWindow::Afternoon.start_minute(),
            TimeWindow::Afternoon => TimeWindow::Evening.start_minute(),
            TimeWindow::Evening => TimeWindow::Night.start_minute(),
            TimeWindow::Night => MINUTES_PER_DAY,
        };
        Slot::new(self.start_minute(), end)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeWindow::Morning => "morning",
            TimeWindow::Afternoon => "afternoon",
            TimeWindow::Evening => "evening",
            TimeWindow::Night => "night",
        }
    }
}

impl FromStr for TimeWindow {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(TimeWindow::Morning),
            "afternoon" => Ok(TimeWindow::Afternoon),
            "evening" => Ok(TimeWindow::Evening),
            "night" => Ok(TimeWindow::Night),
            _ => Err(CalendarError::BadWindow(s.to_string())),
        }
    }
}

pub fn window_to_start_minute(window: TimeWindow) -> u16 {
    window.start_minute()
}

/// Parse `H:MM` / `HH:MM` into a minute of day. `24:00` is accepted as the
/// end-of-day boundary so it can close a slot.
pub fn to_minute_of_day(hhmm: &str) -> Result<u16, CalendarError> {
    let bad = || CalendarError::BadTime(hhmm.to_string());
    let (h, m) = hhmm.trim().split_once(':').ok_or_else(bad)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: u16 = h.parse().map_err(|_| bad())?;
    let m: u16 = m.parse().map_err(|_| bad())?;
    if m >= 60 {
        return Err(bad());
    }
    let minute = h * 60 + m;
    if minute > MINUTES_PER_DAY {
        return Err(bad());
    }
    Ok(minute)
}

pub fn format_minute(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// An explicit `hh:mm` wins over a coarse window; the window is only a fallback.
pub fn resolve_start_minute(
    explicit: Option<&str>,
    window: Option<TimeWindow>,
) -> Result<Option<u16>, CalendarError> {
    match explicit {
        Some(hhmm) => to_minute_of_day(hhmm).map(Some),
        None => Ok(window.map(TimeWindow::start_minute)),
    }
}

/// Parse `HH:MM-HH:MM`. Shape only: ordering is checked by the engine so the
/// caller gets a validation error rather than a parse error.
pub fn parse_slot(text: &str) -> Result<Slot, CalendarError> {
    let (start, end) = text
        .trim()
        .split_once('-')
        .ok_or_else(|| CalendarError::BadSlot(text.to_string()))?;
    Ok(Slot {
        start: to_minute_of_day(start)?,
        end: to_minute_of_day(end)?,
    })
}

/// Comma-separated slot list; blank text is an empty list.
pub fn parse_slot_list(text: &str) -> Result<Vec<Slot>, CalendarError> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_slot)
        .collect()
}

pub fn format_slot_list(slots: &[Slot]) -> String {
    slots
        .iter()
        .map(Slot::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_date(text: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| CalendarError::BadDate(text.to_string()))
}

/// The fixed reference timezone every date and minute offset is interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    offset: FixedOffset,
}

impl Default for ReferenceZone {
    fn default() -> Self {
        Self::utc()
    }
}

impl ReferenceZone {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// `None` if the offset is outside ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    fn offset_ms(&self) -> Ms {
        self.offset.local_minus_utc() as Ms * 1000
    }

    fn local_ms(&self, t: Ms) -> Ms {
        t + self.offset_ms()
    }

    /// The calendar date `t` falls on, normalized to midnight in this zone.
    pub fn normalize_to_midnight(&self, t: Ms) -> NaiveDate {
        let days = self.local_ms(t).div_euclid(DAY_MS);
        i32::try_from(days)
            .ok()
            .and_then(|d| d.checked_add(UNIX_EPOCH_DAYS_FROM_CE))
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn minute_of_day(&self, t: Ms) -> u16 {
        (self.local_ms(t).rem_euclid(DAY_MS) / MINUTE_MS) as u16
    }

    pub fn hour_of_day(&self, t: Ms) -> u32 {
        u32::from(self.minute_of_day(t) / 60)
    }

    /// The instant at which `date` begins in this zone.
    pub fn midnight_ms(&self, date: NaiveDate) -> Ms {
        let days = (date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE) as Ms;
        days * DAY_MS - self.offset_ms()
    }

    pub fn day_span(&self, date: NaiveDate) -> Span {
        let start = self.midnight_ms(date);
        Span::new(start, start + DAY_MS)
    }

    /// Project an absolute span onto `date`'s minute space, clamped to the day.
    /// Partial minutes widen outward so a projected booking never shrinks.
    pub fn project(&self, span: &Span, date: NaiveDate) -> Option<Slot> {
        let day = self.day_span(date);
        let start = span.start.max(day.start);
        let end = span.end.min(day.end);
        if start >= end {
            return None;
        }
        let start_min = (start - day.start) / MINUTE_MS;
        let end_min = (end - day.start + MINUTE_MS - 1) / MINUTE_MS;
        Some(Slot::new(start_min as u16, end_min as u16))
    }

    /// Instant for `minute` past midnight on `date`.
    pub fn at(&self, date: NaiveDate, minute: u16) -> Ms {
        self.midnight_ms(date) + Ms::from(minute) * MINUTE_MS
    }
}
