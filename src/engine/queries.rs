use chrono::NaiveDate;
use ulid::Ulid;

use crate::cancellation::{self, CancellationDecision};
use crate::limits::*;
use crate::matching::{self, Candidate, MatchRequest, RankedCandidate};
use crate::model::*;

use super::availability::{day_view, project_bookings};
use super::conflict::{booking_day, validate_service_id, validate_span};
use super::mutations::authorize_party;
use super::{Engine, EngineError};

/// Which bookings to list. Owners and caregivers only ever see their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub caregiver_id: Option<Ulid>,
    pub owner_id: Option<Ulid>,
}

fn check_range(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if from > to {
        return Err(EngineError::validation(format!(
            "date range is empty: {from} is after {to}"
        )));
    }
    if (to - from).num_days() >= MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

fn day_slots(cs: &CaregiverState, engine: &Engine, service_id: &str, date: NaiveDate) -> DaySlots {
    let booked: Vec<Slot> = project_bookings(cs, &engine.config.zone, date)
        .into_iter()
        .map(|(_, slot)| slot)
        .collect();
    day_view(date, cs.entry(service_id, date), &booked)
}

impl Engine {
    /// `{bookable, free, booked, blocked}` for one caregiver, service and date.
    pub async fn check_availability(
        &self,
        caregiver_id: Ulid,
        service_id: &str,
        date: NaiveDate,
    ) -> Result<DaySlots, EngineError> {
        validate_service_id(service_id)?;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let guard = cs.read().await;
        Ok(day_slots(&guard, self, service_id, date))
    }

    /// Declared entries for a service between `from` and `to`, inclusive.
    pub async fn get_availability(
        &self,
        caregiver_id: Ulid,
        service_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilityEntry>, EngineError> {
        validate_service_id(service_id)?;
        check_range(from, to)?;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let guard = cs.read().await;
        Ok(guard.entries_between(service_id, from, to).cloned().collect())
    }

    /// The per-day view for every date in `from..=to`.
    pub async fn calendar(
        &self,
        caregiver_id: Ulid,
        service_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DaySlots>, EngineError> {
        validate_service_id(service_id)?;
        check_range(from, to)?;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let guard = cs.read().await;
        Ok(from
            .iter_days()
            .take_while(|d| *d <= to)
            .map(|date| day_slots(&guard, self, service_id, date))
            .collect())
    }

    /// Would a booking for this span be accepted right now? Advisory only:
    /// `request_booking` repeats the check under the caregiver's write lock.
    pub async fn validate_booking_request(
        &self,
        caregiver_id: Ulid,
        service_id: &str,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_service_id(service_id)?;
        validate_span(&span)?;
        booking_day(&self.config.zone, &span)?;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let guard = cs.read().await;
        self.check_request(&guard, service_id, &span)
    }

    pub async fn get_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        let caregiver_id = self
            .caregiver_for_booking(&booking_id)
            .ok_or(EngineError::NotFound("booking"))?;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("booking"))?;
        let guard = cs.read().await;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound("booking"))?;
        authorize_party(actor, &booking, &[Role::Owner, Role::Caregiver], "")?;
        Ok(booking)
    }

    /// Bookings visible to `actor`, ordered by caregiver registration then start.
    pub async fn list_bookings(&self, actor: &Actor, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let (caregiver_id, owner_id) = match actor.role {
            Role::Admin => (filter.caregiver_id, filter.owner_id),
            Role::Caregiver => {
                if filter.caregiver_id.is_some_and(|id| id != actor.user_id) {
                    return Err(EngineError::Forbidden("caregivers can only list their own bookings"));
                }
                (Some(actor.user_id), filter.owner_id)
            }
            Role::Owner => {
                if filter.owner_id.is_some_and(|id| id != actor.user_id) {
                    return Err(EngineError::Forbidden("owners can only list their own bookings"));
                }
                (filter.caregiver_id, Some(actor.user_id))
            }
        };

        let states = match caregiver_id {
            Some(id) => self.get_caregiver(&id).into_iter().collect(),
            None => self.caregivers_in_order().await,
        };
        let mut out = Vec::new();
        for cs in states {
            let guard = cs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| owner_id.is_none_or(|o| b.owner_id == o))
                    .cloned(),
            );
        }
        Ok(out)
    }

    /// Eligible caregivers for a request, best first; ties in registration order.
    pub async fn rank_caregivers(&self, req: &MatchRequest) -> Result<Vec<RankedCandidate>, EngineError> {
        validate_service_id(&req.service)?;
        let mut candidates = Vec::new();
        for cs in self.caregivers_in_order().await {
            let guard = cs.read().await;
            let entry = guard
                .entry(&req.service, req.date)
                .filter(|e| e.is_available());
            candidates.push(Candidate {
                caregiver_id: guard.profile.id,
                approved: guard.profile.approved,
                active: guard.profile.active,
                services: guard.profile.service_list(),
                region: guard.profile.region.clone(),
                work_regions: guard.profile.work_region_list(),
                postal_code: guard.profile.postal_code.clone(),
                available_on_date: entry.is_some(),
                covers_start: match (entry, req.start_minute) {
                    (Some(e), Some(minute)) => e.slots.iter().any(|s| s.contains_minute(minute)),
                    _ => false,
                },
            });
        }
        Ok(matching::rank(&candidates, req))
    }

    /// What cancelling at `now` would refund. Changes nothing.
    pub async fn quote_cancellation(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<CancellationDecision, EngineError> {
        let booking = self.get_booking(actor, booking_id).await?;
        authorize_party(actor, &booking, &[Role::Owner], "only the owner can cancel a booking")?;
        Ok(self.decide_cancellation(&booking, now))
    }

    pub fn decide_cancellation(&self, booking: &Booking, now: Ms) -> CancellationDecision {
        cancellation::decide(booking.span.start, now, booking.amount, &self.config.zone)
    }
}
