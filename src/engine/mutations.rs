use std::sync::Arc;

use chrono::{Days, NaiveDate};
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::cancellation::{self, CancellationDecision};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::conflict::{check_bookable, validate_service_id, validate_slots, validate_span};
use super::{Engine, EngineError, WalCommand, purge_before};

/// A booking request as submitted by an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub caregiver_id: Ulid,
    pub service_id: String,
    pub span: Span,
    pub amount: Cents,
}

/// Non-parties learn nothing about a booking; parties without the right get Forbidden.
pub(super) fn authorize_party(
    actor: &Actor,
    booking: &Booking,
    allowed: &[Role],
    denied: &'static str,
) -> Result<(), EngineError> {
    if actor.is_admin() {
        return Ok(());
    }
    let role_id = match actor.role {
        Role::Owner => booking.owner_id,
        Role::Caregiver => booking.caregiver_id,
        Role::Admin => return Ok(()),
    };
    if actor.user_id != role_id {
        return Err(EngineError::NotFound("booking"));
    }
    if !allowed.contains(&actor.role) {
        return Err(EngineError::Forbidden(denied));
    }
    Ok(())
}

impl Engine {
    /// Register or replace a caregiver profile.
    ///
    /// Only an admin changes `approved`; a caregiver editing their own profile
    /// keeps whatever approval is on record (none for a new profile).
    pub async fn upsert_caregiver(
        &self,
        actor: &Actor,
        mut profile: CaregiverProfile,
    ) -> Result<CaregiverProfile, EngineError> {
        if !actor.acts_as(Role::Caregiver, profile.id) {
            return Err(EngineError::Forbidden("only the caregiver can edit their profile"));
        }
        for field in [
            Some(&profile.services),
            Some(&profile.work_regions),
            profile.region.as_ref(),
            profile.postal_code.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if field.len() > MAX_PROFILE_FIELD_LEN {
                return Err(EngineError::LimitExceeded("profile field too long"));
            }
        }

        let _gate = self.compaction_gate.read().await;
        let _registration = self.registration.lock().await;

        if let Some(cs) = self.get_caregiver(&profile.id) {
            let mut guard = cs.write().await;
            if !actor.is_admin() {
                profile.approved = guard.profile.approved;
            }
            let event = Event::CaregiverUpserted { profile: profile.clone() };
            self.persist_and_apply(&mut guard, &event).await?;
            return Ok(profile);
        }

        if self.caregivers.len() >= MAX_CAREGIVERS {
            return Err(EngineError::LimitExceeded("too many caregivers"));
        }
        if !actor.is_admin() {
            profile.approved = false;
        }
        let event = Event::CaregiverUpserted { profile: profile.clone() };
        self.wal_append(&event).await?;
        let cs = CaregiverState::new(profile.clone(), self.allocate_seq());
        self.caregivers.insert(profile.id, Arc::new(RwLock::new(cs)));
        tracing::info!(caregiver_id = %profile.id, "registered caregiver");
        Ok(profile)
    }

    /// Replace the declaration for (caregiver, service, date) wholesale.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_availability(
        &self,
        actor: &Actor,
        caregiver_id: Ulid,
        service_id: &str,
        date: NaiveDate,
        slots: Vec<Slot>,
        blocked: bool,
        now: Ms,
    ) -> Result<AvailabilityEntry, EngineError> {
        if !actor.acts_as(Role::Caregiver, caregiver_id) {
            return Err(EngineError::Forbidden("only the caregiver can change their availability"));
        }
        validate_service_id(service_id)?;
        validate_slots(&slots)?;
        self.check_within_horizon(date, now)?;

        let _gate = self.compaction_gate.read().await;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let mut guard = cs.write().await;

        let mut slots = slots;
        slots.sort();
        let entry = AvailabilityEntry {
            caregiver_id,
            service_id: service_id.to_string(),
            date,
            slots,
            blocked,
        };
        let event = Event::AvailabilitySet { entry: entry.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(entry)
    }

    /// Dates from the caller's today through today + horizon, both inclusive.
    fn check_within_horizon(&self, date: NaiveDate, now: Ms) -> Result<(), EngineError> {
        let today = self.config.zone.normalize_to_midnight(now);
        if date < today {
            return Err(EngineError::validation(format!(
                "cannot set availability for {date}: the date is in the past"
            )));
        }
        let horizon = self.config.horizon_days;
        let last = today
            .checked_add_days(Days::new(u64::from(horizon)))
            .unwrap_or(NaiveDate::MAX);
        if date > last {
            return Err(EngineError::validation(format!(
                "cannot set availability for {date}: dates can be set at most {horizon} days ahead"
            )));
        }
        Ok(())
    }

    pub async fn clear_availability(
        &self,
        actor: &Actor,
        caregiver_id: Ulid,
        service_id: &str,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        if !actor.acts_as(Role::Caregiver, caregiver_id) {
            return Err(EngineError::Forbidden("only the caregiver can change their availability"));
        }
        let _gate = self.compaction_gate.read().await;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let mut guard = cs.write().await;
        if guard.entry(service_id, date).is_none() {
            return Err(EngineError::NotFound("availability"));
        }
        let event = Event::AvailabilityCleared {
            caregiver_id,
            service_id: service_id.to_string(),
            date,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Drop every availability entry dated before `before`. Returns the number removed.
    pub async fn purge_stale_availability(
        &self,
        actor: &Actor,
        before: NaiveDate,
    ) -> Result<usize, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only an administrator can purge availability"));
        }
        let _gate = self.compaction_gate.read().await;
        let arcs: Vec<_> = self.caregivers.iter().map(|e| e.value().clone()).collect();

        let mut stale = false;
        for cs in &arcs {
            let guard = cs.read().await;
            if guard
                .availability
                .keys()
                .next()
                .is_some_and(|(date, _)| *date < before)
            {
                stale = true;
                break;
            }
        }
        if !stale {
            return Ok(0);
        }

        self.wal_append(&Event::AvailabilityPurged { before }).await?;
        let mut removed = 0;
        for cs in &arcs {
            removed += purge_before(&mut *cs.write().await, before);
        }
        tracing::info!(%before, removed, "purged stale availability");
        Ok(removed)
    }

    pub async fn request_booking(
        &self,
        actor: &Actor,
        req: NewBooking,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let result = self.try_request_booking(actor, req, now).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.class().as_str(),
        };
        metrics::counter!(observability::BOOKING_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_request_booking(
        &self,
        actor: &Actor,
        req: NewBooking,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        if !actor.acts_as(Role::Owner, req.owner_id) {
            return Err(EngineError::Forbidden("bookings can only be requested for yourself"));
        }
        if req.owner_id == req.caregiver_id {
            return Err(EngineError::validation("a caregiver cannot book themself"));
        }
        validate_service_id(&req.service_id)?;
        validate_span(&req.span)?;
        if req.amount < 0 {
            return Err(EngineError::validation("amount cannot be negative"));
        }
        if req.amount > MAX_BOOKING_AMOUNT {
            return Err(EngineError::LimitExceeded("amount too large"));
        }
        if req.span.start <= now {
            return Err(EngineError::validation("a booking must start in the future"));
        }
        if self.booking_index.contains_key(&req.id) {
            return Err(EngineError::validation(format!("booking {} already exists", req.id)));
        }

        let _gate = self.compaction_gate.read().await;
        let cs = self
            .get_caregiver(&req.caregiver_id)
            .ok_or(EngineError::NotFound("caregiver"))?;
        let mut guard = cs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CAREGIVER {
            return Err(EngineError::LimitExceeded("too many bookings for caregiver"));
        }
        self.check_request(&guard, &req.service_id, &req.span)?;

        // Reserve the id across caregivers before the write goes out.
        match self.booking_index.entry(req.id) {
            Entry::Occupied(_) => {
                return Err(EngineError::validation(format!("booking {} already exists", req.id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(req.caregiver_id);
            }
        }

        let booking = Booking {
            id: req.id,
            owner_id: req.owner_id,
            caregiver_id: req.caregiver_id,
            service_id: req.service_id,
            span: req.span,
            status: BookingStatus::Pending,
            amount: req.amount,
        };
        let event = Event::BookingRequested { booking: booking.clone() };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.booking_index.remove(&booking.id);
            return Err(e);
        }
        self.notify.send(Notification::requested(&booking));
        Ok(booking)
    }

    /// Profile eligibility plus the slot/overlap check, against a held lock.
    pub(super) fn check_request(
        &self,
        cs: &CaregiverState,
        service_id: &str,
        span: &Span,
    ) -> Result<(), EngineError> {
        if !cs.profile.approved || !cs.profile.active {
            return Err(EngineError::validation("caregiver is not accepting bookings"));
        }
        if !cs.profile.offers(service_id) {
            return Err(EngineError::validation(format!(
                "caregiver does not offer {service_id}"
            )));
        }
        check_bookable(cs, service_id, span, &self.config.zone, self.config.slot_policy)
    }

    /// Move a booking along its lifecycle. Cancellation goes through `cancel_booking`.
    pub async fn transition_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        to: BookingStatus,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound("booking"))?;

        match to {
            BookingStatus::Accepted | BookingStatus::Declined => authorize_party(
                actor,
                &booking,
                &[Role::Caregiver],
                "only the caregiver can accept or decline a booking",
            )?,
            BookingStatus::Completed => authorize_party(
                actor,
                &booking,
                &[Role::Caregiver],
                "only the caregiver can complete a booking",
            )?,
            _ => authorize_party(actor, &booking, &[], "only an administrator can do that")?,
        }

        let from = booking.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        if to == BookingStatus::Completed && now < booking.span.start {
            return Err(EngineError::validation("a booking cannot be completed before it starts"));
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            caregiver_id: booking.caregiver_id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = Booking { status: to, ..booking };
        self.notify.send(Notification::transitioned(&updated, from));
        Ok(updated)
    }

    pub async fn accept_booking(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, BookingStatus::Accepted, now).await
    }

    pub async fn decline_booking(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, BookingStatus::Declined, now).await
    }

    /// Payment collaborator hook.
    pub async fn mark_paid(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, BookingStatus::Paid, now).await
    }

    pub async fn complete_booking(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, BookingStatus::Completed, now).await
    }

    /// The payment reversal executor reports the refund went through.
    pub async fn settle_refund(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, BookingStatus::Cancelled, now).await
    }

    pub async fn archive_booking(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, BookingStatus::Archived, now).await
    }

    /// Cancel at `now` and record the refund decision.
    ///
    /// A paid booking with something to refund waits in `Refunded` until the
    /// reversal is settled; everything else goes straight to `Cancelled`.
    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<(Booking, CancellationDecision), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound("booking"))?;
        authorize_party(actor, &booking, &[Role::Owner], "only the owner can cancel a booking")?;

        if !booking.status.is_cancellable() {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }
        let decision = cancellation::decide(booking.span.start, now, booking.amount, &self.config.zone);
        if !decision.can_cancel {
            return Err(EngineError::validation(decision.reason));
        }

        let status = if booking.status == BookingStatus::Paid && decision.refund_amount > 0 {
            BookingStatus::Refunded
        } else {
            BookingStatus::Cancelled
        };
        let event = Event::BookingStatusChanged {
            id: booking_id,
            caregiver_id: booking.caregiver_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = Booking { status, ..booking };
        self.notify.send(Notification::cancelled(&updated, decision.clone()));
        Ok((updated, decision))
    }

    /// Rewrite the WAL with the minimal events that recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();

        for cs in self.caregivers_in_order().await {
            let guard = cs.read().await;
            events.push(Event::CaregiverUpserted {
                profile: guard.profile.clone(),
            });
            for entry in guard.availability.values() {
                events.push(Event::AvailabilitySet { entry: entry.clone() });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingRequested { booking: booking.clone() });
            }
        }

        let slots: Vec<_> = self.counters.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            if let Some(counter) = slot.lock().await.clone() {
                events.push(Event::CounterUpdated { counter });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
