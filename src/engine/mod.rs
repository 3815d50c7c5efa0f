mod availability;
mod conflict;
mod counters;
mod error;
mod mutations;
mod queries;

pub use availability::{bookable_slots, day_view, merge_overlapping, subtract_intervals};
pub(crate) use conflict::now_ms;
pub use error::{EngineError, ErrorClass};
pub use mutations::NewBooking;
pub use queries::BookingFilter;

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::calendar::ReferenceZone;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCaregiverState = Arc<RwLock<CaregiverState>>;

/// `None` once the counter has been swept; holders must re-resolve the key.
pub(super) type SharedCounter = Arc<Mutex<Option<RateLimitCounter>>>;

/// How a booking request must fit the declared slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
    /// The request must lie inside one declared slot that no active booking touches.
    #[default]
    WholeSlot,
    /// The request may take any free part of the declared slots.
    Split,
}

impl FromStr for SlotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whole" | "whole_slot" => Ok(SlotPolicy::WholeSlot),
            "split" => Ok(SlotPolicy::Split),
            other => Err(format!("unknown slot policy: {other} (expected whole or split)")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub zone: ReferenceZone,
    /// Availability may be declared from today through today + horizon.
    pub horizon_days: u32,
    pub slot_policy: SlotPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zone: ReferenceZone::utc(),
            horizon_days: 90,
            slot_policy: SlotPolicy::WholeSlot,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

pub struct Engine {
    pub(super) caregivers: DashMap<Ulid, SharedCaregiverState>,
    /// Reverse lookup: booking id → caregiver id.
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) counters: DashMap<String, SharedCounter>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every mutation holds this shared for its whole persist-and-apply;
    /// compaction holds it exclusively while snapshotting.
    pub(super) compaction_gate: RwLock<()>,
    /// Serializes first-time caregiver registration.
    pub(super) registration: Mutex<()>,
    next_seq: AtomicU64,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

/// Apply an event to one caregiver (no locking: caller holds the lock).
fn apply_to_caregiver(cs: &mut CaregiverState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::CaregiverUpserted { profile } => cs.profile = profile.clone(),
        Event::AvailabilitySet { entry } => {
            cs.availability
                .insert((entry.date, entry.service_id.clone()), entry.clone());
        }
        Event::AvailabilityCleared { service_id, date, .. } => {
            cs.availability.remove(&(*date, service_id.clone()));
        }
        Event::AvailabilityPurged { before } => {
            purge_before(cs, *before);
        }
        Event::BookingRequested { booking } => {
            booking_index.insert(booking.id, booking.caregiver_id);
            cs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = cs.booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::CounterUpdated { .. } | Event::CounterSwept { .. } => {}
    }
}

/// Drop entries dated strictly before `before`. Returns how many went.
pub(super) fn purge_before(cs: &mut CaregiverState, before: NaiveDate) -> usize {
    let kept = cs.availability.split_off(&(before, String::new()));
    let removed = cs.availability.len();
    cs.availability = kept;
    removed
}

/// The caregiver an event belongs to, for events scoped to one caregiver.
fn event_caregiver_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::CaregiverUpserted { profile } => Some(profile.id),
        Event::AvailabilitySet { entry } => Some(entry.caregiver_id),
        Event::AvailabilityCleared { caregiver_id, .. }
        | Event::BookingStatusChanged { caregiver_id, .. } => Some(*caregiver_id),
        Event::BookingRequested { booking } => Some(booking.caregiver_id),
        Event::AvailabilityPurged { .. } | Event::CounterUpdated { .. } | Event::CounterSwept { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let (wal, events) = Wal::open_and_replay(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            caregivers: DashMap::new(),
            booking_index: DashMap::new(),
            counters: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            registration: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            notify,
            config,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            events = events.len(),
            caregivers = engine.caregivers.len(),
            bookings = engine.booking_index.len(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::CaregiverUpserted { profile } if !self.caregivers.contains_key(&profile.id) => {
                let cs = CaregiverState::new(profile.clone(), self.allocate_seq());
                self.caregivers.insert(profile.id, Arc::new(RwLock::new(cs)));
            }
            Event::AvailabilityPurged { before } => {
                for entry in self.caregivers.iter() {
                    if let Ok(mut guard) = entry.value().try_write() {
                        purge_before(&mut guard, *before);
                    }
                }
            }
            Event::CounterUpdated { counter } => {
                self.counters.insert(
                    counter.key.clone(),
                    Arc::new(Mutex::new(Some(counter.clone()))),
                );
            }
            Event::CounterSwept { key } => {
                self.counters.remove(key);
            }
            other => {
                if let Some(caregiver_id) = event_caregiver_id(other)
                    && let Some(cs) = self.get_caregiver(&caregiver_id)
                    && let Ok(mut guard) = cs.try_write()
                {
                    apply_to_caregiver(&mut guard, other, &self.booking_index);
                }
            }
        }
    }

    pub(super) fn allocate_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub fn get_caregiver(&self, id: &Ulid) -> Option<SharedCaregiverState> {
        self.caregivers.get(id).map(|e| e.value().clone())
    }

    pub fn caregiver_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn caregiver_count(&self) -> usize {
        self.caregivers.len()
    }

    /// WAL-append then apply. Caller holds the compaction gate and the caregiver lock.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CaregiverState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_caregiver(cs, event, &self.booking_index);
        Ok(())
    }

    /// Lookup booking → caregiver, acquire that caregiver's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<CaregiverState>, EngineError> {
        let caregiver_id = self
            .caregiver_for_booking(booking_id)
            .ok_or(EngineError::NotFound("booking"))?;
        let cs = self
            .get_caregiver(&caregiver_id)
            .ok_or(EngineError::NotFound("booking"))?;
        Ok(cs.write_owned().await)
    }

    /// Every caregiver state, in registration order.
    pub(super) async fn caregivers_in_order(&self) -> Vec<SharedCaregiverState> {
        let arcs: Vec<SharedCaregiverState> =
            self.caregivers.iter().map(|e| e.value().clone()).collect();
        let mut keyed = Vec::with_capacity(arcs.len());
        for cs in arcs {
            let seq = cs.read().await.seq;
            keyed.push((seq, cs));
        }
        keyed.sort_by_key(|(seq, _)| *seq);
        keyed.into_iter().map(|(_, cs)| cs).collect()
    }
}
