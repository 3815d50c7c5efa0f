use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::cancellation::CancellationDecision;
use crate::model::{Booking, BookingStatus};

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Structured events handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookingRequested {
        booking_id: Ulid,
        owner_id: Ulid,
        caregiver_id: Ulid,
        service_id: String,
        start_at: i64,
        end_at: i64,
    },
    BookingAccepted {
        booking_id: Ulid,
        owner_id: Ulid,
        caregiver_id: Ulid,
    },
    BookingDeclined {
        booking_id: Ulid,
        owner_id: Ulid,
        caregiver_id: Ulid,
    },
    BookingCancelled {
        booking_id: Ulid,
        owner_id: Ulid,
        caregiver_id: Ulid,
        status: BookingStatus,
        decision: CancellationDecision,
    },
    RefundSettled {
        booking_id: Ulid,
        owner_id: Ulid,
        caregiver_id: Ulid,
    },
    BookingStatusChanged {
        booking_id: Ulid,
        owner_id: Ulid,
        caregiver_id: Ulid,
        status: BookingStatus,
    },
}

impl Notification {
    /// Every party that should hear about this notification.
    pub fn parties(&self) -> [Ulid; 2] {
        match self {
            Notification::BookingRequested { owner_id, caregiver_id, .. }
            | Notification::BookingAccepted { owner_id, caregiver_id, .. }
            | Notification::BookingDeclined { owner_id, caregiver_id, .. }
            | Notification::BookingCancelled { owner_id, caregiver_id, .. }
            | Notification::RefundSettled { owner_id, caregiver_id, .. }
            | Notification::BookingStatusChanged { owner_id, caregiver_id, .. } => {
                [*owner_id, *caregiver_id]
            }
        }
    }

    pub fn requested(b: &Booking) -> Self {
        Notification::BookingRequested {
            booking_id: b.id,
            owner_id: b.owner_id,
            caregiver_id: b.caregiver_id,
            service_id: b.service_id.clone(),
            start_at: b.span.start,
            end_at: b.span.end,
        }
    }

    /// The notification for a lifecycle move into `b.status`.
    pub fn transitioned(b: &Booking, from: BookingStatus) -> Self {
        let (booking_id, owner_id, caregiver_id) = (b.id, b.owner_id, b.caregiver_id);
        match (from, b.status) {
            (_, BookingStatus::Accepted) => Notification::BookingAccepted { booking_id, owner_id, caregiver_id },
            (_, BookingStatus::Declined) => Notification::BookingDeclined { booking_id, owner_id, caregiver_id },
            (BookingStatus::Refunded, BookingStatus::Cancelled) => {
                Notification::RefundSettled { booking_id, owner_id, caregiver_id }
            }
            (_, status) => Notification::BookingStatusChanged { booking_id, owner_id, caregiver_id, status },
        }
    }

    pub fn cancelled(b: &Booking, decision: CancellationDecision) -> Self {
        Notification::BookingCancelled {
            booking_id: b.id,
            owner_id: b.owner_id,
            caregiver_id: b.caregiver_id,
            status: b.status,
            decision,
        }
    }
}

/// Broadcast hub: one channel per party plus a firehose of everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    firehose: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to notifications addressed to one user. Creates the channel if needed.
    pub fn subscribe(&self, party_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(party_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.firehose.subscribe()
    }

    /// Send a notification. Never blocks; no-op if nobody is listening.
    /// A party channel whose receivers are all gone is dropped here.
    pub fn send(&self, notification: Notification) {
        for party in notification.parties() {
            let idle = match self.channels.get(&party) {
                Some(sender) => sender.send(notification.clone()).is_err(),
                None => false,
            };
            if idle {
                self.channels.remove_if(&party, |_, sender| sender.receiver_count() == 0);
            }
        }
        let _ = self.firehose.send(notification);
    }
}

/// Serialize every notification to JSON and hand it to the log pipeline,
/// where the outbound notifier picks it up.
pub async fn run_dispatcher(hub: Arc<NotifyHub>) {
    let mut rx = hub.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(json) => tracing::info!(target: "carebook::notify", "{json}"),
                Err(e) => tracing::error!("failed to encode notification: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification dispatcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            caregiver_id: Ulid::new(),
            service_id: "DOG_WALKING".into(),
            span: Span::new(1_000, 2_000),
            status,
            amount: 5_000,
        }
    }

    #[tokio::test]
    async fn both_parties_and_firehose_receive() {
        let hub = NotifyHub::new();
        let b = booking(BookingStatus::Pending);
        let mut owner_rx = hub.subscribe(b.owner_id);
        let mut caregiver_rx = hub.subscribe(b.caregiver_id);
        let mut all_rx = hub.subscribe_all();

        hub.send(Notification::requested(&b));

        let expected = Notification::requested(&b);
        assert_eq!(owner_rx.recv().await.unwrap(), expected);
        assert_eq!(caregiver_rx.recv().await.unwrap(), expected);
        assert_eq!(all_rx.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Notification::requested(&booking(BookingStatus::Pending)));
    }

    #[tokio::test]
    async fn abandoned_party_channels_are_dropped() {
        let hub = NotifyHub::new();
        let b = booking(BookingStatus::Pending);
        let owner_rx = hub.subscribe(b.owner_id);
        let mut caregiver_rx = hub.subscribe(b.caregiver_id);
        drop(owner_rx);

        hub.send(Notification::requested(&b));

        assert!(!hub.channels.contains_key(&b.owner_id));
        assert!(hub.channels.contains_key(&b.caregiver_id));
        assert_eq!(caregiver_rx.recv().await.unwrap(), Notification::requested(&b));
    }

    #[test]
    fn settle_is_reported_as_refund_settled() {
        let b = booking(BookingStatus::Cancelled);
        assert!(matches!(
            Notification::transitioned(&b, BookingStatus::Refunded),
            Notification::RefundSettled { .. }
        ));
        let accepted = booking(BookingStatus::Accepted);
        assert!(matches!(
            Notification::transitioned(&accepted, BookingStatus::Pending),
            Notification::BookingAccepted { .. }
        ));
    }

    #[test]
    fn json_is_tagged() {
        let json = serde_json::to_value(Notification::requested(&booking(BookingStatus::Pending))).unwrap();
        assert_eq!(json["type"], "booking_requested");
        assert_eq!(json["service_id"], "DOG_WALKING");
    }
}
