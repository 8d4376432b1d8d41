//! Domain events published on the internal event bus.
//!
//! Downstream consumers (notification workers, web-socket fan-out) attach
//! through [`EventBus::subscribe`]. Publishing is fire-and-forget: a bus
//! with no live subscriber must never fail a business operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use carousel_common::{Amount, AuctionId, RoundId, UserId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuctionEvent {
    AuctionCreated {
        auction_id: AuctionId,
    },
    AuctionStarted {
        auction_id: AuctionId,
    },
    AuctionEnded {
        auction_id: AuctionId,
    },
    RoundStarted {
        auction_id: AuctionId,
        round_id: RoundId,
        number: u32,
        end_time: DateTime<Utc>,
    },
    RoundExtended {
        round_id: RoundId,
        new_end_time: DateTime<Utc>,
    },
    RoundEnded {
        round_id: RoundId,
    },
    BidPlaced {
        round_id: RoundId,
        user_id: UserId,
        amount: Amount,
    },
    WinnersPaid {
        round_id: RoundId,
        winner_count: usize,
    },
    RefundsIssued {
        auction_id: AuctionId,
        refunded: usize,
        failed: usize,
    },
}

/// Broadcast-backed bus shared by every engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AuctionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuctionEvent> {
        self.tx.subscribe()
    }

    /// Publishes the event; silently a no-op when nobody listens.
    pub fn publish(&self, event: AuctionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("no active event listeners, dropping event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(AuctionEvent::AuctionCreated {
            auction_id: AuctionId::new(),
        });
    }

    #[tokio::test]
    async fn subscriber_observes_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let round_id = RoundId::new();
        bus.publish(AuctionEvent::RoundEnded { round_id });
        match rx.recv().await.unwrap() {
            AuctionEvent::RoundEnded { round_id: got } => assert_eq!(got, round_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
