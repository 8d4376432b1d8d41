//! Round lifecycle: `pending → active → ended`.
//!
//! Rounds are the auction's bidding windows. At most one is active per
//! auction (store-enforced on insert), numbers increase strictly, and a
//! round is immutable once ended except that its end time may be extended
//! while still active (anti-sniping).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{info, instrument};

use carousel_common::{AuctionId, CoreError, Result, RoundId};

use crate::cache::TtlCache;
use crate::domain::{Auction, AuctionStatus, Round, RoundStatus};
use crate::events::{AuctionEvent, EventBus};
use crate::store::RoundStore;

pub struct RoundLifecycle<S> {
    store: Arc<S>,
    bus: EventBus,
    /// Read-path cache for "current round of auction X".
    current: Arc<TtlCache<AuctionId, Option<Round>>>,
}

impl<S> Clone for RoundLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            current: Arc::clone(&self.current),
        }
    }
}

impl<S> RoundLifecycle<S>
where
    S: RoundStore,
{
    pub fn new(store: Arc<S>, bus: EventBus, current_ttl: StdDuration) -> Self {
        Self {
            store,
            bus,
            current: Arc::new(TtlCache::new(current_ttl)),
        }
    }

    /// Opens the auction's next round.
    ///
    /// Returns `None` without side effect when the auction is not active,
    /// an active round already exists (including losing the insert race to
    /// a concurrent creator), or the round limit is reached.
    #[instrument(skip(self, auction), fields(auction = %auction.id))]
    pub async fn create_next_round(&self, auction: &Auction) -> Result<Option<Round>> {
        if auction.status != AuctionStatus::Active {
            return Ok(None);
        }
        if self.store.active_round(auction.id).await?.is_some() {
            return Ok(None);
        }
        let number = match self.store.latest_round(auction.id).await? {
            Some(last) => last.number + 1,
            None => 1,
        };
        if number > auction.total_rounds {
            return Ok(None);
        }

        let now = Utc::now();
        let round = Round {
            id: RoundId::new(),
            auction_id: auction.id,
            number,
            status: RoundStatus::Active,
            start_time: now,
            end_time: now + auction.round_duration(),
        };
        let round = match self.store.insert_round(round).await {
            Ok(round) => round,
            // another writer opened a round between our check and insert
            Err(CoreError::Conflict(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        self.current.invalidate(&auction.id).await;
        info!(round = %round.id, number, "round opened");
        self.bus.publish(AuctionEvent::RoundStarted {
            auction_id: auction.id,
            round_id: round.id,
            number,
            end_time: round.end_time,
        });
        Ok(Some(round))
    }

    /// Ends a round. Idempotent: an already-ended round is returned
    /// unchanged.
    #[instrument(skip(self))]
    pub async fn end_round(&self, round_id: RoundId) -> Result<Round> {
        let mut round = self
            .store
            .round(round_id)
            .await?
            .ok_or_else(|| CoreError::not_found("round", round_id))?;
        if round.status == RoundStatus::Ended {
            return Ok(round);
        }

        let now = Utc::now();
        round.status = RoundStatus::Ended;
        // a force-ended round closes its window early
        if round.end_time > now {
            round.end_time = now;
        }
        self.store.update_round(&round).await?;

        self.current.invalidate(&round.auction_id).await;
        info!(round = %round.id, number = round.number, "round ended");
        self.bus.publish(AuctionEvent::RoundEnded { round_id });
        Ok(round)
    }

    /// Extends an active round's end time by `delta`, anchored to `now`
    /// when the stored end time has already passed, so extending never
    /// compounds a stale value.
    #[instrument(skip(self))]
    pub async fn extend_time(&self, round_id: RoundId, delta: Duration) -> Result<Round> {
        let mut round = self
            .store
            .round(round_id)
            .await?
            .ok_or_else(|| CoreError::not_found("round", round_id))?;
        if round.status != RoundStatus::Active {
            return Err(CoreError::Conflict(format!(
                "round {round_id} is not active"
            )));
        }

        let now = Utc::now();
        round.end_time = round.end_time.max(now) + delta;
        self.store.update_round(&round).await?;

        self.current.invalidate(&round.auction_id).await;
        self.bus.publish(AuctionEvent::RoundExtended {
            round_id,
            new_end_time: round.end_time,
        });
        Ok(round)
    }

    /// Cached "current round" read. May serve a few seconds of staleness;
    /// write paths read the store directly.
    pub async fn current_round(&self, auction_id: AuctionId) -> Result<Option<Round>> {
        let store = Arc::clone(&self.store);
        self.current
            .get_or_load(auction_id, || async move {
                store.active_round(auction_id).await
            })
            .await
    }
}
