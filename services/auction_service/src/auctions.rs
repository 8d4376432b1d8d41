//! Auction lifecycle: `draft → active → ended`.
//!
//! At most one auction is open (draft or active) system-wide; the store's
//! insert guard enforces it. Draft auctions are editable; starting one
//! opens round 1 best-effort (the scheduler repairs a failed opening);
//! ending one force-ends its rounds and triggers the refund pass.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{instrument, warn};

use carousel_common::{Amount, AuctionId, CoreError, Result};

use crate::cache::TtlCache;
use crate::domain::{Auction, AuctionStatus, RoundStatus};
use crate::events::{AuctionEvent, EventBus};
use crate::rounds::RoundLifecycle;
use crate::settlement::SettlementEngine;
use crate::store::{
    AuctionStore, BetStore, IdempotencyStore, LedgerStore, RoundStore, WinnerStore,
};

/// Parameters for a new auction.
#[derive(Clone, Debug)]
pub struct CreateAuction {
    pub name: String,
    pub prize_amount: Amount,
    pub winners_per_round: u32,
    pub total_rounds: u32,
    pub round_duration_minutes: i64,
}

/// Partial update; only permitted while the auction is a draft.
#[derive(Clone, Debug, Default)]
pub struct AuctionPatch {
    pub name: Option<String>,
    pub prize_amount: Option<Amount>,
    pub winners_per_round: Option<u32>,
    pub total_rounds: Option<u32>,
    pub round_duration_minutes: Option<i64>,
}

pub struct AuctionLifecycle<S> {
    store: Arc<S>,
    rounds: RoundLifecycle<S>,
    settlement: SettlementEngine<S>,
    bus: EventBus,
    /// Read-path cache for "the current auction".
    current: Arc<TtlCache<(), Option<Auction>>>,
}

impl<S> Clone for AuctionLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            rounds: self.rounds.clone(),
            settlement: self.settlement.clone(),
            bus: self.bus.clone(),
            current: Arc::clone(&self.current),
        }
    }
}

impl<S> AuctionLifecycle<S>
where
    S: AuctionStore + RoundStore + BetStore + LedgerStore + WinnerStore + IdempotencyStore,
{
    pub fn new(
        store: Arc<S>,
        rounds: RoundLifecycle<S>,
        settlement: SettlementEngine<S>,
        bus: EventBus,
        current_ttl: StdDuration,
    ) -> Self {
        Self {
            store,
            rounds,
            settlement,
            bus,
            current: Arc::new(TtlCache::new(current_ttl)),
        }
    }

    /// Creates a draft auction. Fails `Conflict` while another auction is
    /// still open.
    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateAuction) -> Result<Auction> {
        let auction = Auction {
            id: AuctionId::new(),
            name: params.name,
            prize_amount: params.prize_amount,
            winners_per_round: params.winners_per_round,
            total_rounds: params.total_rounds,
            round_duration_minutes: params.round_duration_minutes,
            status: AuctionStatus::Draft,
            created_at: Utc::now(),
            ended_at: None,
            refunds_processed: false,
        };
        validate(&auction)?;

        let auction = self.store.insert_auction(auction).await?;
        self.current.clear().await;
        self.bus.publish(AuctionEvent::AuctionCreated {
            auction_id: auction.id,
        });
        Ok(auction)
    }

    /// Starts a draft auction and opens round 1.
    ///
    /// Round creation is best-effort: if it fails the auction stays
    /// active and the scheduler opens the round on its next tick.
    #[instrument(skip(self))]
    pub async fn start(&self, auction_id: AuctionId) -> Result<Auction> {
        let mut auction = self.require(auction_id).await?;
        if auction.status != AuctionStatus::Draft {
            return Err(CoreError::Conflict(format!(
                "auction {auction_id} cannot start from {:?}",
                auction.status
            )));
        }

        auction.status = AuctionStatus::Active;
        self.store.update_auction(&auction).await?;
        self.current.clear().await;
        self.bus.publish(AuctionEvent::AuctionStarted { auction_id });

        if let Err(err) = self.rounds.create_next_round(&auction).await {
            warn!(error = %err, "round 1 creation failed, scheduler will retry");
        }
        Ok(auction)
    }

    /// Ends an auction: force-ends its active rounds, marks it ended and
    /// triggers the refund pass (at-most-once via `refunds_processed`).
    #[instrument(skip(self))]
    pub async fn end(&self, auction_id: AuctionId) -> Result<Auction> {
        let mut auction = self.require(auction_id).await?;
        if auction.status == AuctionStatus::Ended {
            return Err(CoreError::Conflict(format!(
                "auction {auction_id} already ended"
            )));
        }

        for round in self.store.rounds_of(auction_id).await? {
            if round.status == RoundStatus::Ended {
                continue;
            }
            if let Err(err) = self.rounds.end_round(round.id).await {
                warn!(round = %round.id, error = %err, "failed to force-end round");
            }
        }

        auction.status = AuctionStatus::Ended;
        auction.ended_at = Some(Utc::now());
        self.store.update_auction(&auction).await?;
        self.current.clear().await;
        self.bus.publish(AuctionEvent::AuctionEnded { auction_id });

        // The refund pass may also be re-driven by the job queue; a
        // failure here does not un-end the auction.
        if let Err(err) = self.settlement.process_refunds(auction_id).await {
            warn!(error = %err, "refund pass did not complete");
        }
        self.require(auction_id).await
    }

    /// Edits a draft auction. Any other status fails `Conflict`.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, auction_id: AuctionId, patch: AuctionPatch) -> Result<Auction> {
        let mut auction = self.require(auction_id).await?;
        if auction.status != AuctionStatus::Draft {
            return Err(CoreError::Conflict(format!(
                "auction {auction_id} is no longer editable"
            )));
        }

        if let Some(name) = patch.name {
            auction.name = name;
        }
        if let Some(prize) = patch.prize_amount {
            auction.prize_amount = prize;
        }
        if let Some(winners) = patch.winners_per_round {
            auction.winners_per_round = winners;
        }
        if let Some(rounds) = patch.total_rounds {
            auction.total_rounds = rounds;
        }
        if let Some(minutes) = patch.round_duration_minutes {
            auction.round_duration_minutes = minutes;
        }
        validate(&auction)?;

        self.store.update_auction(&auction).await?;
        self.current.clear().await;
        Ok(auction)
    }

    /// Cached "current auction" read; a few seconds of staleness is fine.
    pub async fn current_auction(&self) -> Result<Option<Auction>> {
        let store = Arc::clone(&self.store);
        self.current
            .get_or_load((), || async move { store.open_auction().await })
            .await
    }

    async fn require(&self, auction_id: AuctionId) -> Result<Auction> {
        self.store
            .auction(auction_id)
            .await?
            .ok_or_else(|| CoreError::not_found("auction", auction_id))
    }
}

fn validate(auction: &Auction) -> Result<()> {
    if auction.name.trim().is_empty() {
        return Err(CoreError::Validation("auction name must not be empty".into()));
    }
    if auction.prize_amount == 0 {
        return Err(CoreError::Validation("prize amount must be positive".into()));
    }
    if auction.winners_per_round == 0 {
        return Err(CoreError::Validation(
            "winners per round must be at least 1".into(),
        ));
    }
    if auction.total_rounds == 0 {
        return Err(CoreError::Validation("total rounds must be at least 1".into()));
    }
    if auction.round_duration_minutes <= 0 {
        return Err(CoreError::Validation(
            "round duration must be positive".into(),
        ));
    }
    Ok(())
}
