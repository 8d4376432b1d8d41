//! Periodic tick driving round turnover.
//!
//! Each tick ends expired rounds, settles them, opens the next round (or
//! ends the auction after the last one), and repairs an active auction
//! left without a round by a crash mid-transition. One round's failure
//! never blocks the others in the same tick.
//!
//! NOTE: in a clustered deployment only the leader instance should run
//! the loop; the settlement idempotency keys make an accidental second
//! runner harmless, just wasteful.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use carousel_common::{CoreError, Result};

use crate::auctions::AuctionLifecycle;
use crate::domain::Round;
use crate::rounds::RoundLifecycle;
use crate::settlement::SettlementEngine;
use crate::store::{
    AuctionStore, BetStore, IdempotencyStore, LedgerStore, RoundStore, WinnerStore,
};

/// Outcome of one tick, for logs and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickReport {
    /// Expired rounds ended and settled this tick.
    pub rounds_processed: usize,
    /// Rounds whose processing failed; retried next tick.
    pub failures: usize,
    /// Whether the repair step opened a round for a roundless auction.
    pub repaired: bool,
}

pub struct Scheduler<S> {
    store: Arc<S>,
    rounds: RoundLifecycle<S>,
    auctions: AuctionLifecycle<S>,
    settlement: SettlementEngine<S>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            rounds: self.rounds.clone(),
            auctions: self.auctions.clone(),
            settlement: self.settlement.clone(),
        }
    }
}

impl<S> Scheduler<S>
where
    S: AuctionStore + RoundStore + BetStore + LedgerStore + WinnerStore + IdempotencyStore,
{
    pub fn new(
        store: Arc<S>,
        rounds: RoundLifecycle<S>,
        auctions: AuctionLifecycle<S>,
        settlement: SettlementEngine<S>,
    ) -> Self {
        Self {
            store,
            rounds,
            auctions,
            settlement,
        }
    }

    /// One pass over everything the clock owes us.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        for round in self.store.expired_rounds(Utc::now()).await? {
            match self.process_expired_round(&round).await {
                Ok(()) => report.rounds_processed += 1,
                Err(err) => {
                    warn!(round = %round.id, error = %err, "expired round processing failed");
                    report.failures += 1;
                }
            }
        }

        // Repair: an active auction must always have an active round.
        if let Some(auction) = self.store.active_auction().await? {
            if self.store.active_round(auction.id).await?.is_none() {
                match self.rounds.create_next_round(&auction).await {
                    Ok(Some(round)) => {
                        info!(round = %round.id, number = round.number, "repaired roundless auction");
                        report.repaired = true;
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "failed to open round for roundless auction"),
                }
            }
        }

        Ok(report)
    }

    /// End → settle → next round or auction end, for one expired round.
    async fn process_expired_round(&self, round: &Round) -> Result<()> {
        self.rounds.end_round(round.id).await?;

        let auction = self
            .store
            .auction(round.auction_id)
            .await?
            .ok_or_else(|| CoreError::not_found("auction", round.auction_id))?;
        let is_last = round.number >= auction.total_rounds;

        let next = if is_last {
            None
        } else {
            self.rounds.create_next_round(&auction).await?
        };

        self.settlement
            .process_round_winners(
                round.id,
                auction.winners_per_round,
                auction.prize_amount,
                next.as_ref().map(|r| r.id),
            )
            .await?;

        if is_last {
            self.auctions.end(auction.id).await?;
        }
        Ok(())
    }

    /// Spawns the periodic loop. The task runs until the handle is
    /// aborted or the runtime shuts down.
    pub fn spawn_tick_loop(self, interval: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.tick().await {
                    Ok(report) if report.rounds_processed > 0 || report.repaired => {
                        info!(
                            processed = report.rounds_processed,
                            failures = report.failures,
                            repaired = report.repaired,
                            "scheduler tick"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "scheduler tick failed to enumerate rounds"),
                }
            }
        })
    }
}
