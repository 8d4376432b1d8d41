//! Settlement: round winners, carry-forward, and the auction-end refund
//! pass.
//!
//! Ranking and carry-forward must agree on who won, so the full ranked
//! view is computed exactly once per pass before any write. Prize and
//! refund payments are keyed ledger operations, which is what makes
//! at-least-once job redelivery safe. Per-user failures inside a pass are
//! logged and counted, never fatal; only a pass that cannot start at all
//! (missing round or auction) surfaces an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use carousel_common::{Amount, AuctionId, CoreError, Result, RoundId, UserId};

use crate::bids::{BidBook, RankedBet};
use crate::config::EngineSettings;
use crate::domain::{Bet, TransactionKind, Winner};
use crate::events::{AuctionEvent, EventBus};
use crate::ledger::{Ledger, LedgerEntry};
use crate::store::{
    AuctionStore, BetStore, IdempotencyStore, InsertOutcome, LedgerStore, RoundStore, WinnerStore,
};

/// Retries for the carry-forward merge CAS against a concurrently raising
/// target bet.
const MAX_MERGE_ATTEMPTS: usize = 3;

/// Outcome of one round-winners pass.
#[derive(Clone, Debug, Default)]
pub struct RoundSettlement {
    pub winners: Vec<Winner>,
    /// Losing bets moved or merged into the next round.
    pub carried: usize,
    pub carry_failures: usize,
    pub payment_failures: usize,
}

/// Outcome of the auction-end refund pass.
#[derive(Clone, Debug, Default)]
pub struct RefundReport {
    pub refunded: usize,
    pub failed: usize,
    pub total_amount: Amount,
    /// True when the pass had already run and was skipped.
    pub skipped: bool,
}

pub struct SettlementEngine<S> {
    store: Arc<S>,
    ledger: Ledger<S>,
    bids: BidBook<S>,
    bus: EventBus,
    settings: EngineSettings,
}

impl<S> Clone for SettlementEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: self.ledger.clone(),
            bids: self.bids.clone(),
            bus: self.bus.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S> SettlementEngine<S>
where
    S: AuctionStore + RoundStore + BetStore + LedgerStore + WinnerStore + IdempotencyStore,
{
    pub fn new(
        store: Arc<S>,
        ledger: Ledger<S>,
        bids: BidBook<S>,
        bus: EventBus,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            bids,
            bus,
            settings,
        }
    }

    /// Pays the round's top-N bidders and carries every losing bid into
    /// the next round. Safe to re-run: winner rows are duplicate-tolerant
    /// and prizes are keyed per (round, user, rank).
    ///
    /// `next_round_id` is the explicit target for carry-forward; when absent,
    /// the auction's currently active round is used. With neither (last
    /// round), losing bids stay attached to the ended round for the
    /// auction-end refund pass.
    #[instrument(skip(self), fields(round = %round_id))]
    pub async fn process_round_winners(
        &self,
        round_id: RoundId,
        winners_per_round: u32,
        prize_amount: Amount,
        next_round_id: Option<RoundId>,
    ) -> Result<RoundSettlement> {
        let round = self
            .store
            .round(round_id)
            .await?
            .ok_or_else(|| CoreError::not_found("round", round_id))?;
        let auction = self
            .store
            .auction(round.auction_id)
            .await?
            .ok_or_else(|| CoreError::not_found("auction", round.auction_id))?;

        // One consistent snapshot drives both payout and carry-forward.
        let ranked = self.bids.ranked_view(round_id, usize::MAX).await?;
        let cutoff = (winners_per_round as usize).min(ranked.len());
        let (top, losers) = ranked.split_at(cutoff);

        let mut report = RoundSettlement::default();
        for entry in top {
            match self.pay_winner(entry, round_id, prize_amount).await {
                Ok(winner) => report.winners.push(winner),
                Err(err) => {
                    warn!(user = %entry.bet.user_id, rank = entry.rank, error = %err,
                        "winner payout failed; a settlement re-run will retry it");
                    report.payment_failures += 1;
                }
            }
        }

        let carry_target = match next_round_id {
            Some(id) => Some(id),
            None => self
                .store
                .active_round(auction.id)
                .await?
                .map(|next| next.id),
        };

        match carry_target {
            Some(target) => {
                for entry in losers {
                    match self.carry_forward(&entry.bet, target).await {
                        Ok(()) => report.carried += 1,
                        Err(err) => {
                            warn!(user = %entry.bet.user_id, bet = %entry.bet.id, error = %err,
                                "carry-forward failed for one user");
                            report.carry_failures += 1;
                        }
                    }
                }
            }
            None => {
                // last round: stakes stay put until the refund pass
                debug!(losers = losers.len(), "no next round, bids remain for refunds");
            }
        }

        info!(
            winners = report.winners.len(),
            carried = report.carried,
            carry_failures = report.carry_failures,
            "round settled"
        );
        self.bus.publish(AuctionEvent::WinnersPaid {
            round_id,
            winner_count: report.winners.len(),
        });
        Ok(report)
    }

    /// Refunds every non-winning user's remaining stake, once per auction.
    ///
    /// The pass aggregates each user's surviving bet amounts across all
    /// rounds, skips anyone who won any round, and issues one keyed
    /// `refund` transaction per user in bounded batches. The
    /// `refunds_processed` flag is set only after the pass completes, so a
    /// crashed pass may be re-invoked safely: the keys make re-issued
    /// refunds no-ops.
    #[instrument(skip(self), fields(auction = %auction_id))]
    pub async fn process_refunds(&self, auction_id: AuctionId) -> Result<RefundReport> {
        let mut auction = self
            .store
            .auction(auction_id)
            .await?
            .ok_or_else(|| CoreError::not_found("auction", auction_id))?;
        if auction.refunds_processed {
            info!("refund pass already ran, skipping");
            return Ok(RefundReport {
                skipped: true,
                ..RefundReport::default()
            });
        }

        let winner_users: HashSet<UserId> = self
            .store
            .winners_of_auction(auction_id)
            .await?
            .into_iter()
            .map(|w| w.user_id)
            .collect();

        let mut totals: HashMap<UserId, Amount> = HashMap::new();
        for round in self.store.rounds_of(auction_id).await? {
            for bet in self.store.bets_in_round(round.id).await? {
                if !winner_users.contains(&bet.user_id) {
                    *totals.entry(bet.user_id).or_default() += bet.amount;
                }
            }
        }

        // deterministic batching order
        let mut owed: Vec<(UserId, Amount)> = totals.into_iter().collect();
        owed.sort_by_key(|(user, _)| *user);

        let mut report = RefundReport::default();
        let batch_size = self.settings.refund_batch_size.max(1);
        let pause = StdDuration::from_millis(self.settings.refund_batch_pause_ms);
        let batches = owed.chunks(batch_size).count();

        for (index, batch) in owed.chunks(batch_size).enumerate() {
            for &(user, amount) in batch {
                let outcome = self
                    .ledger
                    .apply_transaction(
                        LedgerEntry::new(user, TransactionKind::Refund, amount)
                            .describe(format!("auction {auction_id} closing refund"))
                            .key(format!("refund:{auction_id}:{user}")),
                    )
                    .await;
                match outcome {
                    Ok(_) => {
                        report.refunded += 1;
                        report.total_amount += amount;
                    }
                    Err(err) => {
                        warn!(user = %user, error = %err, "refund failed for one user");
                        report.failed += 1;
                    }
                }
            }
            if index + 1 < batches {
                tokio::time::sleep(pause).await;
            }
        }

        auction.refunds_processed = true;
        self.store.update_auction(&auction).await?;

        info!(
            refunded = report.refunded,
            failed = report.failed,
            total = report.total_amount,
            "refund pass complete"
        );
        self.bus.publish(AuctionEvent::RefundsIssued {
            auction_id,
            refunded: report.refunded,
            failed: report.failed,
        });
        Ok(report)
    }

    /// Records the winner row (duplicate-tolerant) and pays the prize in
    /// reward points, keyed so a re-run pays at most once.
    async fn pay_winner(
        &self,
        entry: &RankedBet,
        round_id: RoundId,
        prize_amount: Amount,
    ) -> Result<Winner> {
        let user_id = entry.bet.user_id;
        let winner = Winner {
            id: Uuid::new_v4(),
            user_id,
            round_id,
            bet_id: entry.bet.id,
            rank: entry.rank,
            prize_amount,
            created_at: Utc::now(),
        };
        let winner = match self.store.try_insert_winner(winner).await? {
            InsertOutcome::Created(w) | InsertOutcome::Exists(w) => w,
        };

        self.ledger
            .apply_transaction(
                LedgerEntry::new(user_id, TransactionKind::Prize, prize_amount)
                    .round(round_id)
                    .bet(entry.bet.id)
                    .describe(format!("rank {} prize for round {round_id}", entry.rank))
                    .key(format!("prize:{round_id}:{user_id}:{}", entry.rank)),
            )
            .await?;
        Ok(winner)
    }

    /// Moves one losing bet into `target_round`: merged by summing into
    /// the user's existing bet there, or moved as a fresh row with the
    /// version reset. The source row is deleted either way.
    async fn carry_forward(&self, bet: &Bet, target_round: RoundId) -> Result<()> {
        for _ in 0..MAX_MERGE_ATTEMPTS {
            match self.store.user_bet(bet.user_id, target_round).await? {
                Some(existing) => {
                    match self
                        .store
                        .update_bet_amount(
                            existing.id,
                            existing.version,
                            existing.amount + bet.amount,
                        )
                        .await
                    {
                        Ok(_) => {
                            self.store.delete_bet(bet.id).await?;
                            return Ok(());
                        }
                        // the target was raised mid-merge; re-read and retry
                        Err(CoreError::Conflict(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
                None => {
                    let moved = Bet::new(bet.user_id, target_round, bet.amount, Utc::now());
                    match self.store.try_insert_bet(moved).await? {
                        InsertOutcome::Created(_) => {
                            self.store.delete_bet(bet.id).await?;
                            return Ok(());
                        }
                        // a first bid landed concurrently; merge instead
                        InsertOutcome::Exists(_) => continue,
                    }
                }
            }
        }
        Err(CoreError::Conflict(format!(
            "bet {} kept losing merge races into round {target_round}",
            bet.id
        )))
    }
}
