//! Bid book: placement, raises and the canonical ranking.
//!
//! One active bet per user per round, raise-only. Placement is an
//! optimistic insert-or-raise loop over the store's unique (user, round)
//! constraint: a lost insert race re-enters as a raise instead of failing,
//! so concurrent duplicate submissions collapse to one surviving row. The
//! money side always goes through the [`Ledger`]: the full stake for a
//! first bid, only the difference for a raise.
//!
//! Ordering rule shared by the leaderboard and settlement: highest amount
//! first, ties broken by earliest bet creation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use carousel_common::{Amount, CoreError, Result, RoundId, UserId};

use crate::cache::TtlCache;
use crate::config::EngineSettings;
use crate::domain::{Bet, TransactionKind};
use crate::events::{AuctionEvent, EventBus};
use crate::ledger::{Ledger, LedgerEntry};
use crate::rounds::RoundLifecycle;
use crate::store::{BetStore, IdempotencyStore, InsertOutcome, LedgerStore, RoundStore};

/// Bounded retries for the insert-or-raise loop under contention.
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

/// One leaderboard entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankedBet {
    /// 1-based position.
    pub rank: u32,
    pub bet: Bet,
}

pub struct BidBook<S> {
    store: Arc<S>,
    ledger: Ledger<S>,
    rounds: RoundLifecycle<S>,
    bus: EventBus,
    settings: EngineSettings,
    /// Cached full ranking per round, for the read path only.
    leaderboard: Arc<TtlCache<RoundId, Vec<RankedBet>>>,
}

impl<S> Clone for BidBook<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: self.ledger.clone(),
            rounds: self.rounds.clone(),
            bus: self.bus.clone(),
            settings: self.settings.clone(),
            leaderboard: Arc::clone(&self.leaderboard),
        }
    }
}

impl<S> BidBook<S>
where
    S: BetStore + RoundStore + LedgerStore + IdempotencyStore,
{
    pub fn new(
        store: Arc<S>,
        ledger: Ledger<S>,
        rounds: RoundLifecycle<S>,
        bus: EventBus,
        settings: EngineSettings,
        leaderboard_ttl: StdDuration,
    ) -> Self {
        Self {
            store,
            ledger,
            rounds,
            bus,
            settings,
            leaderboard: Arc::new(TtlCache::new(leaderboard_ttl)),
        }
    }

    /// Places or raises a bid.
    ///
    /// Fails `NotFound` for a missing round or account, `Conflict` outside
    /// the round's activity window, `Validation` for a non-increasing
    /// raise, `InsufficientFunds` when the stake (or stake difference)
    /// exceeds the balance, in which case the bet is left unchanged.
    /// With an idempotency key, a retry that finds the resulting amount
    /// already standing returns the existing bet without charging again.
    #[instrument(skip(self, idempotency_key), fields(user = %user_id, round = %round_id, amount))]
    pub async fn place_bid(
        &self,
        user_id: UserId,
        round_id: RoundId,
        amount: Amount,
        idempotency_key: Option<String>,
    ) -> Result<Bet> {
        if amount == 0 {
            return Err(CoreError::Validation("bid amount must be positive".into()));
        }

        let mut round = self
            .store
            .round(round_id)
            .await?
            .ok_or_else(|| CoreError::not_found("round", round_id))?;
        // the bidder must hold an account before staking
        self.ledger.account(user_id).await?;

        // Anti-sniping protects round 1 only: a bid landing inside the
        // threshold pushes the end time out before the activity window is
        // evaluated. Later rounds run out their clock untouched.
        let now = Utc::now();
        if round.number == 1
            && round.accepts_bids(now)
            && round.end_time - now <= Duration::seconds(self.settings.sniping_threshold_secs)
        {
            round = self
                .rounds
                .extend_time(
                    round.id,
                    Duration::seconds(self.settings.sniping_extension_secs),
                )
                .await?;
            debug!(round = %round.id, new_end = %round.end_time, "anti-sniping extension applied");
        }

        if !round.accepts_bids(Utc::now()) {
            return Err(CoreError::Conflict(format!(
                "round {round_id} is not accepting bids"
            )));
        }

        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            match self.store.user_bet(user_id, round_id).await? {
                None => {
                    match self.try_first_bid(user_id, round_id, amount, &idempotency_key).await? {
                        Some(bet) => return Ok(bet),
                        // lost the unique-insert race; re-enter as a raise
                        None => continue,
                    }
                }
                Some(existing) => {
                    if idempotency_key.is_some() && existing.amount == amount {
                        // retried call whose effect already stands
                        return Ok(existing);
                    }
                    match self.try_raise(&existing, amount, &idempotency_key).await? {
                        Some(bet) => return Ok(bet),
                        // concurrent raise bumped the version; re-validate
                        None => continue,
                    }
                }
            }
        }
        Err(CoreError::Conflict(format!(
            "bid on round {round_id} kept losing update races, retry"
        )))
    }

    /// Pure read: the caller's bet in the round, if any.
    pub async fn get_user_bet(&self, user_id: UserId, round_id: RoundId) -> Result<Option<Bet>> {
        self.store.user_bet(user_id, round_id).await
    }

    /// The canonical ordering: one entry per user at their highest amount
    /// (defensive against duplicate rows), sorted by amount descending,
    /// ties by earliest creation. Both the leaderboard and settlement rank
    /// through here so the two can never disagree on who is winning.
    pub async fn ranked_view(&self, round_id: RoundId, limit: usize) -> Result<Vec<RankedBet>> {
        let bets = self.store.bets_in_round(round_id).await?;

        let mut best: HashMap<UserId, Bet> = HashMap::new();
        for bet in bets {
            match best.get(&bet.user_id) {
                Some(kept)
                    if kept.amount > bet.amount
                        || (kept.amount == bet.amount && kept.created_at <= bet.created_at) => {}
                _ => {
                    best.insert(bet.user_id, bet);
                }
            }
        }

        let mut ordered: Vec<Bet> = best.into_values().collect();
        ordered.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(ordered
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(idx, bet)| RankedBet {
                rank: idx as u32 + 1,
                bet,
            })
            .collect())
    }

    /// Cached leaderboard read; tolerates a couple of seconds of
    /// staleness. Settlement never reads through here.
    pub async fn leaderboard(&self, round_id: RoundId, limit: usize) -> Result<Vec<RankedBet>> {
        let full = {
            let this = self.clone();
            self.leaderboard
                .get_or_load(round_id, || async move {
                    this.ranked_view(round_id, usize::MAX).await
                })
                .await?
        };
        Ok(full.into_iter().take(limit).collect())
    }

    /// First bid: insert the row, then charge the full stake. The row is
    /// removed again if the charge fails, so a failed bid leaves nothing
    /// behind. Returns `None` when the unique insert lost to a concurrent
    /// first bid.
    async fn try_first_bid(
        &self,
        user_id: UserId,
        round_id: RoundId,
        amount: Amount,
        idempotency_key: &Option<String>,
    ) -> Result<Option<Bet>> {
        let bet = Bet::new(user_id, round_id, amount, Utc::now());
        let bet = match self.store.try_insert_bet(bet).await? {
            InsertOutcome::Exists(_) => return Ok(None),
            InsertOutcome::Created(bet) => bet,
        };

        let charge = self
            .ledger
            .apply_transaction(
                LedgerEntry::new(user_id, TransactionKind::Bet, amount)
                    .round(round_id)
                    .bet(bet.id)
                    .describe(format!("stake in round {round_id}"))
                    .key_opt(idempotency_key.clone()),
            )
            .await;

        match charge {
            Ok(_) => {
                self.after_write(round_id, user_id, amount).await;
                Ok(Some(bet))
            }
            Err(err) => {
                if let Err(cleanup) = self.store.delete_bet(bet.id).await {
                    warn!(bet = %bet.id, error = %cleanup, "failed to remove uncharged bet");
                }
                Err(err)
            }
        }
    }

    /// Raise: validate strictly-greater, claim the row via the version
    /// CAS, then charge only the difference. A failed charge rolls the
    /// claim back. Returns `None` when the CAS lost to a concurrent raise.
    async fn try_raise(
        &self,
        existing: &Bet,
        amount: Amount,
        idempotency_key: &Option<String>,
    ) -> Result<Option<Bet>> {
        if amount <= existing.amount {
            return Err(CoreError::Validation(format!(
                "raise must exceed the current bid of {}",
                existing.amount
            )));
        }
        let difference = amount - existing.amount;

        let claimed = match self
            .store
            .update_bet_amount(existing.id, existing.version, amount)
            .await
        {
            Ok(bet) => bet,
            Err(CoreError::Conflict(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let charge = self
            .ledger
            .apply_transaction(
                LedgerEntry::new(existing.user_id, TransactionKind::Bet, difference)
                    .round(existing.round_id)
                    .bet(existing.id)
                    .describe(format!(
                        "raise from {} to {amount} in round {}",
                        existing.amount, existing.round_id
                    ))
                    .key_opt(idempotency_key.clone()),
            )
            .await;

        match charge {
            Ok(_) => {
                self.after_write(existing.round_id, existing.user_id, amount)
                    .await;
                Ok(Some(claimed))
            }
            Err(err) => {
                if let Err(rollback) = self
                    .store
                    .update_bet_amount(existing.id, claimed.version, existing.amount)
                    .await
                {
                    warn!(bet = %existing.id, error = %rollback, "failed to roll back uncharged raise");
                }
                Err(err)
            }
        }
    }

    async fn after_write(&self, round_id: RoundId, user_id: UserId, amount: Amount) {
        self.leaderboard.invalidate(&round_id).await;
        self.bus.publish(AuctionEvent::BidPlaced {
            round_id,
            user_id,
            amount,
        });
    }
}
