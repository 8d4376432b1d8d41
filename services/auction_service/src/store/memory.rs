//! Thread-safe in-memory store.
//!
//! All state sits behind a single `RwLock`, so every trait method executes
//! as one atomic step, the in-process stand-in for a database's
//! conditional updates and unique indexes. Meant for tests and local
//! development, not production.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use carousel_common::{
    Amount, AuctionId, BetId, CoreError, Result, RoundId, TransactionId, UserId,
};

use crate::domain::{
    Auction, Bet, IdempotencyRecord, IdempotencyStatus, Round, RoundStatus, Transaction,
    TransactionKind, UserAccount, Winner,
};
use crate::store::{
    AuctionStore, BetStore, IdempotencyStart, IdempotencyStore, InsertOutcome, LedgerStore,
    RoundStore, WinnerStore,
};

#[derive(Default)]
struct State {
    auctions: HashMap<AuctionId, Auction>,
    rounds: HashMap<RoundId, Round>,
    bets: HashMap<BetId, Bet>,
    /// Unique index backing the one-bet-per-user-per-round constraint.
    bets_by_user_round: HashMap<(UserId, RoundId), BetId>,
    accounts: HashMap<UserId, UserAccount>,
    transactions: Vec<Transaction>,
    winners: Vec<Winner>,
    /// Unique index on (user, round) for winners.
    winner_keys: HashMap<(UserId, RoundId), usize>,
    idempotency: HashMap<(String, TransactionKind), IdempotencyRecord>,
}

/// In-memory [`crate::store::Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn insert_auction(&self, auction: Auction) -> Result<Auction> {
        let mut state = self.state.write().await;
        if let Some(open) = state.auctions.values().find(|a| a.is_open()) {
            return Err(CoreError::Conflict(format!(
                "auction {} is still {:?}",
                open.id, open.status
            )));
        }
        state.auctions.insert(auction.id, auction.clone());
        Ok(auction)
    }

    async fn auction(&self, id: AuctionId) -> Result<Option<Auction>> {
        Ok(self.state.read().await.auctions.get(&id).cloned())
    }

    async fn open_auction(&self) -> Result<Option<Auction>> {
        let state = self.state.read().await;
        Ok(state.auctions.values().find(|a| a.is_open()).cloned())
    }

    async fn active_auction(&self) -> Result<Option<Auction>> {
        let state = self.state.read().await;
        Ok(state
            .auctions
            .values()
            .find(|a| a.status == crate::domain::AuctionStatus::Active)
            .cloned())
    }

    async fn update_auction(&self, auction: &Auction) -> Result<()> {
        let mut state = self.state.write().await;
        match state.auctions.get_mut(&auction.id) {
            Some(slot) => {
                *slot = auction.clone();
                Ok(())
            }
            None => Err(CoreError::not_found("auction", auction.id)),
        }
    }
}

#[async_trait]
impl RoundStore for MemoryStore {
    async fn insert_round(&self, round: Round) -> Result<Round> {
        let mut state = self.state.write().await;
        let clash = state
            .rounds
            .values()
            .any(|r| r.auction_id == round.auction_id && r.status == RoundStatus::Active);
        if clash {
            return Err(CoreError::Conflict(format!(
                "auction {} already has an active round",
                round.auction_id
            )));
        }
        state.rounds.insert(round.id, round.clone());
        Ok(round)
    }

    async fn round(&self, id: RoundId) -> Result<Option<Round>> {
        Ok(self.state.read().await.rounds.get(&id).cloned())
    }

    async fn active_round(&self, auction_id: AuctionId) -> Result<Option<Round>> {
        let state = self.state.read().await;
        Ok(state
            .rounds
            .values()
            .find(|r| r.auction_id == auction_id && r.status == RoundStatus::Active)
            .cloned())
    }

    async fn latest_round(&self, auction_id: AuctionId) -> Result<Option<Round>> {
        let state = self.state.read().await;
        Ok(state
            .rounds
            .values()
            .filter(|r| r.auction_id == auction_id)
            .max_by_key(|r| r.number)
            .cloned())
    }

    async fn rounds_of(&self, auction_id: AuctionId) -> Result<Vec<Round>> {
        let state = self.state.read().await;
        let mut rounds: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.auction_id == auction_id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.number);
        Ok(rounds)
    }

    async fn update_round(&self, round: &Round) -> Result<()> {
        let mut state = self.state.write().await;
        match state.rounds.get_mut(&round.id) {
            Some(slot) => {
                *slot = round.clone();
                Ok(())
            }
            None => Err(CoreError::not_found("round", round.id)),
        }
    }

    async fn expired_rounds(&self, now: DateTime<Utc>) -> Result<Vec<Round>> {
        let state = self.state.read().await;
        Ok(state
            .rounds
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BetStore for MemoryStore {
    async fn try_insert_bet(&self, bet: Bet) -> Result<InsertOutcome<Bet>> {
        let mut state = self.state.write().await;
        let key = (bet.user_id, bet.round_id);
        if let Some(existing_id) = state.bets_by_user_round.get(&key) {
            let existing = state.bets[existing_id].clone();
            return Ok(InsertOutcome::Exists(existing));
        }
        state.bets_by_user_round.insert(key, bet.id);
        state.bets.insert(bet.id, bet.clone());
        Ok(InsertOutcome::Created(bet))
    }

    async fn bet(&self, id: BetId) -> Result<Option<Bet>> {
        Ok(self.state.read().await.bets.get(&id).cloned())
    }

    async fn user_bet(&self, user_id: UserId, round_id: RoundId) -> Result<Option<Bet>> {
        let state = self.state.read().await;
        Ok(state
            .bets_by_user_round
            .get(&(user_id, round_id))
            .and_then(|id| state.bets.get(id))
            .cloned())
    }

    async fn bets_in_round(&self, round_id: RoundId) -> Result<Vec<Bet>> {
        let state = self.state.read().await;
        Ok(state
            .bets
            .values()
            .filter(|b| b.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn update_bet_amount(
        &self,
        id: BetId,
        expected_version: u32,
        amount: Amount,
    ) -> Result<Bet> {
        let mut state = self.state.write().await;
        let bet = state
            .bets
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("bet", id))?;
        if bet.version != expected_version {
            return Err(CoreError::Conflict(format!(
                "bet {id} version {} does not match expected {expected_version}",
                bet.version
            )));
        }
        bet.amount = amount;
        bet.version += 1;
        Ok(bet.clone())
    }

    async fn delete_bet(&self, id: BetId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(bet) = state.bets.remove(&id) {
            state
                .bets_by_user_round
                .remove(&(bet.user_id, bet.round_id));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn account(&self, user_id: UserId) -> Result<Option<UserAccount>> {
        Ok(self.state.read().await.accounts.get(&user_id).cloned())
    }

    async fn ensure_account(&self, user_id: UserId) -> Result<UserAccount> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .entry(user_id)
            .or_insert_with(|| UserAccount::empty(user_id));
        Ok(account.clone())
    }

    async fn commit_transaction(&self, tx: Transaction) -> Result<Transaction> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&tx.user_id)
            .ok_or_else(|| CoreError::not_found("account", tx.user_id))?;

        match tx.kind {
            TransactionKind::Bet => {
                if account.balance < tx.amount {
                    return Err(CoreError::InsufficientFunds {
                        required: tx.amount,
                        available: account.balance,
                    });
                }
                account.balance -= tx.amount;
            }
            TransactionKind::Refund | TransactionKind::Deposit => {
                account.balance = account.balance.saturating_add(tx.amount);
            }
            TransactionKind::Prize => {
                account.reward_points = account.reward_points.saturating_add(tx.amount);
            }
        }
        state.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn transactions_of(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WinnerStore for MemoryStore {
    async fn try_insert_winner(&self, winner: Winner) -> Result<InsertOutcome<Winner>> {
        let mut state = self.state.write().await;
        let key = (winner.user_id, winner.round_id);
        if let Some(&idx) = state.winner_keys.get(&key) {
            return Ok(InsertOutcome::Exists(state.winners[idx].clone()));
        }
        let idx = state.winners.len();
        state.winner_keys.insert(key, idx);
        state.winners.push(winner.clone());
        Ok(InsertOutcome::Created(winner))
    }

    async fn winners_in_round(&self, round_id: RoundId) -> Result<Vec<Winner>> {
        let state = self.state.read().await;
        let mut winners: Vec<Winner> = state
            .winners
            .iter()
            .filter(|w| w.round_id == round_id)
            .cloned()
            .collect();
        winners.sort_by_key(|w| w.rank);
        Ok(winners)
    }

    async fn winners_of_auction(&self, auction_id: AuctionId) -> Result<Vec<Winner>> {
        let state = self.state.read().await;
        let round_ids: Vec<RoundId> = state
            .rounds
            .values()
            .filter(|r| r.auction_id == auction_id)
            .map(|r| r.id)
            .collect();
        Ok(state
            .winners
            .iter()
            .filter(|w| round_ids.contains(&w.round_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn begin_idempotent(
        &self,
        key: &str,
        operation: TransactionKind,
    ) -> Result<IdempotencyStart> {
        let mut state = self.state.write().await;
        let slot = (key.to_owned(), operation);
        match state.idempotency.get_mut(&slot) {
            Some(record) => match record.status {
                IdempotencyStatus::Pending => Ok(IdempotencyStart::InFlight),
                IdempotencyStatus::Succeeded => match record.result {
                    Some(tx_id) => Ok(IdempotencyStart::Completed(tx_id)),
                    // a succeeded record always carries its result ref
                    None => Err(CoreError::Internal(format!(
                        "idempotency record {key} succeeded without a result"
                    ))),
                },
                IdempotencyStatus::Failed => {
                    record.status = IdempotencyStatus::Pending;
                    record.error = None;
                    Ok(IdempotencyStart::Started)
                }
            },
            None => {
                state.idempotency.insert(
                    slot,
                    IdempotencyRecord {
                        key: key.to_owned(),
                        operation,
                        status: IdempotencyStatus::Pending,
                        result: None,
                        error: None,
                        created_at: Utc::now(),
                    },
                );
                Ok(IdempotencyStart::Started)
            }
        }
    }

    async fn settle_idempotent_ok(
        &self,
        key: &str,
        operation: TransactionKind,
        result: TransactionId,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        match state.idempotency.get_mut(&(key.to_owned(), operation)) {
            Some(record) => {
                record.status = IdempotencyStatus::Succeeded;
                record.result = Some(result);
                Ok(())
            }
            None => Err(CoreError::not_found("idempotency record", key)),
        }
    }

    async fn settle_idempotent_err(
        &self,
        key: &str,
        operation: TransactionKind,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        match state.idempotency.get_mut(&(key.to_owned(), operation)) {
            Some(record) => {
                record.status = IdempotencyStatus::Failed;
                record.error = Some(error.to_owned());
                Ok(())
            }
            None => Err(CoreError::not_found("idempotency record", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuctionStatus;

    fn draft_auction() -> Auction {
        Auction {
            id: AuctionId::new(),
            name: "weekly".into(),
            prize_amount: 1_000,
            winners_per_round: 3,
            total_rounds: 5,
            round_duration_minutes: 10,
            status: AuctionStatus::Draft,
            created_at: Utc::now(),
            ended_at: None,
            refunds_processed: false,
        }
    }

    #[tokio::test]
    async fn second_open_auction_is_rejected() {
        let store = MemoryStore::new();
        store.insert_auction(draft_auction()).await.unwrap();
        let err = store.insert_auction(draft_auction()).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn duplicate_bet_insert_returns_surviving_row() {
        let store = MemoryStore::new();
        let user = UserId::new();
        let round = RoundId::new();
        let now = Utc::now();

        let first = Bet::new(user, round, 500, now);
        let second = Bet::new(user, round, 700, now);

        assert!(matches!(
            store.try_insert_bet(first.clone()).await.unwrap(),
            InsertOutcome::Created(_)
        ));
        match store.try_insert_bet(second).await.unwrap() {
            InsertOutcome::Exists(bet) => assert_eq!(bet.id, first.id),
            InsertOutcome::Created(_) => panic!("unique constraint not enforced"),
        }
    }

    #[tokio::test]
    async fn version_cas_rejects_stale_writer() {
        let store = MemoryStore::new();
        let bet = Bet::new(UserId::new(), RoundId::new(), 100, Utc::now());
        store.try_insert_bet(bet.clone()).await.unwrap();

        let updated = store.update_bet_amount(bet.id, 1, 150).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update_bet_amount(bet.id, 1, 200).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn bet_debit_is_conditional_on_balance() {
        let store = MemoryStore::new();
        let user = UserId::new();
        store.ensure_account(user).await.unwrap();
        store
            .commit_transaction(Transaction {
                id: TransactionId::new(),
                user_id: user,
                kind: TransactionKind::Deposit,
                amount: 300,
                round_id: None,
                bet_id: None,
                description: "top-up".into(),
                idempotency_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let err = store
            .commit_transaction(Transaction {
                id: TransactionId::new(),
                user_id: user,
                kind: TransactionKind::Bet,
                amount: 500,
                round_id: None,
                bet_id: None,
                description: "stake".into(),
                idempotency_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        match err {
            CoreError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!((required, available), (500, 300));
            }
            other => panic!("unexpected error: {other}"),
        }
        // the failed debit left no trace
        let account = store.account(user).await.unwrap().unwrap();
        assert_eq!(account.balance, 300);
        assert_eq!(store.transactions_of(user).await.unwrap().len(), 1);
    }
}
