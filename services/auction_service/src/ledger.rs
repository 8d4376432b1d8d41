//! The ledger owns every money and reward-point movement.
//!
//! One logical operation produces exactly one balance mutation plus one
//! append-only transaction row, never more, regardless of retries carrying
//! the same idempotency key. The store's `commit_transaction` gives the
//! mutation+append atomicity; this module wraps it in the idempotency
//! protocol: insert-if-absent pending record, critical section, settle
//! succeeded/failed. A record is only ever left pending by a process crash
//! inside the critical section; operators reconcile those externally.

use std::sync::Arc;

use chrono::Utc;
use tracing::{instrument, warn};

use carousel_common::{Amount, BetId, CoreError, Result, RoundId, UserId};

use crate::domain::{Transaction, TransactionKind, UserAccount};
use crate::store::{IdempotencyStart, IdempotencyStore, LedgerStore};

/// One logical ledger operation.
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub round_id: Option<RoundId>,
    pub bet_id: Option<BetId>,
    pub description: String,
    pub idempotency_key: Option<String>,
}

impl LedgerEntry {
    pub fn new(user_id: UserId, kind: TransactionKind, amount: Amount) -> Self {
        Self {
            user_id,
            kind,
            amount,
            round_id: None,
            bet_id: None,
            description: String::new(),
            idempotency_key: None,
        }
    }

    pub fn round(mut self, round_id: RoundId) -> Self {
        self.round_id = Some(round_id);
        self
    }

    pub fn bet(mut self, bet_id: BetId) -> Self {
        self.bet_id = Some(bet_id);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn key_opt(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }
}

pub struct Ledger<S> {
    store: Arc<S>,
}

impl<S> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> Ledger<S>
where
    S: LedgerStore + IdempotencyStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Applies one ledger operation.
    ///
    /// With an idempotency key: a previously succeeded operation replays
    /// the stored transaction without re-applying money; an in-flight one
    /// fails `Conflict`; a previously failed one is retried. `Bet` debits
    /// are conditional on balance and fail `InsufficientFunds` with no
    /// side effect.
    #[instrument(skip(self, entry), fields(user = %entry.user_id, kind = entry.kind.as_str(), amount = entry.amount))]
    pub async fn apply_transaction(&self, entry: LedgerEntry) -> Result<Transaction> {
        if let Some(key) = entry.idempotency_key.clone() {
            match self.store.begin_idempotent(&key, entry.kind).await? {
                IdempotencyStart::Completed(tx_id) => {
                    return self.store.transaction(tx_id).await?.ok_or_else(|| {
                        CoreError::Internal(format!(
                            "idempotency record {key} references missing transaction {tx_id}"
                        ))
                    });
                }
                IdempotencyStart::InFlight => {
                    return Err(CoreError::Conflict(format!(
                        "operation with key {key} is already in flight"
                    )));
                }
                IdempotencyStart::Started => {}
            }
            let outcome = self.commit(&entry, Some(key.clone())).await;
            self.settle(&key, entry.kind, &outcome).await;
            return outcome;
        }
        self.commit(&entry, None).await
    }

    /// Credits a deposit, opening the account on first use.
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: Amount,
        idempotency_key: Option<String>,
    ) -> Result<Transaction> {
        self.store.ensure_account(user_id).await?;
        self.apply_transaction(
            LedgerEntry::new(user_id, TransactionKind::Deposit, amount)
                .describe("balance deposit")
                .key_opt(idempotency_key),
        )
        .await
    }

    pub async fn account(&self, user_id: UserId) -> Result<UserAccount> {
        self.store
            .account(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("account", user_id))
    }

    pub async fn transactions_of(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        self.store.transactions_of(user_id).await
    }

    async fn commit(&self, entry: &LedgerEntry, key: Option<String>) -> Result<Transaction> {
        self.store
            .commit_transaction(Transaction {
                id: carousel_common::TransactionId::new(),
                user_id: entry.user_id,
                kind: entry.kind,
                amount: entry.amount,
                round_id: entry.round_id,
                bet_id: entry.bet_id,
                description: entry.description.clone(),
                idempotency_key: key,
                created_at: Utc::now(),
            })
            .await
    }

    /// Settles the idempotency record after the critical section. A settle
    /// failure is logged rather than propagated: the money already moved
    /// (or provably did not), and the stale pending record is what the
    /// operator reconciliation sweep exists for.
    async fn settle(&self, key: &str, kind: TransactionKind, outcome: &Result<Transaction>) {
        let settled = match outcome {
            Ok(tx) => self.store.settle_idempotent_ok(key, kind, tx.id).await,
            Err(err) => {
                self.store
                    .settle_idempotent_err(key, kind, &err.to_string())
                    .await
            }
        };
        if let Err(err) = settled {
            warn!(key, error = %err, "failed to settle idempotency record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn funded_ledger(amount: Amount) -> (Ledger<MemoryStore>, UserId) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store);
        let user = UserId::new();
        ledger.deposit(user, amount, None).await.unwrap();
        (ledger, user)
    }

    #[tokio::test]
    async fn replay_with_same_key_moves_money_once() {
        let (ledger, user) = funded_ledger(1_000).await;

        let entry = LedgerEntry::new(user, TransactionKind::Bet, 400)
            .describe("stake")
            .key("bet:abc");
        let first = ledger.apply_transaction(entry.clone()).await.unwrap();
        let second = ledger.apply_transaction(entry).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.account(user).await.unwrap().balance, 600);
        // one deposit + one bet, not two bets
        assert_eq!(ledger.transactions_of(user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn in_flight_key_fails_conflict() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(Arc::clone(&store));
        let user = UserId::new();
        ledger.deposit(user, 500, None).await.unwrap();

        // simulate a concurrent holder mid-operation
        store
            .begin_idempotent("bet:xyz", TransactionKind::Bet)
            .await
            .unwrap();

        let err = ledger
            .apply_transaction(
                LedgerEntry::new(user, TransactionKind::Bet, 100).key("bet:xyz"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn failed_operation_marks_record_and_allows_retry() {
        let (ledger, user) = funded_ledger(100).await;

        let err = ledger
            .apply_transaction(
                LedgerEntry::new(user, TransactionKind::Bet, 250).key("bet:retry"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds { .. }));
        assert_eq!(ledger.account(user).await.unwrap().balance, 100);

        // a top-up later makes the same key usable again
        ledger.deposit(user, 200, None).await.unwrap();
        let tx = ledger
            .apply_transaction(
                LedgerEntry::new(user, TransactionKind::Bet, 250).key("bet:retry"),
            )
            .await
            .unwrap();
        assert_eq!(tx.amount, 250);
        assert_eq!(ledger.account(user).await.unwrap().balance, 50);
    }

    #[tokio::test]
    async fn prize_credits_reward_points_not_balance() {
        let (ledger, user) = funded_ledger(300).await;
        ledger
            .apply_transaction(LedgerEntry::new(user, TransactionKind::Prize, 1_000))
            .await
            .unwrap();
        let account = ledger.account(user).await.unwrap();
        assert_eq!(account.balance, 300);
        assert_eq!(account.reward_points, 1_000);
    }
}
