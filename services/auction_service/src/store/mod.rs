//! Storage abstraction for the auction service.
//!
//! The engines never hold an in-process lock across business logic;
//! correctness rests on the conditional primitives promised by these
//! traits: the single-open-auction insert guard, the one-active-round
//! insert guard, the unique (user, round) bet constraint, the
//! compare-and-swap on bet version and account balance, and the
//! unique (key, operation) idempotency insert. Any backend with a
//! unique-index/constraint primitive and atomic conditional updates can
//! implement them; [`memory::MemoryStore`] is the in-process reference
//! used by tests and local development.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use carousel_common::{Amount, AuctionId, BetId, Result, RoundId, TransactionId, UserId};

use crate::domain::{Auction, Bet, Round, Transaction, TransactionKind, UserAccount, Winner};

pub use memory::MemoryStore;

/// Outcome of an optimistic unique insert: either this call created the
/// row, or another writer got there first and the surviving row is
/// returned for the caller to re-apply its intent against.
#[derive(Clone, Debug)]
pub enum InsertOutcome<T> {
    Created(T),
    Exists(T),
}

/// Outcome of opening an idempotency window for (key, operation).
#[derive(Clone, Debug)]
pub enum IdempotencyStart {
    /// No prior record (or a failed one was reset); the caller owns the
    /// critical section and must settle the record afterwards.
    Started,
    /// A concurrent holder is mid-operation.
    InFlight,
    /// The operation already completed; replay the referenced result.
    Completed(TransactionId),
}

#[async_trait]
pub trait AuctionStore: Send + Sync + 'static {
    /// Inserts the auction, failing `Conflict` while any auction is in
    /// draft or active state (the system-wide single-open invariant).
    async fn insert_auction(&self, auction: Auction) -> Result<Auction>;

    async fn auction(&self, id: AuctionId) -> Result<Option<Auction>>;

    /// The single auction in {draft, active}, if any.
    async fn open_auction(&self) -> Result<Option<Auction>>;

    async fn active_auction(&self) -> Result<Option<Auction>>;

    /// Full-row update; `NotFound` if the auction vanished.
    async fn update_auction(&self, auction: &Auction) -> Result<()>;
}

#[async_trait]
pub trait RoundStore: Send + Sync + 'static {
    /// Inserts the round, failing `Conflict` if the auction already has an
    /// active round.
    async fn insert_round(&self, round: Round) -> Result<Round>;

    async fn round(&self, id: RoundId) -> Result<Option<Round>>;

    async fn active_round(&self, auction_id: AuctionId) -> Result<Option<Round>>;

    /// The highest-numbered round of the auction, regardless of status.
    async fn latest_round(&self, auction_id: AuctionId) -> Result<Option<Round>>;

    /// All rounds of the auction, ordered by number.
    async fn rounds_of(&self, auction_id: AuctionId) -> Result<Vec<Round>>;

    async fn update_round(&self, round: &Round) -> Result<()>;

    /// Active rounds whose end time has passed at `now`.
    async fn expired_rounds(&self, now: DateTime<Utc>) -> Result<Vec<Round>>;
}

#[async_trait]
pub trait BetStore: Send + Sync + 'static {
    /// Optimistic insert under the unique (user, round) constraint. A lost
    /// race is not an error: the surviving row comes back as `Exists`.
    async fn try_insert_bet(&self, bet: Bet) -> Result<InsertOutcome<Bet>>;

    async fn bet(&self, id: BetId) -> Result<Option<Bet>>;

    async fn user_bet(&self, user_id: UserId, round_id: RoundId) -> Result<Option<Bet>>;

    async fn bets_in_round(&self, round_id: RoundId) -> Result<Vec<Bet>>;

    /// Compare-and-swap on the version counter: sets `amount`, bumps
    /// `version`, fails `Conflict` when `expected_version` is stale.
    async fn update_bet_amount(
        &self,
        id: BetId,
        expected_version: u32,
        amount: Amount,
    ) -> Result<Bet>;

    /// Idempotent delete.
    async fn delete_bet(&self, id: BetId) -> Result<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn account(&self, user_id: UserId) -> Result<Option<UserAccount>>;

    /// Creates a zero-balance account when absent; returns the stored row.
    async fn ensure_account(&self, user_id: UserId) -> Result<UserAccount>;

    /// Atomically applies the balance delta implied by `tx.kind` and
    /// appends the transaction row: exactly one mutation plus one row,
    /// or neither. `Bet` debits conditionally and fails
    /// `InsufficientFunds` without side effect; `Refund`/`Deposit` credit
    /// the balance; `Prize` credits reward points.
    async fn commit_transaction(&self, tx: Transaction) -> Result<Transaction>;

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;

    async fn transactions_of(&self, user_id: UserId) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait WinnerStore: Send + Sync + 'static {
    /// Insert under the unique (user, round) constraint; a duplicate
    /// returns the existing row so settlement re-runs stay idempotent.
    async fn try_insert_winner(&self, winner: Winner) -> Result<InsertOutcome<Winner>>;

    async fn winners_in_round(&self, round_id: RoundId) -> Result<Vec<Winner>>;

    /// Winners across every round of the auction.
    async fn winners_of_auction(&self, auction_id: AuctionId) -> Result<Vec<Winner>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Insert-if-absent of a pending record for (key, operation). An
    /// existing failed record is reset to pending and re-owned by this
    /// caller.
    async fn begin_idempotent(
        &self,
        key: &str,
        operation: TransactionKind,
    ) -> Result<IdempotencyStart>;

    /// Marks the record succeeded with the transaction it produced.
    async fn settle_idempotent_ok(
        &self,
        key: &str,
        operation: TransactionKind,
        result: TransactionId,
    ) -> Result<()>;

    /// Marks the record failed, preserving the error for operators. The
    /// record must never stay pending after the critical section.
    async fn settle_idempotent_err(
        &self,
        key: &str,
        operation: TransactionKind,
        error: &str,
    ) -> Result<()>;
}

/// Umbrella bound the engines use; implemented for free by anything that
/// implements every entity store.
pub trait Store:
    AuctionStore + RoundStore + BetStore + LedgerStore + WinnerStore + IdempotencyStore
{
}

impl<T> Store for T where
    T: AuctionStore + RoundStore + BetStore + LedgerStore + WinnerStore + IdempotencyStore
{
}
