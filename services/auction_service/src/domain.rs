//! Domain entities for the Carousel rollover auction.
//!
//! These are the persisted shapes the store traits speak. Lifecycle rules
//! live in the engine modules; the entities only carry the small time/state
//! predicates both the engines and the store queries need to agree on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carousel_common::{Amount, AuctionId, BetId, RoundId, TransactionId, UserId};

/* ----------------------------------- Auction ---------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    /// Created and still editable; not yet accepting rounds or bids.
    Draft,
    /// Live: rounds are running, bids are accepted.
    Active,
    /// Terminal. Refund settlement runs exactly once after this.
    Ended,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Auction {
    pub id: AuctionId,
    pub name: String,
    /// Reward points paid to each round winner.
    pub prize_amount: Amount,
    pub winners_per_round: u32,
    pub total_rounds: u32,
    pub round_duration_minutes: i64,
    pub status: AuctionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Guard for the at-most-once auction-end refund pass.
    pub refunds_processed: bool,
}

impl Auction {
    /// Whether this auction occupies the single system-wide "open" slot.
    pub fn is_open(&self) -> bool {
        matches!(self.status, AuctionStatus::Draft | AuctionStatus::Active)
    }

    pub fn round_duration(&self) -> Duration {
        Duration::minutes(self.round_duration_minutes)
    }
}

/* ----------------------------------- Round ------------------------------------ */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    /// Reserved for rounds scheduled ahead of their window; the engine
    /// currently opens rounds directly into `Active`.
    Pending,
    Active,
    Ended,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub auction_id: AuctionId,
    /// 1-based, strictly increasing per auction.
    pub number: u32,
    pub status: RoundStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Round {
    /// Whether the round accepts bids at `now`.
    pub fn accepts_bids(&self, now: DateTime<Utc>) -> bool {
        self.status == RoundStatus::Active && now >= self.start_time && now <= self.end_time
    }

    /// Whether the scheduler should end this round at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RoundStatus::Active && now > self.end_time
    }
}

/* ------------------------------------ Bet -------------------------------------- */

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    pub user_id: UserId,
    pub round_id: RoundId,
    pub amount: Amount,
    /// Optimistic-concurrency counter, bumped on every mutation.
    pub version: u32,
    /// Ranking tie-breaker: earliest bet wins the tie.
    pub created_at: DateTime<Utc>,
}

impl Bet {
    pub fn new(user_id: UserId, round_id: RoundId, amount: Amount, now: DateTime<Utc>) -> Self {
        Self {
            id: BetId::new(),
            user_id,
            round_id,
            amount,
            version: 1,
            created_at: now,
        }
    }
}

/* ----------------------------------- Ledger ------------------------------------ */

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    /// Spendable currency; never goes negative.
    pub balance: Amount,
    /// Prize currency; credited, never spent by this service.
    pub reward_points: Amount,
}

impl UserAccount {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            reward_points: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Debit of the stake (or stake difference on a raise).
    Bet,
    /// Credit returning a stake after the auction ends.
    Refund,
    /// Reward-points credit for a round win.
    Prize,
    /// External top-up of the spendable balance.
    Deposit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bet => "bet",
            Self::Refund => "refund",
            Self::Prize => "prize",
            Self::Deposit => "deposit",
        }
    }
}

/// Append-only ledger entry. Never mutated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub round_id: Option<RoundId>,
    pub bet_id: Option<BetId>,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/* ----------------------------------- Winner ------------------------------------ */

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Winner {
    pub id: Uuid,
    pub user_id: UserId,
    pub round_id: RoundId,
    pub bet_id: BetId,
    /// 1..=winners_per_round, unique within the round.
    pub rank: u32,
    pub prize_amount: Amount,
    pub created_at: DateTime<Utc>,
}

/* -------------------------------- Idempotency ---------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Guard record making ledger writes safe under client retries and
/// concurrent duplicate submission. Unique per (key, operation).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: TransactionKind,
    pub status: IdempotencyStatus,
    pub result: Option<TransactionId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
