//! Carousel rollover-auction engine.
//!
//! Users stake into timed rounds; the top-N stakes per round win a fixed
//! prize paid in reward points, losing stakes roll into the next round,
//! and whatever a non-winner still holds when the auction ends comes back
//! as a refund. The hard part is the round/bet/settlement lifecycle: bid
//! raises under contention, deterministic tie-breaks, atomic stake
//! transfer across round boundaries, and idempotent money movement under
//! retries, all without an in-process global lock, relying on the
//! store's conditional updates instead.
//!
//! Storage is dependency-injected: anything implementing the [`store`]
//! traits plugs in; [`store::MemoryStore`] ships for tests and local
//! development. [`service::AuctionService`] is the facade the transport
//! layer consumes.

pub mod auctions;
pub mod bids;
pub mod cache;
pub mod config;
pub mod domain;
pub mod events;
pub mod ledger;
pub mod rounds;
pub mod scheduler;
pub mod service;
pub mod settlement;
pub mod store;

pub use auctions::{AuctionLifecycle, AuctionPatch, CreateAuction};
pub use bids::{BidBook, RankedBet};
pub use config::Settings;
pub use domain::{
    Auction, AuctionStatus, Bet, Round, RoundStatus, Transaction, TransactionKind, UserAccount,
    Winner,
};
pub use events::{AuctionEvent, EventBus};
pub use ledger::{Ledger, LedgerEntry};
pub use rounds::RoundLifecycle;
pub use scheduler::{Scheduler, TickReport};
pub use service::AuctionService;
pub use settlement::{RefundReport, RoundSettlement, SettlementEngine};
pub use store::{MemoryStore, Store};
