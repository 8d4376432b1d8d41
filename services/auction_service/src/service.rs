//! The service facade the transport layer consumes.
//!
//! `AuctionService` wires one store into the ledger, bid book, lifecycle
//! and settlement engines plus the shared event bus, and exposes each
//! logical operation 1:1. HTTP routing, authentication and request
//! validation live upstream; everything arriving here is an
//! already-resolved user id and a validated integer amount.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use carousel_common::{Amount, AuctionId, Result, RoundId, UserId};

use crate::auctions::{AuctionLifecycle, AuctionPatch, CreateAuction};
use crate::bids::{BidBook, RankedBet};
use crate::config::Settings;
use crate::domain::{Auction, Bet, Round, Transaction, UserAccount};
use crate::events::{AuctionEvent, EventBus};
use crate::ledger::Ledger;
use crate::rounds::RoundLifecycle;
use crate::scheduler::{Scheduler, TickReport};
use crate::settlement::{RefundReport, RoundSettlement, SettlementEngine};
use crate::store::{MemoryStore, Store};

pub struct AuctionService<S> {
    store: Arc<S>,
    settings: Settings,
    bus: EventBus,
    ledger: Ledger<S>,
    bids: BidBook<S>,
    rounds: RoundLifecycle<S>,
    auctions: AuctionLifecycle<S>,
    settlement: SettlementEngine<S>,
    scheduler: Scheduler<S>,
}

impl<S> Clone for AuctionService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            bus: self.bus.clone(),
            ledger: self.ledger.clone(),
            bids: self.bids.clone(),
            rounds: self.rounds.clone(),
            auctions: self.auctions.clone(),
            settlement: self.settlement.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S> AuctionService<S>
where
    S: Store,
{
    pub fn new(store: S, settings: Settings) -> Self {
        let store = Arc::new(store);
        let bus = EventBus::default();
        let current_ttl = StdDuration::from_millis(settings.cache.current_ttl_ms);
        let leaderboard_ttl = StdDuration::from_millis(settings.cache.leaderboard_ttl_ms);

        let ledger = Ledger::new(Arc::clone(&store));
        let rounds = RoundLifecycle::new(Arc::clone(&store), bus.clone(), current_ttl);
        let bids = BidBook::new(
            Arc::clone(&store),
            ledger.clone(),
            rounds.clone(),
            bus.clone(),
            settings.engine.clone(),
            leaderboard_ttl,
        );
        let settlement = SettlementEngine::new(
            Arc::clone(&store),
            ledger.clone(),
            bids.clone(),
            bus.clone(),
            settings.engine.clone(),
        );
        let auctions = AuctionLifecycle::new(
            Arc::clone(&store),
            rounds.clone(),
            settlement.clone(),
            bus.clone(),
            current_ttl,
        );
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            rounds.clone(),
            auctions.clone(),
            settlement.clone(),
        );

        Self {
            store,
            settings,
            bus,
            ledger,
            bids,
            rounds,
            auctions,
            settlement,
            scheduler,
        }
    }

    /// Direct store access, for tests and operational tooling.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuctionEvent> {
        self.bus.subscribe()
    }

    /* ------------------------------ auctions ------------------------------ */

    pub async fn create_auction(&self, params: CreateAuction) -> Result<Auction> {
        self.auctions.create(params).await
    }

    pub async fn start_auction(&self, auction_id: AuctionId) -> Result<Auction> {
        self.auctions.start(auction_id).await
    }

    pub async fn end_auction(&self, auction_id: AuctionId) -> Result<Auction> {
        self.auctions.end(auction_id).await
    }

    pub async fn update_auction(
        &self,
        auction_id: AuctionId,
        patch: AuctionPatch,
    ) -> Result<Auction> {
        self.auctions.update(auction_id, patch).await
    }

    pub async fn current_auction(&self) -> Result<Option<Auction>> {
        self.auctions.current_auction().await
    }

    /* ------------------------------- rounds ------------------------------- */

    pub async fn create_next_round(&self, auction_id: AuctionId) -> Result<Option<Round>> {
        match self.store.auction(auction_id).await? {
            Some(auction) => self.rounds.create_next_round(&auction).await,
            None => Err(carousel_common::CoreError::not_found(
                "auction", auction_id,
            )),
        }
    }

    pub async fn end_round(&self, round_id: RoundId) -> Result<Round> {
        self.rounds.end_round(round_id).await
    }

    pub async fn extend_round(&self, round_id: RoundId, delta_secs: i64) -> Result<Round> {
        self.rounds
            .extend_time(round_id, Duration::seconds(delta_secs))
            .await
    }

    pub async fn current_round(&self, auction_id: AuctionId) -> Result<Option<Round>> {
        self.rounds.current_round(auction_id).await
    }

    /* -------------------------------- bids -------------------------------- */

    pub async fn place_bid(
        &self,
        user_id: UserId,
        round_id: RoundId,
        amount: Amount,
        idempotency_key: Option<String>,
    ) -> Result<Bet> {
        self.bids
            .place_bid(user_id, round_id, amount, idempotency_key)
            .await
    }

    pub async fn get_user_bet(&self, user_id: UserId, round_id: RoundId) -> Result<Option<Bet>> {
        self.bids.get_user_bet(user_id, round_id).await
    }

    pub async fn leaderboard(&self, round_id: RoundId, limit: usize) -> Result<Vec<RankedBet>> {
        self.bids.leaderboard(round_id, limit).await
    }

    /* ----------------------------- settlement ----------------------------- */

    /// Settles one round, resolving the prize policy from its auction.
    /// Also exposed as a background job; the idempotency keys inside make
    /// queue redelivery safe.
    pub async fn process_round_winners(
        &self,
        round_id: RoundId,
        next_round_id: Option<RoundId>,
    ) -> Result<RoundSettlement> {
        let round = self
            .store
            .round(round_id)
            .await?
            .ok_or_else(|| carousel_common::CoreError::not_found("round", round_id))?;
        let auction = self
            .store
            .auction(round.auction_id)
            .await?
            .ok_or_else(|| {
                carousel_common::CoreError::not_found("auction", round.auction_id)
            })?;
        self.settlement
            .process_round_winners(
                round_id,
                auction.winners_per_round,
                auction.prize_amount,
                next_round_id,
            )
            .await
    }

    pub async fn process_refunds(&self, auction_id: AuctionId) -> Result<RefundReport> {
        self.settlement.process_refunds(auction_id).await
    }

    /* ------------------------------- ledger ------------------------------- */

    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: Amount,
        idempotency_key: Option<String>,
    ) -> Result<Transaction> {
        self.ledger.deposit(user_id, amount, idempotency_key).await
    }

    pub async fn account(&self, user_id: UserId) -> Result<UserAccount> {
        self.ledger.account(user_id).await
    }

    pub async fn transactions_of(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        self.ledger.transactions_of(user_id).await
    }

    /* ------------------------------ scheduler ------------------------------ */

    /// Runs one scheduler pass; background jobs and tests call this
    /// directly.
    pub async fn tick(&self) -> Result<TickReport> {
        self.scheduler.tick().await
    }

    /// Spawns the periodic scheduler loop at the configured cadence.
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let interval = StdDuration::from_secs(self.settings.scheduler.tick_interval_secs);
        self.scheduler.clone().spawn_tick_loop(interval)
    }
}

impl AuctionService<MemoryStore> {
    /// Convenience constructor for tests and local development.
    pub fn with_memory_store(settings: Settings) -> Self {
        Self::new(MemoryStore::new(), settings)
    }
}
