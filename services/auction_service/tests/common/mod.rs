//! Shared fixtures for the integration suites.
//!
//! Everything runs against the in-memory store; tests that need a round
//! to expire rewrite its end time through the store instead of sleeping
//! out real wall-clock minutes.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;

use auction_service::config::Settings;
use auction_service::store::{MemoryStore, RoundStore};
use auction_service::{Auction, AuctionService, CreateAuction, Round};
use carousel_common::{Amount, UserId};

/// Install a test logger once for the whole test binary.
static LOG_HANDLE: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
});

/// Settings tuned for tests: caching off, no refund pauses.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.cache.current_ttl_ms = 0;
    settings.cache.leaderboard_ttl_ms = 0;
    settings.engine.refund_batch_pause_ms = 0;
    settings
}

pub fn service() -> AuctionService<MemoryStore> {
    Lazy::force(&LOG_HANDLE);
    AuctionService::with_memory_store(fast_settings())
}

pub fn service_with(settings: Settings) -> AuctionService<MemoryStore> {
    Lazy::force(&LOG_HANDLE);
    AuctionService::with_memory_store(settings)
}

pub async fn funded_user(service: &AuctionService<MemoryStore>, amount: Amount) -> UserId {
    let user = UserId::new();
    service.deposit(user, amount, None).await.unwrap();
    user
}

/// Creates and starts an auction; returns it with its opened round 1.
pub async fn started_auction(
    service: &AuctionService<MemoryStore>,
    winners_per_round: u32,
    total_rounds: u32,
    prize_amount: Amount,
) -> (Auction, Round) {
    let auction = service
        .create_auction(CreateAuction {
            name: "integration auction".into(),
            prize_amount,
            winners_per_round,
            total_rounds,
            round_duration_minutes: 10,
        })
        .await
        .unwrap();
    let auction = service.start_auction(auction.id).await.unwrap();
    let round = service
        .store()
        .active_round(auction.id)
        .await
        .unwrap()
        .expect("round 1 opens with the auction");
    (auction, round)
}

/// Pushes the round's end time into the past so the next scheduler tick
/// treats it as expired.
pub async fn expire_round(service: &AuctionService<MemoryStore>, round: &Round) {
    let mut stale = service
        .store()
        .round(round.id)
        .await
        .unwrap()
        .expect("round exists");
    stale.end_time = Utc::now() - Duration::seconds(1);
    service.store().update_round(&stale).await.unwrap();
}

/// Shrinks the active window so a bid at `now` lands inside the
/// anti-sniping threshold.
pub async fn shrink_round_window(
    service: &AuctionService<MemoryStore>,
    round: &Round,
    seconds_left: i64,
) {
    let mut tight = service
        .store()
        .round(round.id)
        .await
        .unwrap()
        .expect("round exists");
    tight.end_time = Utc::now() + Duration::seconds(seconds_left);
    service.store().update_round(&tight).await.unwrap();
}
