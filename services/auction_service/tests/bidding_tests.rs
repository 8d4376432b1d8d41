//! Bid placement under retries, contention and window boundaries.
//!
//! The suite leans on Tokio because the production paths are async
//! end-to-end; contention cases drive real concurrent tasks against one
//! shared service.

mod common;

use futures::future::join_all;

use auction_service::store::{BetStore, RoundStore};
use auction_service::TransactionKind;
use carousel_common::{CoreError, UserId};
use common::*;

#[tokio::test]
async fn idempotent_retry_yields_same_bet_and_one_transaction() {
    let service = service();
    let (_auction, round) = started_auction(&service, 3, 3, 1_000).await;
    let user = funded_user(&service, 50_000).await;

    let key = Some("bid-1".to_owned());
    let first = service
        .place_bid(user, round.id, 20_000, key.clone())
        .await
        .unwrap();
    let second = service
        .place_bid(user, round.id, 20_000, key)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.amount, 20_000);

    let stakes: Vec<_> = service
        .transactions_of(user)
        .await
        .unwrap()
        .into_iter()
        .filter(|tx| tx.kind == TransactionKind::Bet)
        .collect();
    assert_eq!(stakes.len(), 1, "replay must not charge twice");
    assert_eq!(service.account(user).await.unwrap().balance, 30_000);
}

#[tokio::test]
async fn concurrent_first_bids_collapse_to_one_row() {
    let service = service();
    let (_auction, round) = started_auction(&service, 3, 3, 1_000).await;
    let user = funded_user(&service, 1_000_000).await;

    // Ten simultaneous "first" bids at distinct amounts: exactly one row
    // must survive, the rest resolve as raises or lose validation.
    let attempts = join_all((1..=10u64).map(|i| {
        let service = service.clone();
        let round_id = round.id;
        async move {
            service
                .place_bid(user, round_id, i * 1_000, None)
                .await
        }
    }))
    .await;

    assert!(attempts.iter().any(|r| r.is_ok()));

    let bets = service
        .store()
        .as_ref()
        .bets_in_round(round.id)
        .await
        .unwrap();
    assert_eq!(bets.len(), 1, "unique (user, round) must hold");

    // Every charged unit is accounted for by the surviving amount.
    let bet = service.get_user_bet(user, round.id).await.unwrap().unwrap();
    let account = service.account(user).await.unwrap();
    assert_eq!(account.balance, 1_000_000 - bet.amount);
}

#[tokio::test]
async fn concurrent_raises_serialize_to_one_consistent_amount() {
    let service = service();
    let (_auction, round) = started_auction(&service, 3, 3, 1_000).await;
    let user = funded_user(&service, 1_000_000).await;

    service.place_bid(user, round.id, 5_000, None).await.unwrap();

    let outcomes = join_all([20_000u64, 30_000, 40_000].map(|amount| {
        let service = service.clone();
        let round_id = round.id;
        async move { service.place_bid(user, round_id, amount, None).await }
    }))
    .await;
    assert!(outcomes.iter().any(|r| r.is_ok()));

    let bet = service.get_user_bet(user, round.id).await.unwrap().unwrap();
    let account = service.account(user).await.unwrap();
    // whatever interleaving happened, money matches the surviving bid
    assert_eq!(account.balance, 1_000_000 - bet.amount);
    assert!(bet.amount >= 20_000);
}

#[tokio::test]
async fn bids_outside_the_window_are_rejected() {
    let service = service();
    let (auction, round) = started_auction(&service, 3, 3, 1_000).await;
    let user = funded_user(&service, 50_000).await;

    // move past round 1 so the protected round is out of the picture
    expire_round(&service, &round).await;
    service.tick().await.unwrap();
    let round2 = service
        .store()
        .as_ref()
        .active_round(auction.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(round2.number, 2);

    expire_round(&service, &round2).await;
    // round 2 is past its end time and unprotected: no extension, no bid
    let err = service
        .place_bid(user, round2.id, 10_000, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn sniping_extension_applies_to_round_one_only() {
    // Deliberate asymmetry: only round 1 is protected. If this test
    // starts failing because later rounds extend too, that is a product
    // behavior change, not a refactoring accident.
    let service = service();
    let (auction, round1) = started_auction(&service, 3, 3, 1_000).await;
    let user = funded_user(&service, 100_000).await;

    shrink_round_window(&service, &round1, 5).await;
    let before = service
        .store()
        .as_ref()
        .round(round1.id)
        .await
        .unwrap()
        .unwrap()
        .end_time;
    service.place_bid(user, round1.id, 10_000, None).await.unwrap();
    let after = service
        .store()
        .as_ref()
        .round(round1.id)
        .await
        .unwrap()
        .unwrap()
        .end_time;
    assert!(after > before, "round 1 must extend under the threshold");

    // round 2: same squeeze, no extension
    expire_round(&service, &round1).await;
    service.tick().await.unwrap();
    let round2 = service
        .store()
        .as_ref()
        .active_round(auction.id)
        .await
        .unwrap()
        .unwrap();
    shrink_round_window(&service, &round2, 5).await;
    let before = service
        .store()
        .as_ref()
        .round(round2.id)
        .await
        .unwrap()
        .unwrap()
        .end_time;
    service.place_bid(user, round2.id, 12_000, None).await.unwrap();
    let after = service
        .store()
        .as_ref()
        .round(round2.id)
        .await
        .unwrap()
        .unwrap()
        .end_time;
    assert_eq!(after, before, "later rounds must not extend");
}

#[tokio::test]
async fn insufficient_funds_reports_exact_numbers_and_changes_nothing() {
    let service = service();
    let (_auction, round) = started_auction(&service, 3, 3, 1_000).await;
    let user = funded_user(&service, 7_500).await;

    let err = service
        .place_bid(user, round.id, 12_000, None)
        .await
        .unwrap_err();
    match err {
        CoreError::InsufficientFunds {
            required,
            available,
        } => assert_eq!((required, available), (12_000, 7_500)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.account(user).await.unwrap().balance, 7_500);
    assert!(service.get_user_bet(user, round.id).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_user_cannot_bid() {
    let service = service();
    let (_auction, round) = started_auction(&service, 3, 3, 1_000).await;

    let err = service
        .place_bid(UserId::new(), round.id, 1_000, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn single_open_auction_invariant_holds() {
    let service = service();
    let (auction, _round) = started_auction(&service, 3, 3, 1_000).await;

    let err = service
        .create_auction(auction_service::CreateAuction {
            name: "second".into(),
            prize_amount: 500,
            winners_per_round: 1,
            total_rounds: 1,
            round_duration_minutes: 5,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    // a started auction is no longer editable either
    let err = service
        .update_auction(auction.id, auction_service::AuctionPatch::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn leaderboard_reads_through_and_matches_canonical_ranking() {
    let service = service();
    let (_auction, round) = started_auction(&service, 3, 3, 1_000).await;

    let alice = funded_user(&service, 100_000).await;
    let bob = funded_user(&service, 100_000).await;
    service.place_bid(alice, round.id, 30_000, None).await.unwrap();
    service.place_bid(bob, round.id, 40_000, None).await.unwrap();

    let board = service.leaderboard(round.id, 10).await.unwrap();
    let order: Vec<UserId> = board.iter().map(|r| r.bet.user_id).collect();
    assert_eq!(order, vec![bob, alice]);
    assert_eq!(board[0].rank, 1);
    assert_eq!(board[1].rank, 2);
}
