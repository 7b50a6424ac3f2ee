mod common;

use chrono::Duration;
use common::{config, harness, harness_with};
use futures::future::join_all;
use parley::{
    CancelReason, Error, HmacTokenIssuer, InvalidState, MarketConfig, Marketplace, MediaRole,
    SessionKind, SessionQuery, SessionStatus, SettlementPolicy,
    adapters::memory::MemoryAdapter,
    ledger::{EntryQuery, Source},
    media,
};
use uuid::Uuid;

#[tokio::test]
async fn test_chat_bills_whole_minutes_rounded_up() {
    let h = harness();
    let client = h.client(1_000).await;
    let consultant = h.consultant(30, 50).await;

    let session = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.rate, 30);

    h.advance(Duration::seconds(125));
    let settlement = h.market.end_session(session.id, client).await.unwrap();

    assert_eq!(settlement.session.status, SessionStatus::Completed);
    assert_eq!(settlement.session.duration_minutes, 3);
    assert_eq!(settlement.session.charged_amount, 90);
    assert_eq!(settlement.session.waived_amount, 0);

    let entry = settlement.entry.unwrap();
    assert_eq!(entry.amount, 90);
    assert_eq!(entry.source, Source::SessionChat);
    assert_eq!(entry.balance_after, 910);
    assert_eq!(h.market.balance(client).await.unwrap(), 910);
}

#[tokio::test]
async fn test_second_end_is_already_terminal() {
    let h = harness();
    let client = h.client(1_000).await;
    let consultant = h.consultant(30, 50).await;
    let settlement = h.completed_chat(client, consultant, 2).await;

    let again = h.market.end_session(settlement.session.id, consultant).await;
    assert!(matches!(
        again,
        Err(Error::InvalidState(InvalidState::AlreadyTerminal))
    ));
    assert_eq!(h.market.balance(client).await.unwrap(), 940);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ends_settle_once() {
    let h = harness();
    let client = h.client(1_000).await;
    let consultant = h.consultant(25, 50).await;
    let session = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();
    h.advance(Duration::seconds(90));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let market = h.market.clone();
            let actor = if i % 2 == 0 { client } else { consultant };
            tokio::spawn(async move { market.end_session(session.id, actor).await })
        })
        .collect();

    let mut settled = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => settled += 1,
            Err(Error::InvalidState(InvalidState::AlreadyTerminal)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(settled, 1);
    assert_eq!(h.market.balance(client).await.unwrap(), 950);
    assert_eq!(h.adapter.replayed_balance(client), 950);

    let debits = h
        .market
        .transactions(client, EntryQuery::new().source(Source::SessionChat))
        .await
        .unwrap();
    assert_eq!(debits.total, 1);
}

#[tokio::test]
async fn test_balance_floor_is_inclusive() {
    let h = harness();
    let consultant = h.consultant(20, 40).await;

    let exact = h.client(100).await;
    let quote = h
        .market
        .check_eligibility(exact, consultant, SessionKind::Chat)
        .await
        .unwrap();
    assert_eq!(quote.required_balance, 100);
    assert!(
        h.market
            .start_session(exact, consultant, SessionKind::Chat)
            .await
            .is_ok()
    );

    let short = h.client(99).await;
    assert!(matches!(
        h.market
            .start_session(short, consultant, SessionKind::Chat)
            .await,
        Err(Error::InsufficientBalance)
    ));

    // calls use the call rate
    assert!(matches!(
        h.market
            .check_eligibility(exact, consultant, SessionKind::Voice)
            .await,
        Err(Error::InsufficientBalance)
    ));
}

#[tokio::test]
async fn test_unavailable_or_unknown_consultant() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    h.market
        .set_availability(consultant, consultant, false)
        .await
        .unwrap();

    assert!(matches!(
        h.market
            .start_session(client, consultant, SessionKind::Chat)
            .await,
        Err(Error::Unavailable)
    ));
    assert!(matches!(
        h.market
            .start_session(client, Uuid::now_v7(), SessionKind::Chat)
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_only_consultant_toggles_availability() {
    let h = harness();
    let consultant = h.consultant(20, 40).await;
    let stranger = Uuid::now_v7();
    assert!(matches!(
        h.market.set_availability(consultant, stranger, false).await,
        Err(Error::Forbidden(_))
    ));
    assert!(h.market.profile(consultant).await.unwrap().available);
}

#[tokio::test]
async fn test_blocked_client_cannot_start() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    h.market.set_blocked(client, true).await.unwrap();

    assert!(matches!(
        h.market
            .start_session(client, consultant, SessionKind::Voice)
            .await,
        Err(Error::Forbidden(_))
    ));
}

#[tokio::test]
async fn test_call_bills_from_acceptance() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;

    let call = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();
    assert_eq!(call.status, SessionStatus::Requested);

    h.advance(Duration::seconds(45));
    let live = h.market.accept_call(call.id, consultant).await.unwrap();
    assert_eq!(live.status, SessionStatus::Active);
    assert_eq!(live.started_at, common::epoch() + Duration::seconds(45));

    h.advance(Duration::seconds(61));
    let settlement = h.market.end_session(call.id, consultant).await.unwrap();
    assert_eq!(settlement.session.duration_minutes, 2);
    assert_eq!(settlement.session.charged_amount, 80);
    assert_eq!(settlement.entry.unwrap().source, Source::SessionCall);
    assert_eq!(h.market.balance(client).await.unwrap(), 9_920);
}

#[tokio::test]
async fn test_ending_before_pickup_cancels_without_charge() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    let call = h
        .market
        .start_session(client, consultant, SessionKind::Video)
        .await
        .unwrap();

    h.advance(Duration::seconds(10));
    let settlement = h.market.end_session(call.id, client).await.unwrap();
    assert_eq!(settlement.session.status, SessionStatus::Cancelled);
    assert_eq!(
        settlement.session.cancel_reason,
        Some(CancelReason::EndedBeforePickup)
    );
    assert!(settlement.entry.is_none());
    assert_eq!(h.market.balance(client).await.unwrap(), 10_000);
}

#[tokio::test]
async fn test_reject_and_cancel_rules() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;

    let call = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();
    assert!(matches!(
        h.market.reject_call(call.id, client).await,
        Err(Error::Forbidden(_))
    ));
    let rejected = h.market.reject_call(call.id, consultant).await.unwrap();
    assert_eq!(rejected.cancel_reason, Some(CancelReason::Rejected));
    assert!(matches!(
        h.market.accept_call(call.id, consultant).await,
        Err(Error::InvalidState(InvalidState::AlreadyTerminal))
    ));

    let call = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();
    assert!(matches!(
        h.market.cancel_request(call.id, consultant).await,
        Err(Error::Forbidden(_))
    ));
    let cancelled = h.market.cancel_request(call.id, client).await.unwrap();
    assert_eq!(cancelled.cancel_reason, Some(CancelReason::CallerCancelled));
}

#[tokio::test]
async fn test_accepting_a_chat_is_not_requested() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();
    assert!(matches!(
        h.market.accept_call(chat.id, consultant).await,
        Err(Error::InvalidState(InvalidState::NotRequested))
    ));
}

#[tokio::test]
async fn test_rate_is_captured_at_start() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();

    h.market
        .update_rates(consultant, consultant, 90, 120)
        .await
        .unwrap();
    h.advance(Duration::minutes(3));

    let settlement = h.market.end_session(chat.id, client).await.unwrap();
    assert_eq!(settlement.session.charged_amount, 60);
}

#[tokio::test]
async fn test_rejected_settlement_leaves_session_active() {
    let h = harness();
    let client = h.client(100).await;
    let consultant = h.consultant(20, 40).await;
    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();

    h.advance(Duration::minutes(6));
    assert!(matches!(
        h.market.end_session(chat.id, client).await,
        Err(Error::InsufficientBalance)
    ));

    let current = h.market.session(chat.id, client).await.unwrap();
    assert_eq!(current.status, SessionStatus::Active);
    assert_eq!(h.market.balance(client).await.unwrap(), 100);

    // topped up, settlement goes through
    h.market.credit(client, 50, "top up").await.unwrap();
    let settlement = h.market.end_session(chat.id, client).await.unwrap();
    assert_eq!(settlement.session.charged_amount, 120);
    assert_eq!(h.market.balance(client).await.unwrap(), 30);
}

#[tokio::test]
async fn test_waive_policy_completes_without_debit() {
    let h = harness_with(
        MarketConfig {
            settlement_policy: SettlementPolicy::WaiveCharge,
            ..config()
        },
        Vec::new(),
    );
    let client = h.client(100).await;
    let consultant = h.consultant(20, 40).await;
    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();

    h.advance(Duration::minutes(6));
    let settlement = h.market.end_session(chat.id, client).await.unwrap();
    assert_eq!(settlement.session.status, SessionStatus::Completed);
    assert_eq!(settlement.session.charged_amount, 0);
    assert_eq!(settlement.session.waived_amount, 120);
    assert!(settlement.entry.is_none());
    assert_eq!(h.market.balance(client).await.unwrap(), 100);
}

#[tokio::test]
async fn test_outsider_cannot_end_or_read() {
    let h = harness();
    let client = h.client(1_000).await;
    let consultant = h.consultant(20, 40).await;
    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();
    let outsider = Uuid::now_v7();

    assert!(matches!(
        h.market.end_session(chat.id, outsider).await,
        Err(Error::Forbidden(_))
    ));
    assert!(matches!(
        h.market.session(chat.id, outsider).await,
        Err(Error::Forbidden(_))
    ));
    assert!(matches!(
        h.market.end_session(Uuid::now_v7(), client).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_history_is_visible_to_both_sides() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;

    h.completed_chat(client, consultant, 1).await;
    h.advance(Duration::minutes(1));
    let live = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();

    for participant in [client, consultant] {
        let history = h
            .market
            .session_history(participant, SessionQuery::new())
            .await
            .unwrap();
        assert_eq!(history.total, 2);
        assert_eq!(history.items[0].id, live.id);
    }

    let chats = h
        .market
        .session_history(client, SessionQuery::new().kind(SessionKind::Chat))
        .await
        .unwrap();
    assert_eq!(chats.total, 1);

    let active = h.market.active_sessions(consultant).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, live.id);

    let stranger = h
        .market
        .session_history(Uuid::now_v7(), SessionQuery::new())
        .await
        .unwrap();
    assert_eq!(stranger.total, 0);
}

#[tokio::test]
async fn test_unanswered_calls_expire() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    let call = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();

    h.advance(Duration::seconds(30));
    assert!(h.market.expire_unanswered_calls().await.unwrap().is_empty());

    h.advance(Duration::seconds(31));
    let report = h.market.reap().await.unwrap();
    assert_eq!(report.expired.len(), 1);
    assert!(report.ended.is_empty());

    let expired = h.market.session(call.id, client).await.unwrap();
    assert_eq!(expired.status, SessionStatus::Cancelled);
    assert_eq!(expired.cancel_reason, Some(CancelReason::RingTimeout));
}

#[tokio::test]
async fn test_overdue_sessions_bill_up_to_the_cap() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(2, 4).await;
    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();

    h.advance(Duration::minutes(239));
    assert!(h.market.end_overdue_sessions().await.unwrap().is_empty());

    h.advance(Duration::minutes(20));
    let report = h.market.reap().await.unwrap();
    assert_eq!(report.ended.len(), 1);

    let ended = &report.ended[0].session;
    assert_eq!(ended.id, chat.id);
    assert_eq!(ended.duration_minutes, 240);
    assert_eq!(ended.charged_amount, 480);
    assert_eq!(ended.ended_at, Some(chat.started_at + Duration::minutes(240)));
    assert_eq!(h.market.balance(client).await.unwrap(), 9_520);
}

#[tokio::test]
async fn test_media_tokens_for_live_participants() {
    let certificate = b"app-certificate";
    let adapter = MemoryAdapter::new();
    let market = Marketplace::builder(adapter)
        .config(config())
        .token_issuer(HmacTokenIssuer::new("media-app", certificate).unwrap())
        .build()
        .unwrap();
    let verifier = HmacTokenIssuer::new("media-app", certificate).unwrap();

    let client = Uuid::now_v7();
    market.register_account(client).await.unwrap();
    market.credit(client, 10_000, "seed").await.unwrap();
    let consultant = Uuid::now_v7();
    market
        .register_consultant(parley::ConsultantProfile::new(consultant, "Ravi", 20, 40))
        .await
        .unwrap();
    market
        .set_availability(consultant, consultant, true)
        .await
        .unwrap();

    let call = market
        .start_session(client, consultant, SessionKind::Video)
        .await
        .unwrap();

    // ringing calls get a token so the caller can join early
    let token = market.issue_media_token(call.id, client).await.unwrap();
    assert_eq!(token.channel, call.channel);
    assert_eq!(token.uid, media::participant_uid(client));
    assert_eq!(token.role, MediaRole::Publisher);

    let grant = verifier.verify(&token.token, market.now()).unwrap();
    assert_eq!(grant.channel, call.channel);

    assert!(matches!(
        market.issue_media_token(call.id, Uuid::now_v7()).await,
        Err(Error::Forbidden(_))
    ));

    market.end_session(call.id, client).await.unwrap();
    assert!(matches!(
        market.issue_media_token(call.id, client).await,
        Err(Error::InvalidState(InvalidState::NotLive))
    ));
}

#[tokio::test]
async fn test_media_token_without_issuer() {
    let h = harness();
    let client = h.client(10_000).await;
    let consultant = h.consultant(20, 40).await;
    let call = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();

    assert!(matches!(
        h.market.issue_media_token(call.id, consultant).await,
        Err(Error::DependencyFailure(_))
    ));
}

#[tokio::test]
async fn test_sequential_settlements_conserve_money() {
    let h = harness();
    let client = h.client(5_000).await;
    let consultants = join_all((0..3).map(|i| h.consultant(10 + i, 20 + i))).await;

    let mut charged = 0;
    for (i, consultant) in consultants.iter().enumerate() {
        let settlement = h.completed_chat(client, *consultant, i as i64 + 1).await;
        charged += settlement.session.charged_amount;
    }

    // 10*1 + 11*2 + 12*3
    assert_eq!(charged, 68);
    let balance = h.market.balance(client).await.unwrap();
    assert_eq!(balance, 5_000 - 68);
    assert_eq!(h.adapter.replayed_balance(client), balance as i128);
}
