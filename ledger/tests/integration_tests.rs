// ledger/tests/integration_tests.rs
use parley_ledger::{
    Direction, EntryQuery, LedgerContext, LedgerError, LedgerSystem, Money, Source,
    adapters::MemoryAdapter,
};
use std::sync::Arc;
use uuid::Uuid;

fn setup() -> (Arc<LedgerSystem>, LedgerContext, MemoryAdapter, Uuid) {
    let adapter = MemoryAdapter::new();
    let system = Arc::new(LedgerSystem::new(Box::new(adapter.clone())));
    let ctx = LedgerContext::new(system.adapter_arc());
    let user = Uuid::now_v7();

    (system, ctx, adapter, user)
}

#[tokio::test]
async fn test_credit_creates_balance() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();

    let entry = ctx
        .credit(user, 500_00, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    assert_eq!(entry.direction, Direction::Credit);
    assert_eq!(entry.balance_after, 500_00);
    assert_eq!(ctx.balance(user).await.unwrap(), 500_00);
}

#[tokio::test]
async fn test_open_account_is_idempotent() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();
    ctx.credit(user, 10, Source::AdminAdjustment, "seed")
        .await
        .unwrap();

    let again = system.adapter().open_account(user).await.unwrap();
    assert_eq!(again.balance, 10);
}

#[tokio::test]
async fn test_unknown_account_is_not_found() {
    let (_, ctx, _, user) = setup();
    let result = ctx.credit(user, 10, Source::AdminAdjustment, "ghost").await;
    assert!(matches!(result, Err(LedgerError::AccountNotFound(id)) if id == user));
}

#[tokio::test]
async fn test_debit_cannot_overdraw() {
    let (system, ctx, adapter, user) = setup();
    system.adapter().open_account(user).await.unwrap();
    ctx.credit(user, 100, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    let result = ctx.debit(user, 101, Source::SessionChat, "chat").await;
    assert!(matches!(result, Err(LedgerError::InsufficientBalance)));

    assert_eq!(ctx.balance(user).await.unwrap(), 100);
    assert_eq!(adapter.replayed_balance(user), 100);
}

#[tokio::test]
async fn test_zero_amount_rejected() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();

    let result = ctx.credit(user, 0, Source::AdminAdjustment, "nothing").await;
    assert!(matches!(result, Err(LedgerError::InvalidAmount)));
}

#[tokio::test]
async fn test_balance_equals_replayed_entries() {
    let (system, ctx, adapter, user) = setup();
    system.adapter().open_account(user).await.unwrap();

    ctx.credit(user, 1_000, Source::GatewayPayment, "a")
        .await
        .unwrap();
    ctx.debit(user, 250, Source::SessionChat, "b").await.unwrap();
    ctx.credit(user, 75, Source::AdminAdjustment, "c")
        .await
        .unwrap();
    ctx.debit(user, 825, Source::SessionCall, "d").await.unwrap();
    let _ = ctx.debit(user, 1, Source::SessionCall, "e").await;

    let balance = ctx.balance(user).await.unwrap();
    assert_eq!(balance, 0);
    assert_eq!(adapter.replayed_balance(user), balance as i128);
}

#[tokio::test]
async fn test_concurrent_debits_never_overdraw() {
    let (system, ctx, adapter, user) = setup();
    system.adapter().open_account(user).await.unwrap();
    ctx.credit(user, 100, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    let attempts = (0..10).map(|i| {
        let ctx = ctx.clone();
        async move {
            ctx.debit(user, 100, Source::SessionChat, format!("attempt {i}"))
                .await
        }
    });
    let results = futures::future::join_all(attempts).await;

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(
        results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(LedgerError::InsufficientBalance)))
    );
    assert_eq!(ctx.balance(user).await.unwrap(), 0);
    assert_eq!(adapter.replayed_balance(user), 0);
}

#[tokio::test]
async fn test_concurrent_debits_across_tasks() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();
    ctx.credit(user, 300, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            ctx.debit(user, 100, Source::SessionCall, "call").await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 3);
    assert_eq!(ctx.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn test_idempotent_credit_applies_once() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();

    let first = ctx
        .credit_idempotent(user, 500, Source::GatewayPayment, "order_1", "pay_1")
        .await
        .unwrap();
    let replay = ctx
        .credit_idempotent(user, 500, Source::GatewayPayment, "order_1", "pay_1")
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(replay.replayed);
    assert_eq!(first.entry.id, replay.entry.id);
    assert_eq!(ctx.balance(user).await.unwrap(), 500);

    let page = system
        .adapter()
        .query_entries(user, &EntryQuery::new())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_atomic_plan_rolls_back_entirely() {
    let (system, ctx, adapter, user) = setup();
    let consultant = Uuid::now_v7();
    system.adapter().open_account(user).await.unwrap();
    system.adapter().open_account(consultant).await.unwrap();
    ctx.credit(user, 100, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    let result = Money::atomic(&ctx, |tx| async move {
        tx.credit(consultant, 150, Source::SessionCall, "earnings")?;
        tx.debit(user, 150, Source::SessionCall, "call")?;
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(LedgerError::InsufficientBalance)));
    assert_eq!(ctx.balance(user).await.unwrap(), 100);
    assert_eq!(ctx.balance(consultant).await.unwrap(), 0);
    assert_eq!(adapter.replayed_balance(consultant), 0);
}

#[tokio::test]
async fn test_atomic_plan_reads_balance_before_planning() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();
    ctx.credit(user, 90, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    let entries = Money::atomic(&ctx, |tx| async move {
        let available = tx.balance(user).await?;
        tx.debit(user, available.min(120), Source::SessionChat, "capped")?;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, 90);
    assert_eq!(ctx.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn test_history_filters_and_pages_newest_first() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();

    for i in 1..=12u64 {
        ctx.credit(user, i * 100, Source::GatewayPayment, format!("top up {i}"))
            .await
            .unwrap();
    }
    ctx.debit(user, 50, Source::SessionChat, "chat").await.unwrap();

    let credits = system
        .adapter()
        .query_entries(
            user,
            &EntryQuery::new().direction(Direction::Credit).page(2, 5),
        )
        .await
        .unwrap();
    assert_eq!(credits.total, 12);
    assert_eq!(credits.total_pages, 3);
    let amounts: Vec<u64> = credits.items.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![700, 600, 500, 400, 300]);

    let chats = system
        .adapter()
        .query_entries(user, &EntryQuery::new().source(Source::SessionChat))
        .await
        .unwrap();
    assert_eq!(chats.total, 1);
    assert_eq!(chats.items[0].direction, Direction::Debit);
}

#[tokio::test]
async fn test_summary_totals() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();

    for _ in 0..4 {
        ctx.credit(user, 200, Source::GatewayPayment, "top up")
            .await
            .unwrap();
    }
    ctx.debit(user, 120, Source::SessionCall, "call").await.unwrap();
    ctx.debit(user, 30, Source::SessionChat, "chat").await.unwrap();

    let summary = system.adapter().summary(user).await.unwrap();
    assert_eq!(summary.current_balance, 650);
    assert_eq!(summary.total_credits, 800);
    assert_eq!(summary.total_debits, 150);
    assert_eq!(summary.credit_count, 4);
    assert_eq!(summary.debit_count, 2);
    assert_eq!(summary.recent.len(), 5);
    assert_eq!(summary.recent[0].amount, 30);
}

#[tokio::test]
async fn test_blocking_leaves_balance() {
    let (system, ctx, _, user) = setup();
    system.adapter().open_account(user).await.unwrap();
    ctx.credit(user, 40, Source::GatewayPayment, "top up")
        .await
        .unwrap();

    let account = system.adapter().set_blocked(user, true).await.unwrap();
    assert!(account.blocked);
    assert_eq!(account.balance, 40);
}
