mod common;

use common::{GATEWAY_SECRET, harness, harness_with};
use parley::{
    Category, Error, MarketConfig, NotificationQuery, OrderStatus, PaymentConfirmation,
    ledger::{Direction, EntryQuery, Source},
    payment,
};
use uuid::Uuid;

fn confirmation(order_id: &str, payment_id: &str) -> PaymentConfirmation {
    PaymentConfirmation {
        order_id: order_id.to_string(),
        payment_id: payment_id.to_string(),
        signature: payment::sign(GATEWAY_SECRET, order_id, payment_id).unwrap(),
    }
}

#[tokio::test]
async fn test_confirmed_payment_credits_once() {
    let h = harness();
    let client = h.client(0).await;
    h.market
        .create_order(client, 500_00, "order_Nf1")
        .await
        .unwrap();

    let receipt = h
        .market
        .confirm_payment(confirmation("order_Nf1", "pay_Nf1"))
        .await
        .unwrap();
    assert!(!receipt.replayed);
    assert_eq!(receipt.entry.source, Source::GatewayPayment);
    assert_eq!(receipt.entry.balance_after, 500_00);

    let replay = h
        .market
        .confirm_payment(confirmation("order_Nf1", "pay_Nf1"))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.entry.id, receipt.entry.id);
    assert_eq!(h.market.balance(client).await.unwrap(), 500_00);

    let order = h.market.order("order_Nf1").await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.entry_id, Some(receipt.entry.id));

    // one payment notification, not two
    let inbox = h
        .market
        .notifications(client, NotificationQuery::new().category(Category::Payment))
        .await
        .unwrap();
    assert_eq!(inbox.page.total, 1);
}

#[tokio::test]
async fn test_credit_comes_from_the_stored_order() {
    let h = harness();
    let client = h.client(0).await;
    let other = h.client(0).await;
    h.market.create_order(client, 100, "order_Nf2").await.unwrap();

    // a genuine signature says nothing about amount or account
    let tampered = serde_json::json!({
        "order_id": "order_Nf2",
        "payment_id": "pay_Nf2",
        "signature": payment::sign(GATEWAY_SECRET, "order_Nf2", "pay_Nf2").unwrap(),
        "account": other,
        "amount": 999_999_999u64,
    });
    let tampered: PaymentConfirmation = serde_json::from_value(tampered).unwrap();

    let receipt = h.market.confirm_payment(tampered).await.unwrap();
    assert_eq!(receipt.entry.account, client);
    assert_eq!(receipt.entry.amount, 100);
    assert_eq!(h.market.balance(client).await.unwrap(), 100);
    assert_eq!(h.market.balance(other).await.unwrap(), 0);
}

#[tokio::test]
async fn test_paid_order_rejects_a_second_payment() {
    let h = harness();
    let client = h.client(0).await;
    h.market.create_order(client, 100, "order_Nf3").await.unwrap();
    h.market
        .confirm_payment(confirmation("order_Nf3", "pay_Nf3"))
        .await
        .unwrap();

    assert!(matches!(
        h.market
            .confirm_payment(confirmation("order_Nf3", "pay_other"))
            .await,
        Err(Error::Conflict(_))
    ));

    h.market.create_order(client, 100, "order_Nf3b").await.unwrap();
    assert!(matches!(
        h.market
            .confirm_payment(confirmation("order_Nf3b", "pay_Nf3"))
            .await,
        Err(Error::Conflict(_))
    ));
    assert_eq!(h.market.balance(client).await.unwrap(), 100);
    assert_eq!(
        h.market.order("order_Nf3b").await.unwrap().status,
        OrderStatus::Created
    );
}

#[tokio::test]
async fn test_bad_signature_is_forbidden() {
    let h = harness();
    let client = h.client(0).await;
    h.market.create_order(client, 100, "order_Nf4").await.unwrap();
    let mut forged = confirmation("order_Nf4", "pay_Nf4");
    forged.signature = payment::sign("not-the-secret", "order_Nf4", "pay_Nf4").unwrap();

    assert!(matches!(
        h.market.confirm_payment(forged).await,
        Err(Error::Forbidden(_))
    ));
    assert_eq!(h.market.balance(client).await.unwrap(), 0);
    assert_eq!(
        h.market.order("order_Nf4").await.unwrap().status,
        OrderStatus::Created
    );
}

#[tokio::test]
async fn test_payments_need_a_gateway_secret() {
    let h = harness_with(MarketConfig::default(), Vec::new());
    let client = h.client(0).await;
    h.market.create_order(client, 100, "order_Nf5").await.unwrap();
    assert!(matches!(
        h.market
            .confirm_payment(confirmation("order_Nf5", "pay_Nf5"))
            .await,
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_order_validation() {
    let h = harness();
    let client = h.client(0).await;
    assert!(matches!(
        h.market.create_order(client, 0, "order_Nf6").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        h.market.create_order(Uuid::now_v7(), 10, "order_Nf7").await,
        Err(Error::NotFound(_))
    ));
    h.market.create_order(client, 10, "order_Nf8").await.unwrap();
    assert!(matches!(
        h.market.create_order(client, 20, "order_Nf8").await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        h.market
            .confirm_payment(confirmation("order_unknown", "pay_Nf9"))
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_manual_debit_never_overdraws() {
    let h = harness();
    let client = h.client(300).await;

    assert!(matches!(
        h.market.debit(client, 301, "correction").await,
        Err(Error::InsufficientBalance)
    ));
    let entry = h.market.debit(client, 300, "correction").await.unwrap();
    assert_eq!(entry.balance_after, 0);
    assert_eq!(entry.direction, Direction::Debit);
    assert!(matches!(
        h.market.credit(client, 0, "nothing").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_transaction_history_and_summary() {
    let h = harness();
    let client = h.client(0).await;
    for amount in [100, 200, 300, 400] {
        h.market.credit(client, amount, "top up").await.unwrap();
    }
    h.market.debit(client, 50, "fee").await.unwrap();

    let page = h
        .market
        .transactions(client, EntryQuery::new().page(1, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items[0].amount, 50);
    assert_eq!(page.items[1].amount, 400);

    let credits = h
        .market
        .transactions(client, EntryQuery::new().direction(Direction::Credit))
        .await
        .unwrap();
    assert_eq!(credits.total, 4);

    let entry = h
        .market
        .transaction(client, page.items[0].id)
        .await
        .unwrap();
    assert_eq!(entry.remark, "fee");

    let summary = h.market.wallet_summary(client).await.unwrap();
    assert_eq!(summary.current_balance, 950);
    assert_eq!(summary.total_credits, 1_000);
    assert_eq!(summary.total_debits, 50);
    assert_eq!(summary.recent.len(), 5);
    assert_eq!(h.adapter.replayed_balance(client), 950);
}

#[tokio::test]
async fn test_page_limit_is_capped() {
    let h = harness();
    let client = h.client(1).await;
    let page = h
        .market
        .transactions(client, EntryQuery::new().page(1, 10_000))
        .await
        .unwrap();
    assert_eq!(page.limit, h.market.config().max_page_limit);
}
