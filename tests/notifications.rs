mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use common::{config, harness, harness_with};
use parley::{
    BroadcastChannel, Category, DeliveryChannel, Error, Notification, NotificationDraft,
    NotificationQuery, SessionKind, SettingsPatch, notify::ChannelKind,
};
use uuid::Uuid;

#[derive(Clone, Default)]
struct CountingPush {
    delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl DeliveryChannel for CountingPush {
    fn name(&self) -> &'static str {
        "counting-push"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn deliver(&self, _notification: &Notification) -> Result<(), Error> {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingPush;

#[async_trait]
impl DeliveryChannel for FailingPush {
    fn name(&self) -> &'static str {
        "failing-push"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn deliver(&self, _notification: &Notification) -> Result<(), Error> {
        Err(Error::DependencyFailure("push provider down".to_string()))
    }
}

async fn settle_deliveries() {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}

#[tokio::test]
async fn test_inbox_read_and_delete() {
    let h = harness();
    let account = Uuid::now_v7();
    for i in 0..3 {
        h.market
            .notify(
                account,
                NotificationDraft::new(format!("Offer {i}"), "20% off", Category::Promotion),
            )
            .await
            .unwrap();
    }
    let system = h
        .market
        .notify(
            account,
            NotificationDraft::new("Maintenance", "Tonight 2am", Category::System),
        )
        .await
        .unwrap();

    let inbox = h
        .market
        .notifications(account, NotificationQuery::new())
        .await
        .unwrap();
    assert_eq!(inbox.unread, 4);
    assert_eq!(inbox.page.total, 4);
    assert_eq!(inbox.page.items[0].id, system.id);

    assert!(h.market.mark_read(account, system.id).await.unwrap());
    assert!(!h.market.mark_read(account, system.id).await.unwrap());

    let unread = h
        .market
        .notifications(account, NotificationQuery::new().unread_only())
        .await
        .unwrap();
    assert_eq!(unread.page.total, 3);
    assert_eq!(unread.unread, 3);

    assert_eq!(h.market.mark_all_read(account).await.unwrap(), 3);
    assert_eq!(
        h.market
            .notifications(account, NotificationQuery::new())
            .await
            .unwrap()
            .unread,
        0
    );

    assert!(matches!(
        h.market.delete_notification(Uuid::now_v7(), system.id).await,
        Err(Error::NotFound(_))
    ));
    h.market
        .delete_notification(account, system.id)
        .await
        .unwrap();
    let promos = h
        .market
        .notifications(account, NotificationQuery::new().category(Category::Promotion))
        .await
        .unwrap();
    assert_eq!(promos.page.total, 3);
}

#[tokio::test]
async fn test_empty_title_is_rejected() {
    let h = harness();
    assert!(matches!(
        h.market
            .notify(Uuid::now_v7(), NotificationDraft::new("", "body", Category::System))
            .await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_settings_default_then_patch() {
    let h = harness();
    let account = Uuid::now_v7();

    let defaults = h.market.notification_settings(account).await.unwrap();
    assert!(defaults.push_enabled && defaults.chat && defaults.promotional);

    let updated = h
        .market
        .update_notification_settings(
            account,
            SettingsPatch {
                promotional: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.promotional);
    assert!(updated.chat);
    assert_eq!(
        h.market.notification_settings(account).await.unwrap(),
        updated
    );
}

#[tokio::test]
async fn test_push_respects_settings() {
    let push = CountingPush::default();
    let h = harness_with(config(), vec![Arc::new(push.clone())]);
    let account = Uuid::now_v7();

    h.market
        .update_notification_settings(
            account,
            SettingsPatch {
                promotional: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.market
        .notify(account, NotificationDraft::new("Sale", "now", Category::Promotion))
        .await
        .unwrap();
    h.market
        .notify(account, NotificationDraft::new("Paid", "ok", Category::Payment))
        .await
        .unwrap();
    settle_deliveries().await;
    assert_eq!(push.delivered.load(Ordering::SeqCst), 1);

    // still stored in the inbox even when push was skipped
    let inbox = h
        .market
        .notifications(account, NotificationQuery::new())
        .await
        .unwrap();
    assert_eq!(inbox.page.total, 2);
}

#[tokio::test]
async fn test_failed_delivery_does_not_fail_the_operation() {
    let h = harness_with(config(), vec![Arc::new(FailingPush)]);
    let client = h.client(10_000).await;
    let consultant = h.consultant(10, 20).await;

    let chat = h
        .market
        .start_session(client, consultant, SessionKind::Chat)
        .await
        .unwrap();
    h.advance(Duration::minutes(1));
    let settlement = h.market.end_session(chat.id, client).await.unwrap();
    assert_eq!(settlement.session.charged_amount, 10);
    settle_deliveries().await;
}

#[tokio::test]
async fn test_session_events_reach_the_counterpart() {
    let broadcast = BroadcastChannel::new(16);
    let mut receiver = broadcast.subscribe();
    let h = harness_with(config(), vec![Arc::new(broadcast)]);
    let client = h.client(10_000).await;
    let consultant = h.consultant(10, 20).await;

    let call = h
        .market
        .start_session(client, consultant, SessionKind::Voice)
        .await
        .unwrap();
    let incoming = tokio::time::timeout(StdDuration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incoming.account, consultant);
    assert_eq!(incoming.category, Category::Call);
    assert_eq!(incoming.payload["session_id"], serde_json::json!(call.id));

    h.market.accept_call(call.id, consultant).await.unwrap();
    h.advance(Duration::minutes(2));
    h.market.end_session(call.id, consultant).await.unwrap();

    let client_inbox = h
        .market
        .notifications(client, NotificationQuery::new().category(Category::Call))
        .await
        .unwrap();
    // accepted, then completed
    assert_eq!(client_inbox.page.total, 2);
    assert_eq!(client_inbox.page.items[0].title, "Session ended");

    let consultant_inbox = h
        .market
        .notifications(consultant, NotificationQuery::new())
        .await
        .unwrap();
    assert_eq!(consultant_inbox.page.total, 1);
}

#[tokio::test]
async fn test_bulk_send_checks_each_recipient() {
    let push = CountingPush::default();
    let h = harness_with(config(), vec![Arc::new(push.clone())]);
    let keen = Uuid::now_v7();
    let opted_out = Uuid::now_v7();
    h.market
        .update_notification_settings(
            opted_out,
            SettingsPatch {
                promotional: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let sent = h
        .market
        .notify_many(
            [keen, opted_out, keen],
            NotificationDraft::new("Weekend offer", "20% off calls", Category::Promotion),
        )
        .await
        .unwrap();
    assert_eq!(sent.len(), 2);
    settle_deliveries().await;
    assert_eq!(push.delivered.load(Ordering::SeqCst), 1);

    for account in [keen, opted_out] {
        let inbox = h
            .market
            .notifications(account, NotificationQuery::new())
            .await
            .unwrap();
        assert_eq!(inbox.page.total, 1);
    }

    assert!(matches!(
        h.market
            .notify_many([keen], NotificationDraft::new("", "body", Category::Promotion))
            .await,
        Err(Error::Validation(_))
    ));
}
