use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Notification, NotificationSettings};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Real-time delivery to connected clients. Always attempted.
    InApp,
    /// Mobile push. Gated by the account's settings.
    Push,
}

/// A way of getting a persisted notification in front of its account.
#[async_trait]
pub trait DeliveryChannel: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn kind(&self) -> ChannelKind;
    async fn deliver(&self, notification: &Notification) -> Result<(), Error>;
}

/// Push stand-in that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), Error> {
        info!(
            account = %notification.account,
            category = %notification.category,
            title = %notification.title,
            "push notification"
        );
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers (websocket sessions
/// and the like). Subscribers filter by account themselves.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl DeliveryChannel for BroadcastChannel {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), Error> {
        // No subscribers is not a failure.
        if self.sender.send(notification.clone()).is_err() {
            debug!(account = %notification.account, "no realtime subscribers");
        }
        Ok(())
    }
}

/// Runs every channel for a notification on its own task, bounded by a
/// timeout. Failures are logged and dropped.
#[derive(Clone)]
pub struct Dispatcher {
    channels: Vec<Arc<dyn DeliveryChannel>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn DeliveryChannel>>, timeout: Duration) -> Self {
        Self { channels, timeout }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    pub fn dispatch(&self, notification: &Notification, settings: &NotificationSettings) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(notification = %notification.id, "no async runtime, delivery skipped");
            return;
        };

        for channel in &self.channels {
            if channel.kind() == ChannelKind::Push && !settings.allows_push(notification.category)
            {
                debug!(
                    account = %notification.account,
                    channel = channel.name(),
                    category = %notification.category,
                    "push suppressed by settings"
                );
                continue;
            }

            let channel = Arc::clone(channel);
            let notification = notification.clone();
            let timeout = self.timeout;

            runtime.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, channel.deliver(&notification))
                    .await
                {
                    Ok(Ok(())) => "delivered",
                    Ok(Err(err)) => {
                        warn!(
                            notification = %notification.id,
                            channel = channel.name(),
                            error = %err,
                            "notification delivery failed"
                        );
                        "failed"
                    }
                    Err(_) => {
                        warn!(
                            notification = %notification.id,
                            channel = channel.name(),
                            timeout_ms = timeout.as_millis() as u64,
                            "notification delivery timed out"
                        );
                        "timeout"
                    }
                };
                counter!("parley.notifications.delivery",
                    "channel" => channel.name(),
                    "outcome" => outcome
                )
                .increment(1);
            });
        }
    }
}
