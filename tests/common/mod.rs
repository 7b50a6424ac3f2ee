#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parley::{
    ConsultantProfile, ManualClock, MarketConfig, Marketplace, Session, SessionKind, Settlement,
    adapters::memory::MemoryAdapter, notify::DeliveryChannel,
};
use uuid::Uuid;

pub const GATEWAY_SECRET: &str = "whsec_test_gateway";

pub struct Harness {
    pub market: Marketplace,
    pub adapter: MemoryAdapter,
    pub clock: ManualClock,
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

pub fn config() -> MarketConfig {
    MarketConfig {
        gateway_secret: Some(GATEWAY_SECRET.to_string()),
        ..MarketConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(config(), Vec::new())
}

/// `RUST_LOG=parley=debug cargo test` shows the engine's logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(config: MarketConfig, channels: Vec<Arc<dyn DeliveryChannel>>) -> Harness {
    init_tracing();
    let adapter = MemoryAdapter::new();
    let clock = ManualClock::new(epoch());
    let market = Marketplace::builder(adapter.clone())
        .clock(clock.clone())
        .config(config)
        .channels(channels)
        .build()
        .unwrap();
    Harness {
        market,
        adapter,
        clock,
    }
}

impl Harness {
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Client wallet holding `balance`.
    pub async fn client(&self, balance: u64) -> Uuid {
        let id = Uuid::now_v7();
        self.market.register_account(id).await.unwrap();
        if balance > 0 {
            self.market.credit(id, balance, "seed").await.unwrap();
        }
        id
    }

    /// Available consultant with the given rates.
    pub async fn consultant(&self, chat_rate: u64, call_rate: u64) -> Uuid {
        let id = Uuid::now_v7();
        self.market
            .register_consultant(ConsultantProfile::new(id, "Asha", chat_rate, call_rate))
            .await
            .unwrap();
        self.market.set_availability(id, id, true).await.unwrap();
        id
    }

    /// A chat that ran `minutes` whole minutes and was ended by the client.
    pub async fn completed_chat(&self, client: Uuid, consultant: Uuid, minutes: i64) -> Settlement {
        let session: Session = self
            .market
            .start_session(client, consultant, SessionKind::Chat)
            .await
            .unwrap();
        self.advance(Duration::minutes(minutes));
        self.market.end_session(session.id, client).await.unwrap()
    }
}
