#[cfg(test)]
use chrono::{DateTime, TimeZone, Utc};
#[cfg(test)]
use parley::{ConsultantProfile, ManualClock, MarketConfig, Marketplace};
#[cfg(test)]
use uuid::Uuid;

pub mod test_postgres;

#[cfg(test)]
pub(crate) const GATEWAY_SECRET: &str = "whsec_suite";

#[cfg(test)]
pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 18, 30, 0).unwrap()
}

#[cfg(test)]
pub(crate) fn suite_config() -> MarketConfig {
    MarketConfig {
        gateway_secret: Some(GATEWAY_SECRET.to_string()),
        ..MarketConfig::default()
    }
}

/// Funded client wallet.
#[cfg(test)]
pub(crate) async fn client(market: &Marketplace, balance: u64) -> Uuid {
    let id = Uuid::now_v7();
    market.register_account(id).await.unwrap();
    if balance > 0 {
        market.credit(id, balance, "seed").await.unwrap();
    }
    id
}

/// Consultant who is online with the given rates.
#[cfg(test)]
pub(crate) async fn consultant(market: &Marketplace, chat_rate: u64, call_rate: u64) -> Uuid {
    let id = Uuid::now_v7();
    market
        .register_consultant(ConsultantProfile::new(id, "Meera", chat_rate, call_rate))
        .await
        .unwrap();
    market.set_availability(id, id, true).await.unwrap();
    id
}

#[cfg(test)]
pub(crate) fn manual_clock() -> ManualClock {
    ManualClock::new(epoch())
}
