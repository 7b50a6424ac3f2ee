mod adapter;

mod test_config {
    use parley::{MarketConfig, SettlementPolicy};

    #[test]
    fn test_defaults_validate() {
        let config = MarketConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.settlement_policy, SettlementPolicy::Reject);
        assert_eq!(config.min_balance_minutes, 5);
    }

    #[test]
    fn test_toml_overrides() {
        let config = MarketConfig::from_toml_str(
            r#"
            settlement_policy = "waive_charge"
            ring_timeout_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.settlement_policy, SettlementPolicy::WaiveCharge);
        assert_eq!(config.ring_timeout_secs, 45);
        assert_eq!(config.max_page_limit, 100);
    }

    #[test]
    fn test_zero_floor_is_rejected() {
        assert!(MarketConfig::from_toml_str("min_balance_minutes = 0").is_err());
    }
}
