//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.endpoint.is_empty() {
        return Err(MigrateError::Config("source.endpoint is required".into()));
    }
    if config.source.api_limit == 0 {
        return Err(MigrateError::Config(
            "source.api_limit must be at least 1".into(),
        ));
    }

    // Target validation
    if config.target.scope.trim().is_empty() {
        return Err(MigrateError::Config("target.scope is required".into()));
    }

    // Migration config validation - only check if explicitly set
    let migration = &config.migration;
    if let (Some(from), Some(to)) = (migration.date_from, migration.date_to) {
        if from > to {
            return Err(MigrateError::Config(format!(
                "migration.date_from ({}) is after migration.date_to ({})",
                from, to
            )));
        }
    }
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(rate) = migration.estimated_records_per_day {
        if rate < 0.0 {
            return Err(MigrateError::Config(
                "migration.estimated_records_per_day cannot be negative".into(),
            ));
        }
    }
    if migration.audit_flush_interval == 0 {
        return Err(MigrateError::Config(
            "migration.audit_flush_interval must be at least 1".into(),
        ));
    }
    if !(0.0..=100.0).contains(&migration.max_prevalidation_failure_pct) {
        return Err(MigrateError::Config(
            "migration.max_prevalidation_failure_pct must be between 0 and 100".into(),
        ));
    }
    if migration.create_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.create_attempts must be at least 1".into(),
        ));
    }

    let chunking = &migration.chunking;
    if !(chunking.safety_margin > 0.0 && chunking.safety_margin <= 1.0) {
        return Err(MigrateError::Config(
            "migration.chunking.safety_margin must be in (0, 1]".into(),
        ));
    }
    if chunking.min_days < 1 || chunking.min_days > chunking.max_days {
        return Err(MigrateError::Config(
            "migration.chunking requires 1 <= min_days <= max_days".into(),
        ));
    }
    if chunking.initial_days < chunking.min_days || chunking.initial_days > chunking.max_days {
        return Err(MigrateError::Config(
            "migration.chunking.initial_days must be within [min_days, max_days]".into(),
        ));
    }

    // Resilience validation
    let rate = &config.resilience.rate_limit;
    if rate.max_tokens == 0 {
        return Err(MigrateError::Config(
            "resilience.rate_limit.max_tokens must be at least 1".into(),
        ));
    }
    if rate.refill_rate <= 0.0 || rate.refill_period_ms == 0 {
        return Err(MigrateError::Config(
            "resilience.rate_limit refill_rate and refill_period_ms must be positive".into(),
        ));
    }
    if rate.min_refill_rate <= 0.0 || rate.min_refill_rate > rate.max_refill_rate {
        return Err(MigrateError::Config(
            "resilience.rate_limit requires 0 < min_refill_rate <= max_refill_rate".into(),
        ));
    }

    let breaker = &config.resilience.circuit_breaker;
    if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
        return Err(MigrateError::Config(
            "resilience.circuit_breaker thresholds must be at least 1".into(),
        ));
    }
    if config.resilience.retry.max_attempts == 0 {
        return Err(MigrateError::Config(
            "resilience.retry.max_attempts must be at least 1".into(),
        ));
    }

    // Duplicate detection validation
    let duplicates = &config.duplicates;
    if !(0.0..=100.0).contains(&duplicates.fuzzy_threshold) {
        return Err(MigrateError::Config(
            "duplicates.fuzzy_threshold must be between 0 and 100".into(),
        ));
    }
    if duplicates.date_window_days < 0
        || duplicates.amount_tolerance_pct < 0.0
        || duplicates.temporal_window_secs < 0
    {
        return Err(MigrateError::Config(
            "duplicates windows cannot be negative".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AccountMapping, DuplicateConfig, MigrationConfig, ResilienceConfig, SourceConfig,
        TargetConfig,
    };
    use chrono::NaiveDate;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                endpoint: "https://api.example.test".to_string(),
                records_file: None,
                api_limit: 500,
                api_key: Some("key".to_string()),
            },
            target: TargetConfig {
                scope: "Acme".to_string(),
                store_path: None,
            },
            migration: MigrationConfig::default(),
            resilience: ResilienceConfig::default(),
            duplicates: DuplicateConfig::default(),
            accounts: AccountMapping::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_endpoint() {
        let mut config = valid_config();
        config.source.endpoint = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_blank_scope() {
        let mut config = valid_config();
        config.target.scope = "   ".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_inverted_date_range() {
        let mut config = valid_config();
        config.migration.date_from = NaiveDate::from_ymd_opt(2024, 5, 1);
        config.migration.date_to = NaiveDate::from_ymd_opt(2024, 4, 1);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("after"));
    }

    #[test]
    fn test_zero_workers() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_safety_margin_out_of_range() {
        let mut config = valid_config();
        config.migration.chunking.safety_margin = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_initial_chunk_outside_bounds() {
        let mut config = valid_config();
        config.migration.chunking.initial_days = 45;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rate_limit_floor_above_ceiling() {
        let mut config = valid_config();
        config.resilience.rate_limit.min_refill_rate = 100.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_failure_threshold() {
        let mut config = valid_config();
        config.resilience.circuit_breaker.failure_threshold = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_fuzzy_threshold_out_of_range() {
        let mut config = valid_config();
        config.duplicates.fuzzy_threshold = 120.0;
        assert!(validate(&config).is_err());
    }
}
