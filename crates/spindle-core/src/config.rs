//! Queue and consumer configuration.
//!
//! `QueueOptions` is resolved once per queue and frozen inside the
//! `MessageStore`; changing it after the first claim is not supported.
//! `ConsumerConfig` tunes one worker pool.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ports::AdapterKind;
use crate::queue::RetryPolicy;

/// Schema extension column, passed through to the adapter untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalColumn {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
}

/// Feature flags of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueueOptions {
    pub enable_delayed_processing: bool,
    pub enable_heart_beat: bool,
    pub enable_status: bool,
    pub enable_status_table: bool,
    pub enable_message_expiration: bool,
    pub enable_priority: bool,
    pub enable_hold_transaction_until_message_committed: bool,
    pub additional_columns: Vec<AdditionalColumn>,
}

impl QueueOptions {
    /// Delay, heartbeat, status and expiration on; the usual consumer setup.
    pub fn standard() -> Self {
        Self {
            enable_delayed_processing: true,
            enable_heart_beat: true,
            enable_status: true,
            enable_message_expiration: true,
            ..Self::default()
        }
    }

    pub fn with_delayed_processing(mut self, on: bool) -> Self {
        self.enable_delayed_processing = on;
        self
    }

    pub fn with_heart_beat(mut self, on: bool) -> Self {
        self.enable_heart_beat = on;
        self
    }

    pub fn with_status(mut self, on: bool) -> Self {
        self.enable_status = on;
        self
    }

    pub fn with_status_table(mut self, on: bool) -> Self {
        self.enable_status_table = on;
        self
    }

    pub fn with_message_expiration(mut self, on: bool) -> Self {
        self.enable_message_expiration = on;
        self
    }

    pub fn with_priority(mut self, on: bool) -> Self {
        self.enable_priority = on;
        self
    }

    pub fn with_hold_transaction(mut self, on: bool) -> Self {
        self.enable_hold_transaction_until_message_committed = on;
        self
    }

    pub fn with_additional_column(mut self, column: AdditionalColumn) -> Self {
        self.additional_columns.push(column);
        self
    }

    /// Check flag combinations against the adapter that will host the queue.
    pub fn validate(&self, adapter: AdapterKind) -> Result<(), ConfigError> {
        if self.enable_status_table && !self.enable_status {
            return Err(ConfigError::StatusTableRequiresStatus);
        }
        if self.enable_hold_transaction_until_message_committed {
            if self.enable_heart_beat {
                return Err(ConfigError::HoldTransactionWithHeartbeat);
            }
            if !adapter.supports_held_transactions() {
                return Err(ConfigError::HoldTransactionUnsupported(adapter));
            }
        }
        let mut seen = HashSet::new();
        for column in &self.additional_columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ConfigError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(())
    }
}

/// Queue names end up in table and key names, so keep them boring.
pub fn validate_queue_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::EmptyQueueName);
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(ConfigError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub lease_duration: Duration,
    /// Must be at most `lease_duration / 3`.
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub expiration_sweep_interval: Duration,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15),
            expiration_sweep_interval: Duration::from_secs(60),
            idle_backoff_min: Duration::from_millis(10),
            idle_backoff_max: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the lease and derives the heartbeat interval (a third of it).
    pub fn with_lease(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.heartbeat_interval = lease_duration / 3;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_expiration_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiration_sweep_interval = interval;
        self
    }

    pub fn with_idle_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.idle_backoff_min = min;
        self.idle_backoff_max = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::ZeroLeaseDuration);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("heartbeat interval"));
        }
        if self.heartbeat_interval > self.lease_duration / 3 {
            return Err(ConfigError::HeartbeatTooSlow {
                interval: self.heartbeat_interval,
                lease: self.lease_duration,
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sweep interval"));
        }
        if self.expiration_sweep_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("expiration sweep interval"));
        }
        if self.idle_backoff_min.is_zero() {
            return Err(ConfigError::ZeroInterval("idle backoff minimum"));
        }
        if self.idle_backoff_min > self.idle_backoff_max {
            return Err(ConfigError::InvalidIdleBackoff {
                min: self.idle_backoff_min,
                max: self.idle_backoff_max,
            });
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_consumer_config_is_valid() {
        assert!(ConsumerConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::no_workers(ConsumerConfig::default().with_workers(0), ConfigError::NoWorkers)]
    #[case::zero_lease(ConsumerConfig::default().with_lease(Duration::ZERO), ConfigError::ZeroLeaseDuration)]
    #[case::slow_heartbeat(
        ConsumerConfig::default()
            .with_lease(Duration::from_secs(30))
            .with_heartbeat_interval(Duration::from_secs(11)),
        ConfigError::HeartbeatTooSlow { interval: Duration::from_secs(11), lease: Duration::from_secs(30) }
    )]
    #[case::inverted_backoff(
        ConsumerConfig::default().with_idle_backoff(Duration::from_secs(2), Duration::from_secs(1)),
        ConfigError::InvalidIdleBackoff { min: Duration::from_secs(2), max: Duration::from_secs(1) }
    )]
    #[case::zero_idle_backoff(
        ConsumerConfig::default().with_idle_backoff(Duration::ZERO, Duration::from_millis(10)),
        ConfigError::ZeroInterval("idle backoff minimum")
    )]
    fn invalid_consumer_configs(#[case] config: ConsumerConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate().unwrap_err(), expected);
    }

    #[test]
    fn with_lease_derives_a_third() {
        let config = ConsumerConfig::default().with_lease(Duration::from_secs(9));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::status_table_without_status(
        QueueOptions::default().with_status_table(true),
        AdapterKind::InMemory,
        ConfigError::StatusTableRequiresStatus
    )]
    #[case::hold_with_heartbeat(
        QueueOptions::default().with_hold_transaction(true).with_heart_beat(true),
        AdapterKind::RelationalTransactional,
        ConfigError::HoldTransactionWithHeartbeat
    )]
    #[case::hold_on_scripted(
        QueueOptions::default().with_hold_transaction(true),
        AdapterKind::ScriptedAtomic,
        ConfigError::HoldTransactionUnsupported(AdapterKind::ScriptedAtomic)
    )]
    fn invalid_queue_options(
        #[case] options: QueueOptions,
        #[case] adapter: AdapterKind,
        #[case] expected: ConfigError,
    ) {
        assert_eq!(options.validate(adapter).unwrap_err(), expected);
    }

    #[test]
    fn duplicate_additional_columns_are_rejected() {
        let column = AdditionalColumn {
            name: "tenant".into(),
            sql_type: "varchar(64)".into(),
            nullable: true,
        };
        let options = QueueOptions::standard()
            .with_additional_column(column.clone())
            .with_additional_column(column);
        assert_eq!(
            options.validate(AdapterKind::InMemory).unwrap_err(),
            ConfigError::DuplicateColumn("tenant".into())
        );
    }

    #[test]
    fn options_deserialize_from_pascal_case() {
        let json = r#"{"EnableHeartBeat": true, "EnablePriority": true}"#;
        let options: QueueOptions = serde_json::from_str(json).unwrap();
        assert!(options.enable_heart_beat);
        assert!(options.enable_priority);
        assert!(!options.enable_status);
    }

    #[rstest]
    #[case("orders", true)]
    #[case("orders.v2-eu_1", true)]
    #[case("", false)]
    #[case("drop table;", false)]
    fn queue_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_queue_name(name).is_ok(), ok);
    }
}
