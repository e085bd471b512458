use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TxPipelineError};
use crate::monitor::ResubmitPolicy;

pub mod env_vars {
    pub const RETENTION_LIMIT: &str = "TXPIPE_RETENTION_LIMIT";
    pub const CHAIN_ID: &str = "TXPIPE_CHAIN_ID";
    pub const DEFAULT_GAS_LIMIT: &str = "TXPIPE_DEFAULT_GAS_LIMIT";
    pub const EVENT_CAPACITY: &str = "TXPIPE_EVENT_CAPACITY";
    pub const RESUBMIT_ENABLED: &str = "TXPIPE_RESUBMIT_ENABLED";
    pub const RESUBMIT_MIN_AGE_SECS: &str = "TXPIPE_RESUBMIT_MIN_AGE_SECS";
    pub const RESUBMIT_MAX_BLOCK_DISTANCE: &str = "TXPIPE_RESUBMIT_MAX_BLOCK_DISTANCE";
    pub const DROPPED_CHECK_COUNT: &str = "TXPIPE_DROPPED_CHECK_COUNT";
    pub const POLL_INTERVAL_SECS: &str = "TXPIPE_POLL_INTERVAL_SECS";
    pub const SYNC_INTERVAL_SECS: &str = "TXPIPE_SYNC_INTERVAL_SECS";
    pub const RPC_URL: &str = "TXPIPE_RPC_URL";
    pub const PRIVATE_KEY: &str = "TXPIPE_PRIVATE_KEY";
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records kept before finalized ones are pruned
    pub retention_limit: usize,
    pub default_chain_id: u64,
    pub default_gas_limit: u64,
    pub event_channel_capacity: usize,
    pub resubmit: ResubmitPolicy,
    /// Consecutive sync checks a nonce must look consumed before the record is dropped
    pub dropped_check_count: u32,
    pub poll_interval: Duration,
    pub sync_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retention_limit: 100,
            default_chain_id: 1,
            default_gas_limit: 21_000,
            event_channel_capacity: 1000,
            resubmit: ResubmitPolicy::default(),
            dropped_check_count: 3,
            poll_interval: Duration::from_secs(4),
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let resubmit = ResubmitPolicy {
            enabled: parse_or(&lookup, env_vars::RESUBMIT_ENABLED, defaults.resubmit.enabled)?,
            min_age: Duration::from_secs(parse_or(
                &lookup,
                env_vars::RESUBMIT_MIN_AGE_SECS,
                defaults.resubmit.min_age.as_secs(),
            )?),
            max_block_distance: parse_or(
                &lookup,
                env_vars::RESUBMIT_MAX_BLOCK_DISTANCE,
                defaults.resubmit.max_block_distance,
            )?,
        };

        let config = Self {
            retention_limit: parse_or(&lookup, env_vars::RETENTION_LIMIT, defaults.retention_limit)?,
            default_chain_id: parse_or(&lookup, env_vars::CHAIN_ID, defaults.default_chain_id)?,
            default_gas_limit: parse_or(&lookup, env_vars::DEFAULT_GAS_LIMIT, defaults.default_gas_limit)?,
            event_channel_capacity: parse_or(
                &lookup,
                env_vars::EVENT_CAPACITY,
                defaults.event_channel_capacity,
            )?,
            resubmit,
            dropped_check_count: parse_or(
                &lookup,
                env_vars::DROPPED_CHECK_COUNT,
                defaults.dropped_check_count,
            )?,
            poll_interval: Duration::from_secs(parse_or(
                &lookup,
                env_vars::POLL_INTERVAL_SECS,
                defaults.poll_interval.as_secs(),
            )?),
            sync_interval: Duration::from_secs(parse_or(
                &lookup,
                env_vars::SYNC_INTERVAL_SECS,
                defaults.sync_interval.as_secs(),
            )?),
        };

        if config.retention_limit == 0 {
            return Err(TxPipelineError::Config(format!(
                "{} must be greater than zero",
                env_vars::RETENTION_LIMIT
            )));
        }
        if config.default_chain_id == 0 {
            return Err(TxPipelineError::Config(format!(
                "{} must be greater than zero",
                env_vars::CHAIN_ID
            )));
        }

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| TxPipelineError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = PipelineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.retention_limit, 100);
        assert_eq!(config.default_gas_limit, 21_000);
        assert_eq!(config.resubmit.max_block_distance, 50);
        assert_eq!(config.dropped_check_count, 3);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            (env_vars::RETENTION_LIMIT, "10"),
            (env_vars::CHAIN_ID, "8453"),
            (env_vars::RESUBMIT_ENABLED, "false"),
            (env_vars::SYNC_INTERVAL_SECS, "5"),
        ]))
        .unwrap();
        assert_eq!(config.retention_limit, 10);
        assert_eq!(config.default_chain_id, 8453);
        assert!(!config.resubmit.enabled);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[(env_vars::RETENTION_LIMIT, "lots")]))
            .unwrap_err();
        assert!(matches!(err, TxPipelineError::Config(_)));
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        assert!(PipelineConfig::from_lookup(lookup_from(&[(env_vars::RETENTION_LIMIT, "0")])).is_err());
    }
}
