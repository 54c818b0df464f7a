//! Shuffle configuration.
//!
//! The configuration is resolved once when the process starts and is then
//! shared read-only (usually behind an `Arc`) with the tracker, the split
//! servers and every reducer's scheduler.

use crate::error::{Result, ShuffleError};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the tracked shuffle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ShuffleConfig {
    /// Address the tracker binds to and reducers/mappers contact
    pub master_host_address: String,
    /// Tracker port
    pub master_tracker_port: u16,
    /// Block size in KiB
    pub block_size: usize,
    /// Backoff floor between probes of a busy peer, in milliseconds
    pub min_knock_interval: u64,
    /// Backoff ceiling between probes of a busy peer, in milliseconds
    pub max_knock_interval: u64,
    /// Concurrent pulls allowed per reducer
    pub max_rx_connections: usize,
    /// Concurrent serves allowed per mapper
    pub max_tx_connections: usize,
    /// Longest a single chat session may run, in milliseconds
    pub max_chat_time: u64,
    /// Most blocks a single chat session may deliver
    pub max_chat_blocks: usize,
    /// A reducer faster than this multiple of the slowest one throttles itself
    pub throttle_fraction: f64,
    /// Deadline for completing one split, in milliseconds
    pub max_fetch_time: u64,
    /// Directory for file-backed block storage; blocks stay in memory when unset
    pub shuffle_dir: Option<PathBuf>,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            master_host_address: "127.0.0.1".to_string(),
            master_tracker_port: 22222,
            block_size: 1024,
            min_knock_interval: 1000,
            max_knock_interval: 5000,
            max_rx_connections: 4,
            max_tx_connections: 8,
            max_chat_time: 250,
            max_chat_blocks: 1024,
            throttle_fraction: 2.0,
            max_fetch_time: 600_000,
            shuffle_dir: None,
        }
    }
}

impl ShuffleConfig {
    /// Load a configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShuffleError::configuration_error_with_source(
                format!("cannot read {}", path.display()),
                e,
            )
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| {
            ShuffleError::configuration_error_with_source("malformed shuffle configuration", e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(ShuffleError::configuration_error("blockSize must be positive"));
        }
        if self.min_knock_interval > self.max_knock_interval {
            return Err(ShuffleError::configuration_error(format!(
                "minKnockInterval ({}) exceeds maxKnockInterval ({})",
                self.min_knock_interval, self.max_knock_interval
            )));
        }
        if self.max_rx_connections == 0 || self.max_tx_connections == 0 {
            return Err(ShuffleError::configuration_error(
                "maxRxConnections and maxTxConnections must be positive",
            ));
        }
        if self.max_chat_blocks == 0 || self.max_chat_time == 0 {
            return Err(ShuffleError::configuration_error(
                "maxChatBlocks and maxChatTime must be positive",
            ));
        }
        if !self.throttle_fraction.is_finite() || self.throttle_fraction < 1.0 {
            return Err(ShuffleError::configuration_error(format!(
                "throttleFraction must be a finite value >= 1.0, got {}",
                self.throttle_fraction
            )));
        }
        Ok(())
    }

    /// Socket address of the tracker.
    pub fn tracker_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.master_host_address, self.master_tracker_port)
            .parse()
            .map_err(|e| {
                ShuffleError::configuration_error_with_source(
                    format!(
                        "invalid tracker address {}:{}",
                        self.master_host_address, self.master_tracker_port
                    ),
                    e,
                )
            })
    }

    pub fn block_size_bytes(&self) -> usize {
        self.block_size * 1024
    }

    pub fn min_knock(&self) -> Duration {
        Duration::from_millis(self.min_knock_interval)
    }

    pub fn max_knock(&self) -> Duration {
        Duration::from_millis(self.max_knock_interval)
    }

    pub fn chat_time(&self) -> Duration {
        Duration::from_millis(self.max_chat_time)
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.max_fetch_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ShuffleConfig::default();
        assert_eq!(config.master_tracker_port, 22222);
        assert_eq!(config.block_size_bytes(), 1024 * 1024);
        assert_eq!(config.min_knock(), Duration::from_millis(1000));
        assert_eq!(config.max_knock(), Duration::from_millis(5000));
        assert_eq!(config.max_rx_connections, 4);
        assert_eq!(config.max_tx_connections, 8);
        assert_eq!(config.chat_time(), Duration::from_millis(250));
        assert_eq!(config.max_chat_blocks, 1024);
        assert_eq!(config.throttle_fraction, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ShuffleConfig::from_json_str(r#"{"masterTrackerPort": 9000, "maxChatBlocks": 16}"#)
                .unwrap();
        assert_eq!(config.master_tracker_port, 9000);
        assert_eq!(config.max_chat_blocks, 16);
        assert_eq!(config.max_rx_connections, 4);
        assert_eq!(config.tracker_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = ShuffleConfig::from_json_str(
            r#"{"minKnockInterval": 6000, "maxKnockInterval": 5000}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ShuffleError::ConfigurationError { .. }));

        assert!(ShuffleConfig::from_json_str(r#"{"throttleFraction": 0.5}"#).is_err());
        assert!(ShuffleConfig::from_json_str(r#"{"unknownKey": 1}"#).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"masterHostAddress": "10.0.0.5", "blockSize": 64}}"#).unwrap();

        let config = ShuffleConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.master_host_address, "10.0.0.5");
        assert_eq!(config.block_size_bytes(), 64 * 1024);
    }
}
