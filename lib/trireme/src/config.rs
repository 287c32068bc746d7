// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Loading and validating a [`DatapathConfig`].

use crate::api::DatapathConfig;
use crate::engine::tracker::Ttl;
use core::fmt;
use core::fmt::Display;
use core::num::NonZeroU32;
use core::time::Duration;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "failed to read config: {msg}"),
            Self::Parse(msg) => write!(f, "failed to parse config: {msg}"),
            Self::Invalid(what) => write!(f, "invalid config: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse a config from TOML. Missing fields take their defaults.
pub fn from_toml_str(s: &str) -> Result<DatapathConfig, ConfigError> {
    let cfg: DatapathConfig =
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn load(path: &Path) -> Result<DatapathConfig, ConfigError> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    from_toml_str(&s)
}

pub fn to_toml_string(cfg: &DatapathConfig) -> Result<String, ConfigError> {
    toml::to_string(cfg).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub fn validate(cfg: &DatapathConfig) -> Result<(), ConfigError> {
    if cfg.tcp_connection_timeout_secs == 0
        || cfg.udp_connection_timeout_secs == 0
    {
        return Err(ConfigError::Invalid("connection timeout must be non-zero"));
    }

    if cfg.max_connections == 0 {
        return Err(ConfigError::Invalid("max_connections must be non-zero"));
    }

    if cfg.tracker_shards == 0 {
        return Err(ConfigError::Invalid("tracker_shards must be non-zero"));
    }

    if cfg.udp_queue_len == 0 {
        return Err(ConfigError::Invalid("udp_queue_len must be non-zero"));
    }

    if cfg.token_validity_secs == 0 {
        return Err(ConfigError::Invalid("token_validity_secs must be non-zero"));
    }

    if cfg.expiry_interval_ms == 0 || cfg.udp_retransmit_interval_ms == 0 {
        return Err(ConfigError::Invalid("intervals must be non-zero"));
    }

    let mut seen = BTreeSet::new();
    for q in cfg.application_queues.iter().chain(cfg.network_queues.iter()) {
        if !seen.insert(*q) {
            return Err(ConfigError::Invalid(
                "a queue number is used more than once",
            ));
        }
    }

    Ok(())
}

/// Typed accessors over the raw config values.
pub trait DatapathConfigExt {
    fn tcp_ttl(&self) -> Ttl;
    fn udp_ttl(&self) -> Ttl;
    fn tracker_limit(&self) -> NonZeroU32;
    fn retransmit_interval(&self) -> Duration;
    fn expiry_interval(&self) -> Duration;
    fn validate(&self) -> Result<(), ConfigError>;
}

impl DatapathConfigExt for DatapathConfig {
    fn tcp_ttl(&self) -> Ttl {
        Ttl::new_seconds(self.tcp_connection_timeout_secs)
    }

    fn udp_ttl(&self) -> Ttl {
        Ttl::new_seconds(self.udp_connection_timeout_secs)
    }

    fn tracker_limit(&self) -> NonZeroU32 {
        NonZeroU32::new(self.max_connections).unwrap_or(NonZeroU32::MIN)
    }

    fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.udp_retransmit_interval_ms)
    }

    fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::CompressionType;

    #[test]
    fn empty_toml_is_default() {
        let cfg = from_toml_str("").unwrap();
        assert_eq!(cfg, DatapathConfig::default());
        assert!(cfg.mutual_authorization);
        assert_eq!(cfg.udp_queue_len, 50);
        assert_eq!(cfg.tcp_ttl().as_seconds(), 24);
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg = from_toml_str(
            r#"
            mutual_authorization = false
            compression = "v2"
            network_queues = [10, 11]
            "#,
        )
        .unwrap();
        assert!(!cfg.mutual_authorization);
        assert_eq!(cfg.compression, CompressionType::V2);
        assert_eq!(cfg.network_queues, vec![10, 11]);
        assert_eq!(cfg.application_queues, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            from_toml_str("tracker_shards = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_toml_str("application_queues = [4]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_toml_str("udp_queue_len = \"many\""),
            Err(ConfigError::Parse(_))
        ));

        let cfg = DatapathConfig { max_connections: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        assert!(DatapathConfig::default().validate().is_ok());
    }

    #[test]
    fn round_trip_through_toml() {
        let mut cfg = DatapathConfig::default();
        cfg.encryption = true;
        let s = to_toml_string(&cfg).unwrap();
        assert_eq!(from_toml_str(&s).unwrap(), cfg);
    }
}
