//! Engine configuration: the value the controller consumes, never produces
//!
//! Parsing this from a config file or CLI flags is explicitly out of scope;
//! this module only defines the shape and validates it (the one error family
//! allowed to abort a run, per the error handling design).

use crate::error::ConfigError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Named timing bands, mapping to `(max_in_flight_names, inter_release_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingBand {
    Paranoid,
    Sneaky,
    Polite,
    Normal,
    Aggressive,
    Insane,
}

impl Default for TimingBand {
    fn default() -> Self {
        TimingBand::Normal
    }
}

impl TimingBand {
    /// `(max in-flight names, delay between slot releases)`.
    pub fn params(self) -> (usize, Duration) {
        match self {
            TimingBand::Paranoid => (10, Duration::from_millis(100)),
            TimingBand::Sneaky => (30, Duration::from_millis(33)),
            TimingBand::Polite => (100, Duration::from_millis(10)),
            TimingBand::Normal => (333, Duration::from_millis(3)),
            TimingBand::Aggressive => (1000, Duration::from_millis(1)),
            TimingBand::Insane => (10_000, Duration::from_micros(100)),
        }
    }
}

/// Per-source credential bundle, keyed by source name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub key: Option<String>,
    pub secret: Option<String>,
}

/// The validated configuration handed to [`crate::controller::EnumerationController`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub uuid: uuid::Uuid,
    pub domains: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub asns: Vec<u32>,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_resolvers")]
    pub resolvers: Vec<String>,
    #[serde(default = "default_max_dns_queries")]
    pub max_dns_queries: usize,
    #[serde(default)]
    pub brute_forcing: bool,
    #[serde(default)]
    pub recursive_brute_forcing: bool,
    #[serde(default = "default_minimum_for_recursive")]
    pub minimum_for_recursive: usize,
    #[serde(default)]
    pub alterations: bool,
    #[serde(default)]
    pub flip_words: bool,
    #[serde(default)]
    pub flip_numbers: bool,
    #[serde(default)]
    pub add_words: bool,
    #[serde(default)]
    pub add_numbers: bool,
    #[serde(default)]
    pub edit_distance: usize,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub include_unresolvable: bool,
    #[serde(default)]
    pub timing_band: TimingBand,
    #[serde(default)]
    pub disabled_sources: Vec<String>,
    #[serde(default)]
    pub api_keys: HashMap<String, ApiCredentials>,
    /// Whether any enabled source is a "data-ops writer" (mutates external
    /// state rather than only reading it). Passive mode forbids these.
    #[serde(default)]
    pub has_data_ops_writer_source: bool,
}

fn default_ports() -> Vec<u16> {
    vec![443]
}

fn default_max_dns_queries() -> usize {
    1000
}

fn default_minimum_for_recursive() -> usize {
    3
}

/// Nine well-known public resolvers used when the caller configures none.
pub fn default_resolvers() -> Vec<String> {
    vec![
        "8.8.8.8:53".to_string(),
        "8.8.4.4:53".to_string(),
        "1.1.1.1:53".to_string(),
        "1.0.0.1:53".to_string(),
        "9.9.9.9:53".to_string(),
        "149.112.112.112:53".to_string(),
        "208.67.222.222:53".to_string(),
        "208.67.220.220:53".to_string(),
        "64.6.64.6:53".to_string(),
    ]
}

impl EngineConfig {
    /// Checks the config-level invariants that are allowed to abort startup.
    /// Does not check the post-sanity-check empty-pool condition; that is
    /// raised by the resolver pool itself once candidates have been tested.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }
        if self.passive && self.brute_forcing {
            return Err(ConfigError::PassiveWithBruteForce);
        }
        if self.passive && self.active {
            return Err(ConfigError::PassiveWithActive);
        }
        if self.passive && self.has_data_ops_writer_source {
            return Err(ConfigError::PassiveWithDataOpsWriter);
        }
        for cidr in &self.cidrs {
            let _ = cidr; // parsed at the type level; presence is the check
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig {
            uuid: uuid::Uuid::new_v4(),
            domains: vec!["example.com".to_string()],
            blacklist: vec![],
            addresses: vec![],
            cidrs: vec![],
            asns: vec![],
            ports: default_ports(),
            resolvers: default_resolvers(),
            max_dns_queries: default_max_dns_queries(),
            brute_forcing: false,
            recursive_brute_forcing: false,
            minimum_for_recursive: default_minimum_for_recursive(),
            alterations: false,
            flip_words: false,
            flip_numbers: false,
            add_words: false,
            add_numbers: false,
            edit_distance: 0,
            passive: false,
            active: false,
            include_unresolvable: false,
            timing_band: TimingBand::Normal,
            disabled_sources: vec![],
            api_keys: HashMap::new(),
            has_data_ops_writer_source: false,
        }
    }

    #[test]
    fn rejects_empty_domains() {
        let mut cfg = base();
        cfg.domains.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoDomains)));
    }

    #[test]
    fn rejects_passive_with_brute_force() {
        let mut cfg = base();
        cfg.passive = true;
        cfg.brute_forcing = true;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PassiveWithBruteForce)
        ));
    }

    #[test]
    fn rejects_passive_with_active() {
        let mut cfg = base();
        cfg.passive = true;
        cfg.active = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::PassiveWithActive)));
    }

    #[test]
    fn timing_bands_match_spec_table() {
        assert_eq!(
            TimingBand::Normal.params(),
            (333, Duration::from_millis(3))
        );
        assert_eq!(
            TimingBand::Insane.params(),
            (10_000, Duration::from_micros(100))
        );
    }

    #[test]
    fn passive_alone_is_valid() {
        let mut cfg = base();
        cfg.passive = true;
        assert!(cfg.validate().is_ok());
    }
}
