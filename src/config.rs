/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Daemon configuration.
//!
//! [`Config`] is read from TOML with one table per subsystem. Every field has a default, so an
//! empty document is a valid configuration. Durations are written in milliseconds under keys
//! ending in `_ms`:
//!
//! ```toml
//! log_level = "debug"
//!
//! [p2p]
//! port = 9097
//! seed_peers = ["10.0.0.1:9097"]
//! dial_timeout_ms = 10000
//!
//! [timebank]
//! full_updates_per_period = 2
//! ```

use std::{fs, io, net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::networking::{peer::PeerConfig, DEFAULT_PORT, NETWORK_MAGIC, USER_AGENT};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Print every [event](crate::events) as a CSV log line.
    pub log_events: bool,
    pub p2p: P2PConfig,
    pub timebank: TimebankConfig,
    pub update_queue: UpdateQueueConfig,
    pub updater: UpdaterConfig,
    pub sector_server: SectorServerConfig,
    pub peer_exchanger: PeerExchangerConfig,
    pub name_importer: NameImporterConfig,
    pub name_syncer: NameSyncerConfig,
    pub heartbeat: HeartbeatConfig,
    pub rpc: RpcConfig,
    pub hns_resolver: HnsResolverConfig,
    pub ban_lists: BanListsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".into(),
            log_events: false,
            p2p: P2PConfig::default(),
            timebank: TimebankConfig::default(),
            update_queue: UpdateQueueConfig::default(),
            updater: UpdaterConfig::default(),
            sector_server: SectorServerConfig::default(),
            peer_exchanger: PeerExchangerConfig::default(),
            name_importer: NameImporterConfig::default(),
            name_syncer: NameSyncerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rpc: RpcConfig::default(),
            hns_resolver: HnsResolverConfig::default(),
            ban_lists: BanListsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("config always serializes to TOML")
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        if self.updater.workers == 0 {
            return Err(ConfigError::Invalid("updater.workers must be at least 1".into()));
        }
        if self.name_syncer.workers == 0 {
            return Err(ConfigError::Invalid(
                "name_syncer.workers must be at least 1".into(),
            ));
        }
        if self.timebank.full_updates_per_period == 0 {
            return Err(ConfigError::Invalid(
                "timebank.full_updates_per_period must be at least 1".into(),
            ));
        }
        if self.timebank.seconds_per_sector() == 0 {
            return Err(ConfigError::Invalid(
                "timebank.timebank_duration_ms is too short for the configured update rate".into(),
            ));
        }
        for seed in &self.p2p.seed_peers {
            if seed.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::Invalid(format!("seed peer {:?} is not ip:port", seed)));
            }
        }
        Ok(())
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    pub host: String,
    pub port: u16,
    pub magic: u32,
    pub user_agent: String,
    /// Peers to dial when the peer table cannot fill the outbound slots, as `ip:port`.
    pub seed_peers: Vec<String>,
    pub max_inbound_peers: usize,
    pub max_outbound_peers: usize,
    pub max_pending_inbound: usize,
    pub max_pending_outbound: usize,
    #[serde(rename = "dial_timeout_ms", with = "serde_duration")]
    pub dial_timeout: Duration,
    #[serde(rename = "handshake_timeout_ms", with = "serde_duration")]
    pub handshake_timeout: Duration,
    #[serde(rename = "refill_interval_ms", with = "serde_duration")]
    pub refill_interval: Duration,
    pub refill_candidates: usize,
    #[serde(rename = "ping_interval_ms", with = "serde_duration")]
    pub ping_interval: Duration,
    #[serde(rename = "idle_timeout_ms", with = "serde_duration")]
    pub idle_timeout: Duration,
    #[serde(rename = "failed_dial_ban_ms", with = "serde_duration")]
    pub failed_dial_ban: Duration,
    #[serde(rename = "self_dial_ban_ms", with = "serde_duration")]
    pub self_dial_ban: Duration,
    pub messages_per_second: u32,
    pub message_burst: u32,
    pub send_buffer_len: usize,
    pub recv_buffer_len: usize,
    /// Treat loopback addresses as distinct hosts: skip the one-connection-per-ip rule, the
    /// self-ip check and ban enforcement for them. Only useful for local test networks.
    pub allow_local_peers: bool,
}

impl Default for P2PConfig {
    fn default() -> Self {
        P2PConfig {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            magic: NETWORK_MAGIC,
            user_agent: USER_AGENT.into(),
            seed_peers: Vec::new(),
            max_inbound_peers: 117,
            max_outbound_peers: 8,
            max_pending_inbound: 12,
            max_pending_outbound: 5,
            dial_timeout: 10 * SECOND,
            handshake_timeout: 10 * SECOND,
            refill_interval: 30 * SECOND,
            refill_candidates: 256,
            ping_interval: 15 * SECOND,
            idle_timeout: MINUTE,
            failed_dial_ban: HOUR,
            self_dial_ban: 365 * DAY,
            messages_per_second: 64,
            message_burst: 192,
            send_buffer_len: 256,
            recv_buffer_len: 256,
            allow_local_peers: false,
        }
    }
}

impl P2PConfig {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            send_buffer_len: self.send_buffer_len,
            recv_buffer_len: self.recv_buffer_len,
            idle_timeout: self.idle_timeout,
            messages_per_second: self.messages_per_second,
            message_burst: self.message_burst,
            ..PeerConfig::default()
        }
    }

    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        self.seed_peers
            .iter()
            .filter_map(|seed| seed.parse().ok())
            .collect()
    }
}

/// Parameters of the per-name write throttle. See [`crate::update::timebank`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimebankConfig {
    #[serde(rename = "timebank_duration_ms", with = "serde_duration")]
    pub timebank_duration: Duration,
    #[serde(rename = "min_update_interval_ms", with = "serde_duration")]
    pub min_update_interval: Duration,
    pub full_updates_per_period: u32,
}

impl Default for TimebankConfig {
    fn default() -> Self {
        TimebankConfig {
            timebank_duration: 48 * HOUR,
            min_update_interval: 2 * MINUTE,
            full_updates_per_period: 2,
        }
    }
}

impl TimebankConfig {
    pub fn sector_updates_per_period(&self) -> u64 {
        self.full_updates_per_period as u64 * crate::types::data_types::SECTOR_COUNT as u64
    }

    pub fn seconds_per_sector(&self) -> u64 {
        match self.sector_updates_per_period() {
            0 => 0,
            per_period => self.timebank_duration.as_secs() / per_period,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateQueueConfig {
    pub max_len: usize,
    /// Names that are never accepted, on top of imported ban lists.
    pub blacklist: Vec<String>,
}

impl Default for UpdateQueueConfig {
    fn default() -> Self {
        UpdateQueueConfig {
            max_len: 1000,
            blacklist: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub workers: usize,
    #[serde(rename = "poll_interval_ms", with = "serde_duration")]
    pub poll_interval: Duration,
    /// Time allowed for fetching a blob from one peer.
    #[serde(rename = "fetch_timeout_ms", with = "serde_duration")]
    pub fetch_timeout: Duration,
    pub max_fetch_peers: usize,
    /// Updates of names imported at least this many blocks ago are gossiped onward.
    pub gossip_import_height_diff: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            workers: 2,
            poll_interval: Duration::from_millis(100),
            fetch_timeout: 15 * SECOND,
            max_fetch_peers: 7,
            gossip_import_height_diff: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectorServerConfig {
    #[serde(rename = "cache_ttl_ms", with = "serde_duration")]
    pub cache_ttl: Duration,
}

impl Default for SectorServerConfig {
    fn default() -> Self {
        SectorServerConfig {
            cache_ttl: 5 * SECOND,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerExchangerConfig {
    #[serde(rename = "interval_ms", with = "serde_duration")]
    pub interval: Duration,
    pub max_peers: usize,
}

impl Default for PeerExchangerConfig {
    fn default() -> Self {
        PeerExchangerConfig {
            interval: MINUTE,
            max_peers: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameImporterConfig {
    /// Blocks a name registration must be buried under before it is imported.
    pub confirmation_depth: u32,
    #[serde(rename = "interval_ms", with = "serde_duration")]
    pub interval: Duration,
}

impl Default for NameImporterConfig {
    fn default() -> Self {
        NameImporterConfig {
            confirmation_depth: 10,
            interval: MINUTE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameSyncerConfig {
    #[serde(rename = "interval_ms", with = "serde_duration")]
    pub interval: Duration,
    pub workers: usize,
    pub sample_size: usize,
    #[serde(rename = "update_response_timeout_ms", with = "serde_duration")]
    pub update_response_timeout: Duration,
    #[serde(rename = "sync_response_timeout_ms", with = "serde_duration")]
    pub sync_response_timeout: Duration,
}

impl Default for NameSyncerConfig {
    fn default() -> Self {
        NameSyncerConfig {
            interval: HOUR,
            workers: 2,
            sample_size: 7,
            update_response_timeout: 5 * SECOND,
            sync_response_timeout: MINUTE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub url: String,
    pub moniker: String,
    #[serde(rename = "interval_ms", with = "serde_duration")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            url: String::new(),
            moniker: String::new(),
            interval: HOUR,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            host: "127.0.0.1".into(),
            port: 9098,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnsResolverConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub api_key: String,
}

impl Default for HnsResolverConfig {
    fn default() -> Self {
        HnsResolverConfig {
            host: "127.0.0.1".into(),
            port: 12037,
            base_path: String::new(),
            api_key: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanListsConfig {
    pub urls: Vec<String>,
    #[serde(rename = "interval_ms", with = "serde_duration")]
    pub interval: Duration,
}

impl Default for BanListsConfig {
    fn default() -> Self {
        BanListsConfig {
            urls: Vec::new(),
            interval: DAY,
        }
    }
}

/// (De)serialize a [`Duration`] as whole milliseconds.
pub mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
