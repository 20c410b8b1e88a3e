//! Configuration types for sprinkler-node.
//! Parsed from ~/.sprinkler/config.toml.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use sprinkler_dissemination::EngineConfig;
use sprinkler_protocol::codec::DATA_OVERHEAD;
use sprinkler_protocol::CURRENT_PROFILE;
use sprinkler_trickle::TrickleConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub dissemination: DisseminationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_name")]
    pub name: String,
    /// Where `receive` writes completed files.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Bound on datagrams waiting for the decision loop.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            output_dir: default_output_dir(),
            inbound_queue: default_inbound_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Multicast group, IPv4 or IPv6.
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// IPv4: local interface address. IPv6: interface index. Unset means any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Local bind address. Defaults to the unspecified address of the
    /// group's family on `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default = "default_max_datagram")]
    pub max_datagram_bytes: usize,
    #[serde(default = "default_true")]
    pub loopback: bool,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            interface: None,
            bind: None,
            max_datagram_bytes: default_max_datagram(),
            loopback: true,
            ttl: default_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    pub interval_min_ms: u64,
    pub interval_max_ms: u64,
    pub redundancy: u32,
}

impl ChannelSection {
    pub fn trickle(&self) -> TrickleConfig {
        TrickleConfig::from_millis(self.interval_min_ms, self.interval_max_ms, self.redundancy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisseminationSection {
    #[serde(default = "default_block_size")]
    pub block_size: u16,
    #[serde(default = "default_burst")]
    pub symbols_per_burst: u32,
    #[serde(default = "default_decode_every")]
    pub decode_every: u32,
    #[serde(default = "default_post_completion_beacons")]
    pub post_completion_beacons: u32,
    #[serde(default = "default_true")]
    pub relay_after_complete: bool,
    #[serde(default)]
    pub await_interest: bool,
    #[serde(default = "default_capacity_factor")]
    pub store_capacity_factor: u32,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_control")]
    pub control: ChannelSection,
    #[serde(default = "default_data")]
    pub data: ChannelSection,
}

impl Default for DisseminationSection {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            symbols_per_burst: default_burst(),
            decode_every: default_decode_every(),
            post_completion_beacons: default_post_completion_beacons(),
            relay_after_complete: true,
            await_interest: false,
            store_capacity_factor: default_capacity_factor(),
            retention_secs: default_retention_secs(),
            control: default_control(),
            data: default_data(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "sprinkler".into()
}
fn default_output_dir() -> String {
    "~/.sprinkler/received".into()
}
fn default_inbound_queue() -> usize {
    1024
}
fn default_group() -> String {
    "239.255.83.80".into()
}
fn default_port() -> u16 {
    9475
}
fn default_max_datagram() -> usize {
    CURRENT_PROFILE.max_datagram_bytes
}
fn default_true() -> bool {
    true
}
fn default_ttl() -> u32 {
    1
}
fn default_block_size() -> u16 {
    CURRENT_PROFILE.block_size
}
fn default_burst() -> u32 {
    CURRENT_PROFILE.symbols_per_burst
}
fn default_decode_every() -> u32 {
    CURRENT_PROFILE.decode_every
}
fn default_post_completion_beacons() -> u32 {
    CURRENT_PROFILE.post_completion_beacons
}
fn default_capacity_factor() -> u32 {
    CURRENT_PROFILE.store_capacity_factor
}
fn default_retention_secs() -> u64 {
    CURRENT_PROFILE.retention_secs
}
fn default_control() -> ChannelSection {
    ChannelSection {
        interval_min_ms: CURRENT_PROFILE.control_interval_min_ms,
        interval_max_ms: CURRENT_PROFILE.control_interval_max_ms,
        redundancy: CURRENT_PROFILE.control_redundancy,
    }
}
fn default_data() -> ChannelSection {
    ChannelSection {
        interval_min_ms: CURRENT_PROFILE.data_interval_min_ms,
        interval_max_ms: CURRENT_PROFILE.data_interval_max_ms,
        redundancy: CURRENT_PROFILE.data_redundancy,
    }
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Cross-section checks serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let d = &self.dissemination;
        if d.block_size == 0 {
            anyhow::bail!("dissemination.block_size must be non-zero");
        }
        let needed = d.block_size as usize + DATA_OVERHEAD;
        if needed > self.network.max_datagram_bytes {
            anyhow::bail!(
                "block_size {} needs {} byte datagrams, max_datagram_bytes is {}",
                d.block_size,
                needed,
                self.network.max_datagram_bytes
            );
        }
        if self.node.inbound_queue == 0 {
            anyhow::bail!("node.inbound_queue must be non-zero");
        }
        self.to_engine_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid dissemination config: {e}"))?;
        self.network.group_addr()?;
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        let d = &self.dissemination;
        EngineConfig {
            control: d.control.trickle(),
            data: d.data.trickle(),
            symbols_per_burst: d.symbols_per_burst,
            decode_every: d.decode_every,
            post_completion_beacons: d.post_completion_beacons,
            relay_after_complete: d.relay_after_complete,
            await_interest: d.await_interest,
            store_capacity_factor: d.store_capacity_factor,
            retention: Duration::from_secs(d.retention_secs),
        }
    }
}

impl NetworkSection {
    pub fn group_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .group
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid multicast group {:?}: {e}", self.group))?;
        if !ip.is_multicast() {
            anyhow::bail!("{ip} is not a multicast address");
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        if let Some(bind) = &self.bind {
            return bind
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid bind address {bind:?}: {e}"));
        }
        let unspecified = match self.group_addr()?.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(unspecified, self.port))
    }
}
