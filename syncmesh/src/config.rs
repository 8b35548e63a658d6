//! Node configuration
//!
//! TOML file plus CLI overrides. Every section has workable defaults so a
//! bare `syncmesh` invocation starts a usable single node.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use lib_dht::SeedNode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable identity; auto-assigned and persisted when absent.
    pub node_id: Option<String>,
    pub p2p: P2pConfig,
    pub crdt: CrdtConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            p2p: P2pConfig::default(),
            crdt: CrdtConfig::default(),
            storage: StorageConfig::default(),
            crypto: CryptoConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub port: u16,
    /// WebSocket endpoints (`/p2p-signaling`, `/realtime`) bind here.
    pub signaling_port: u16,
    pub bootstrap_nodes: Vec<SeedNode>,
    pub max_peers: usize,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            port: 4411,
            signaling_port: 8411,
            bootstrap_nodes: Vec::new(),
            max_peers: 64,
            heartbeat_interval_ms: 10_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrdtConfig {
    pub garbage_collection_interval_ms: u64,
    pub tombstone_lifetime_ms: u64,
    pub max_operations: usize,
    /// Sync-engine re-evaluation and broadcast cadence.
    pub sync_interval_ms: u64,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            garbage_collection_interval_ms: 60_000,
            tombstone_lifetime_ms: 24 * 60 * 60 * 1_000,
            max_operations: 1_000,
            sync_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// In-memory value cache inside the tiered store, entries.
    pub cache_size: usize,
    /// Hard cap on bytes across tiers; 0 disables.
    pub max_local_size: u64,
    pub compression_enabled: bool,
    /// Cache/storage TTL sweep cadence.
    pub cache_sweep_interval_ms: u64,
    /// Multi-tier cache capacities.
    pub cache_l1_entries: usize,
    pub cache_l2_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/syncmesh"),
            cache_size: 1_024,
            max_local_size: 0,
            compression_enabled: false,
            cache_sweep_interval_ms: 60_000,
            cache_l1_entries: 128,
            cache_l2_entries: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Kyber parameter set: 512, 768 or 1024.
    pub kyber_key_size: u32,
    /// Dilithium level: 2, 3 or 5.
    pub dilithium_key_size: u32,
    /// Symmetric key width; the AEAD layer requires 256.
    pub aes_key_size: u32,
    /// 0 disables rotation.
    pub key_rotation_interval_ms: u64,
    /// Run on the classical fallback provider (NOT quantum-safe).
    pub use_fallback: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kyber_key_size: 768,
            dilithium_key_size: 3,
            aes_key_size: 256,
            key_rotation_interval_ms: 24 * 60 * 60 * 1_000,
            use_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Metrics channel cadence.
    pub update_interval_ms: u64,
    /// Samples kept for the metrics history.
    pub history_retention: usize,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            history_retention: 1_000,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Percentages.
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    /// Millis.
    pub network_latency: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: 90.0,
            memory: 90.0,
            disk: 90.0,
            network_latency: 1_000,
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.crypto.aes_key_size != 256 {
            bail!(
                "crypto.aes_key_size must be 256 (got {})",
                self.crypto.aes_key_size
            );
        }
        if !matches!(self.crypto.kyber_key_size, 512 | 768 | 1024) {
            bail!(
                "crypto.kyber_key_size must be 512, 768 or 1024 (got {})",
                self.crypto.kyber_key_size
            );
        }
        if !matches!(self.crypto.dilithium_key_size, 2 | 3 | 5) {
            bail!(
                "crypto.dilithium_key_size must be 2, 3 or 5 (got {})",
                self.crypto.dilithium_key_size
            );
        }
        if self.p2p.port == self.p2p.signaling_port {
            bail!("p2p.port and p2p.signaling_port must differ");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            [p2p]
            port = 5511
            max_peers = 8

            [crypto]
            kyber_key_size = 512
            dilithium_key_size = 2
            "#,
        )
        .unwrap();

        assert_eq!(parsed.p2p.port, 5511);
        assert_eq!(parsed.p2p.max_peers, 8);
        // Unspecified sections fall back to defaults
        assert_eq!(parsed.crdt.max_operations, 1_000);
        assert_eq!(parsed.crypto.kyber_key_size, 512);
        parsed.validate().unwrap();
    }

    #[test]
    fn invalid_aes_key_size_is_rejected() {
        let mut config = NodeConfig::default();
        config.crypto.aes_key_size = 128;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bootstrap_nodes_parse_from_toml() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            [[p2p.bootstrap_nodes]]
            address = "203.0.113.7"
            port = 4411

            [[p2p.bootstrap_nodes]]
            id = "seed-two"
            address = "203.0.113.8"
            port = 4412
            "#,
        )
        .unwrap();
        assert_eq!(parsed.p2p.bootstrap_nodes.len(), 2);
        assert!(parsed.p2p.bootstrap_nodes[0].id.is_none());
        assert_eq!(parsed.p2p.bootstrap_nodes[1].id.as_deref(), Some("seed-two"));
    }
}
