//! Configuration system.
//!
//! Loads YAML configuration from cascading search paths:
//! 1. `/etc/trellis/trellis.yaml` (system, lowest priority)
//! 2. `<user config dir>/trellis/trellis.yaml`
//! 3. `./trellis.yaml` (current directory, highest priority)
//!
//! Values from higher priority files override those from lower priority
//! files. The document is segmented the way external collaborators supply
//! it: `network.*` for connections/ports/filter/timeouts, `sshConnections`
//! and `uplinkConnections` for tunnel endpoints, plus a handful of
//! node-level keys (`nodeId`, `displayName`, `relay`, `stateDir`,
//! `healthCheck`).

mod network;
mod ssh;

pub use network::{
    ConnectionConfig, IpFilterConfig, IpFilterState, NetworkConfig, ServerPortConfig,
};
pub use ssh::{SshConnectionConfig, UplinkConnectionConfig};

use crate::conn::HealthConfig;
use crate::contact::{ContactPoint, ContactPointError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "trellis.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Node id override; must match `^[0-9a-f]{32}$` to be honored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Human-readable name advertised to peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Whether this node merges the meshes of its peers (immutable for the
    /// node's lifetime).
    #[serde(default)]
    pub relay: bool,

    /// Directory holding persisted state (the node id record).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Network segment (`network.*`).
    #[serde(default)]
    pub network: NetworkConfig,

    /// SSH tunnel endpoints (`sshConnections.*`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ssh_connections: BTreeMap<String, SshConnectionConfig>,

    /// SSH uplink endpoints (`uplinkConnections.*`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uplink_connections: BTreeMap<String, UplinkConnectionConfig>,

    /// Connection health check tuning (`healthCheck.*`).
    #[serde(default)]
    pub health_check: HealthConfig,
}

impl Config {
    /// Create an empty configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths, lowest priority
    /// first. Returns the merged config and the paths actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths; later paths override
    /// earlier ones. Missing files are skipped.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        paths.push(PathBuf::from("/etc/trellis").join(CONFIG_FILENAME));
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("trellis").join(CONFIG_FILENAME));
        }
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));
        paths
    }

    /// Merge another configuration into this one; values from `other`
    /// override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.node_id.is_some() {
            self.node_id = other.node_id;
        }
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
        if other.relay {
            self.relay = true;
        }
        if other.state_dir.is_some() {
            self.state_dir = other.state_dir;
        }
        self.network.merge(other.network);
        self.ssh_connections.extend(other.ssh_connections);
        self.uplink_connections.extend(other.uplink_connections);
        self.health_check = other.health_check;
    }

    /// The state directory for persisted identity (default: `.`).
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Render all outbound endpoints (plain, SSH, uplink) as contact
    /// points, in stable id order. Malformed entries land in the error
    /// list; the caller reports them and loads the rest.
    pub fn outbound_contact_points(&self) -> (Vec<ContactPoint>, Vec<ContactPointError>) {
        let mut points = Vec::new();
        let mut errors = Vec::new();

        for cfg in self.network.connections.values() {
            match cfg.to_contact_point() {
                Ok(cp) => points.push(cp),
                Err(e) => errors.push(e),
            }
        }
        for cfg in self.ssh_connections.values() {
            match cfg.to_contact_point() {
                Ok(cp) => points.push(cp),
                Err(e) => errors.push(e),
            }
        }
        for cfg in self.uplink_connections.values() {
            match cfg.to_contact_point() {
                Ok(cp) => points.push(cp),
                Err(e) => errors.push(e),
            }
        }
        (points, errors)
    }

    /// Render all listening endpoints as contact points, in stable id
    /// order, with the same skip-malformed policy.
    pub fn server_contact_points(&self) -> (Vec<ContactPoint>, Vec<ContactPointError>) {
        let mut points = Vec::new();
        let mut errors = Vec::new();
        for cfg in self.network.server_ports.values() {
            match cfg.to_contact_point() {
                Ok(cp) => points.push(cp),
                Err(e) => errors.push(e),
            }
        }
        (points, errors)
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn empty_document_has_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.node_id.is_none());
        assert!(!config.relay);
        assert_eq!(config.network.request_timeout_msec, 40_000);
        assert_eq!(config.network.forwarding_timeout_msec, 35_000);
        assert_eq!(config.health_check.failure_limit, 3);
    }

    #[test]
    fn full_document_parses() {
        let yaml = r#"
nodeId: "0123456789abcdef0123456789abcdef"
displayName: "workhorse-3"
relay: true
network:
  requestTimeoutMsec: 50000
  forwardingTimeoutMsec: 45000
  connections:
    hub:
      host: hub.example.org
      port: 21000
      autoRetryInitialDelay: 5000
  serverPorts:
    main:
      ip: "0.0.0.0"
      port: 21000
  ipFilter:
    enabled: true
    allowedIPs: ["10.0.0.5"]
sshConnections:
  gw:
    host: gw.example.org
    port: 22
    loginName: alice
uplinkConnections:
  up:
    host: relay.example.org
    port: 31005
    loginName: alice
    isGateway: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.display_name.as_deref(), Some("workhorse-3"));
        assert!(config.relay);
        assert_eq!(config.network.request_timeout_msec, 50_000);

        let (outbound, errors) = config.outbound_contact_points();
        assert!(errors.is_empty());
        assert_eq!(outbound.len(), 3);
        assert_eq!(outbound[0].transport(), "tcp");
        assert_eq!(outbound[1].transport(), "ssh");
        assert_eq!(outbound[2].transport(), "uplink");

        let (server, errors) = config.server_contact_points();
        assert!(errors.is_empty());
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].port(), 21000);
    }

    #[test]
    fn malformed_entry_is_skipped_others_load() {
        let yaml = r#"
network:
  connections:
    bad:
      host: ""
      port: 21000
    good:
      host: hub.example.org
      port: 21001
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let (outbound, errors) = config.outbound_contact_points();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].host(), "hub.example.org");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn merge_overrides_and_extends() {
        let mut base: Config = serde_yaml::from_str(
            r#"
displayName: base
network:
  connections:
    a: { host: a.example.org, port: 1000 }
"#,
        )
        .unwrap();
        let overlay: Config = serde_yaml::from_str(
            r#"
displayName: overlay
relay: true
network:
  connections:
    b: { host: b.example.org, port: 2000 }
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.display_name.as_deref(), Some("overlay"));
        assert!(base.relay);
        assert_eq!(base.network.connections.len(), 2);
    }

    #[test]
    fn load_from_paths_merges_in_priority_order() {
        let dir = TempDir::new().unwrap();
        let low = dir.path().join("low.yaml");
        let high = dir.path().join("high.yaml");
        fs::write(&low, "displayName: low\n").unwrap();
        fs::write(&high, "displayName: high\n").unwrap();

        let (config, loaded) =
            Config::load_from_paths(&[low.clone(), high.clone()]).unwrap();
        assert_eq!(loaded, vec![low, high]);
        assert_eq!(config.display_name.as_deref(), Some("high"));
    }

    #[test]
    fn load_skips_missing_files() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("trellis.yaml");
        fs::write(&existing, "displayName: present\n").unwrap();
        let missing = dir.path().join("nope.yaml");

        let (config, loaded) = Config::load_from_paths(&[missing, existing.clone()]).unwrap();
        assert_eq!(loaded, vec![existing]);
        assert_eq!(config.display_name.as_deref(), Some("present"));
    }

    #[test]
    fn parse_error_carries_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trellis.yaml");
        fs::write(&path, "network: [not, a, map]\n").unwrap();
        match Config::load_file(&path) {
            Err(ConfigError::ParseYaml { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected ParseYaml, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn yaml_roundtrip_keeps_camel_case_keys() {
        let mut config = Config::new();
        config.display_name = Some("n1".into());
        config.network.connections.insert(
            "hub".into(),
            ConnectionConfig {
                host: "hub.example.org".into(),
                port: 21000,
                connect_on_startup: Some(false),
                auto_retry_initial_delay: None,
                auto_retry_maximum_delay: None,
                auto_retry_delay_multiplier: None,
            },
        );
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("displayName:"));
        assert!(yaml.contains("connectOnStartup:"));
        assert!(yaml.contains("requestTimeoutMsec:"));
    }
}
