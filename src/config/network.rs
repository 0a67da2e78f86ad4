//! The `network.*` configuration segment.
//!
//! Covers outbound connections, server ports, the inbound IP filter and the
//! two message timeouts. The forwarding timeout is intentionally shorter
//! than the request timeout: a forwarding hop must give up before the
//! upstream caller does, otherwise the caller times out without ever
//! learning which hop failed.

use crate::contact::{
    ContactPoint, ContactPointError, OPT_CONNECT_ON_STARTUP, OPT_RETRY_DELAY_MULTIPLIER,
    OPT_RETRY_INITIAL_DELAY, OPT_RETRY_MAXIMUM_DELAY,
};
use crate::filter::AdmissionRule;
use serde::{Deserialize, Deserializer, Serialize};

fn default_request_timeout() -> u64 {
    40_000
}

fn default_forwarding_timeout() -> u64 {
    35_000
}

/// `network.*` segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Sender-side timeout for a request awaiting its response.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_msec: u64,

    /// Timeout applied by a forwarding node to an in-transit message.
    #[serde(default = "default_forwarding_timeout")]
    pub forwarding_timeout_msec: u64,

    /// Outbound connections, keyed by a caller-chosen id.
    #[serde(default)]
    pub connections: std::collections::BTreeMap<String, ConnectionConfig>,

    /// Listening endpoints, keyed by a caller-chosen id.
    #[serde(default)]
    pub server_ports: std::collections::BTreeMap<String, ServerPortConfig>,

    /// Inbound IP filter. Parsed leniently: a malformed segment is recorded
    /// as invalid instead of failing the whole document, so the filter can
    /// fail closed (see `IpFilterState`).
    #[serde(default, deserialize_with = "lenient_ip_filter")]
    pub ip_filter: IpFilterState,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_msec: default_request_timeout(),
            forwarding_timeout_msec: default_forwarding_timeout(),
            connections: Default::default(),
            server_ports: Default::default(),
            ip_filter: IpFilterState::default(),
        }
    }
}

impl NetworkConfig {
    /// Merge another network segment into this one. Maps extend per key;
    /// scalar values override only when the other side left the default.
    pub fn merge(&mut self, other: NetworkConfig) {
        if other.request_timeout_msec != default_request_timeout() {
            self.request_timeout_msec = other.request_timeout_msec;
        }
        if other.forwarding_timeout_msec != default_forwarding_timeout() {
            self.forwarding_timeout_msec = other.forwarding_timeout_msec;
        }
        self.connections.extend(other.connections);
        self.server_ports.extend(other.server_ports);
        let other_filter_is_default =
            matches!(&other.ip_filter, IpFilterState::Valid(f) if !f.enabled && f.allowed_ips.is_empty());
        if !other_filter_is_default {
            self.ip_filter = other.ip_filter;
        }
    }
}

/// One `network.connections.<id>` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_on_startup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry_initial_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry_maximum_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry_delay_multiplier: Option<f64>,
}

impl ConnectionConfig {
    /// Render this entry as an outbound TCP contact point.
    ///
    /// Validation (empty host, port range) happens by round-tripping
    /// through the canonical text form.
    pub fn to_contact_point(&self) -> Result<ContactPoint, ContactPointError> {
        let mut cp = ContactPoint::new("tcp", self.host.clone(), self.port);
        if let Some(v) = self.connect_on_startup {
            cp = cp.with_option(OPT_CONNECT_ON_STARTUP, v.to_string());
        }
        if let Some(v) = self.auto_retry_initial_delay {
            cp = cp.with_option(OPT_RETRY_INITIAL_DELAY, v.to_string());
        }
        if let Some(v) = self.auto_retry_maximum_delay {
            cp = cp.with_option(OPT_RETRY_MAXIMUM_DELAY, v.to_string());
        }
        if let Some(v) = self.auto_retry_delay_multiplier {
            cp = cp.with_option(OPT_RETRY_DELAY_MULTIPLIER, v.to_string());
        }
        ContactPoint::parse_known(&cp.to_string())
    }
}

/// One `network.serverPorts.<id>` entry. Both fields are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPortConfig {
    pub ip: String,
    pub port: u16,
}

impl ServerPortConfig {
    /// Render this entry as an inbound TCP contact point.
    pub fn to_contact_point(&self) -> Result<ContactPoint, ContactPointError> {
        ContactPoint::parse_known(&format!("tcp:{}:{}", self.ip, self.port))
    }
}

/// `network.ipFilter` segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

impl IpFilterConfig {
    /// Convert to the filter's rule representation.
    pub fn to_rule(&self) -> AdmissionRule {
        AdmissionRule::new(self.enabled, self.allowed_ips.iter().cloned())
    }
}

/// Outcome of parsing the `network.ipFilter` segment.
///
/// `Invalid` carries the parse error text; consumers must fail closed
/// (deny all) rather than treat it as "no filter configured".
#[derive(Debug, Clone)]
pub enum IpFilterState {
    Valid(IpFilterConfig),
    Invalid(String),
}

impl Default for IpFilterState {
    fn default() -> Self {
        IpFilterState::Valid(IpFilterConfig::default())
    }
}

impl Serialize for IpFilterState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IpFilterState::Valid(cfg) => cfg.serialize(serializer),
            IpFilterState::Invalid(_) => IpFilterConfig::default().serialize(serializer),
        }
    }
}

fn lenient_ip_filter<'de, D>(deserializer: D) -> Result<IpFilterState, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match serde_yaml::from_value::<IpFilterConfig>(value) {
        Ok(cfg) => Ok(IpFilterState::Valid(cfg)),
        Err(e) => Ok(IpFilterState::Invalid(e.to_string())),
    }
}
