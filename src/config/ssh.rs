//! The `sshConnections.*` and `uplinkConnections.*` configuration segments.
//!
//! Both describe tunnel-style endpoints handled by external transport
//! providers; this layer only turns them into contact points whose
//! address-meaningful options carry the tunnel parameters.

use crate::contact::{ContactPoint, ContactPointError, OPT_AUTO_RETRY, OPT_CONNECT_ON_STARTUP};
use serde::{Deserialize, Serialize};

/// One `sshConnections.<id>` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectionConfig {
    pub host: String,
    pub port: u16,
    pub login_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile_location: Option<String>,
    /// Inverted into the `usePassphrase` contact point option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_passphrase: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_on_startup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry: Option<bool>,
}

impl SshConnectionConfig {
    /// Render this entry as an SSH contact point.
    pub fn to_contact_point(&self) -> Result<ContactPoint, ContactPointError> {
        let cp = self.base_contact_point("ssh");
        ContactPoint::parse_known(&cp.to_string())
    }

    fn base_contact_point(&self, transport: &str) -> ContactPoint {
        let mut cp = ContactPoint::new(transport, self.host.clone(), self.port)
            .with_option("loginName", self.login_name.clone())
            .with_option(
                "usePassphrase",
                (!self.no_passphrase.unwrap_or(false)).to_string(),
            );
        if let Some(keyfile) = &self.keyfile_location {
            cp = cp.with_option("keyfileLocation", keyfile.clone());
        }
        if let Some(v) = self.connect_on_startup {
            cp = cp.with_option(OPT_CONNECT_ON_STARTUP, v.to_string());
        }
        if let Some(v) = self.auto_retry {
            cp = cp.with_option(OPT_AUTO_RETRY, v.to_string());
        }
        cp
    }
}

fn default_client_id() -> String {
    "default".to_string()
}

/// One `uplinkConnections.<id>` entry.
///
/// Same shape as an SSH connection plus the uplink client id and the
/// gateway role flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkConnectionConfig {
    #[serde(flatten)]
    pub ssh: SshConnectionConfig,
    #[serde(default = "default_client_id", rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub is_gateway: bool,
}

impl UplinkConnectionConfig {
    /// Render this entry as an uplink contact point.
    pub fn to_contact_point(&self) -> Result<ContactPoint, ContactPointError> {
        let cp = self
            .ssh
            .base_contact_point("uplink")
            .with_option("clientID", self.client_id.clone())
            .with_option("isGateway", self.is_gateway.to_string());
        ContactPoint::parse_known(&cp.to_string())
    }
}
