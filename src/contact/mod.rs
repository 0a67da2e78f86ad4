//! Contact point addressing.
//!
//! A contact point is an addressable endpoint: transport kind, host, port
//! and named options, with a compact canonical text form
//! `"<transport>:<host>:<port>(<k=v,...>)"` (the option list is omitted
//! when empty). Contact points are produced by parsing configuration or by
//! a remote handshake, and are immutable once constructed.
//!
//! Options fall into two groups: address-meaningful options (part of the
//! endpoint's identity, e.g. `loginName` for SSH) and behavioral options
//! that tune connection handling (`connectOnStartup` and the auto-retry
//! parameters). Equality and hashing ignore the behavioral group, so two
//! configurations pointing at the same endpoint with different retry
//! settings still count as one endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Option key: dial this contact point during startup (default true).
pub const OPT_CONNECT_ON_STARTUP: &str = "connectOnStartup";
/// Option key: re-dial automatically after failures (default true).
pub const OPT_AUTO_RETRY: &str = "autoRetry";
/// Option key: initial auto-retry delay in milliseconds.
pub const OPT_RETRY_INITIAL_DELAY: &str = "autoRetryInitialDelay";
/// Option key: maximum auto-retry delay in milliseconds.
pub const OPT_RETRY_MAXIMUM_DELAY: &str = "autoRetryMaximumDelay";
/// Option key: multiplier applied to the retry delay after each attempt.
pub const OPT_RETRY_DELAY_MULTIPLIER: &str = "autoRetryDelayMultiplier";

/// Behavioral options excluded from endpoint identity.
const BEHAVIORAL_OPTIONS: [&str; 5] = [
    OPT_CONNECT_ON_STARTUP,
    OPT_AUTO_RETRY,
    OPT_RETRY_INITIAL_DELAY,
    OPT_RETRY_MAXIMUM_DELAY,
    OPT_RETRY_DELAY_MULTIPLIER,
];

/// Transport tokens built into this crate; strict parsing rejects others.
pub const KNOWN_TRANSPORTS: [&str; 3] = ["tcp", "ssh", "uplink"];

/// Errors related to contact point parsing.
#[derive(Debug, Error)]
pub enum ContactPointError {
    #[error("malformed contact point {text:?}: {reason}")]
    Malformed { text: String, reason: String },

    #[error("unknown transport {transport:?} in contact point {text:?}")]
    UnknownTransport { transport: String, text: String },
}

impl ContactPointError {
    fn malformed(text: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

/// An addressable network endpoint.
#[derive(Clone, Eq)]
pub struct ContactPoint {
    transport: String,
    host: String,
    port: u16,
    options: BTreeMap<String, String>,
}

impl ContactPoint {
    /// Create a contact point without options.
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            options: BTreeMap::new(),
        }
    }

    /// Builder-style option setter.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parse the canonical text form.
    ///
    /// Accepts any alphanumeric transport token so external transport
    /// providers can introduce their own kinds; use [`parse_known`] where
    /// only built-in transports are acceptable.
    ///
    /// [`parse_known`]: ContactPoint::parse_known
    pub fn parse(text: &str) -> Result<Self, ContactPointError> {
        let text = text.trim();
        let (addr, options) = match text.find('(') {
            Some(open) => {
                if !text.ends_with(')') {
                    return Err(ContactPointError::malformed(text, "unterminated option list"));
                }
                (&text[..open], parse_options(text, &text[open + 1..text.len() - 1])?)
            }
            None => {
                if text.ends_with(')') {
                    return Err(ContactPointError::malformed(text, "option list without opening parenthesis"));
                }
                (text, BTreeMap::new())
            }
        };

        let (transport, rest) = addr
            .split_once(':')
            .ok_or_else(|| ContactPointError::malformed(text, "missing transport separator"))?;
        if transport.is_empty() || !transport.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ContactPointError::malformed(text, "invalid transport token"));
        }

        let (host, port_text) = rest
            .rsplit_once(':')
            .ok_or_else(|| ContactPointError::malformed(text, "missing port separator"))?;
        if host.is_empty() {
            return Err(ContactPointError::malformed(text, "empty host"));
        }

        let port: u16 = port_text
            .parse()
            .map_err(|_| ContactPointError::malformed(text, "port is not a number in 1-65535"))?;
        if port == 0 {
            return Err(ContactPointError::malformed(text, "port 0 is out of range"));
        }

        Ok(Self {
            transport: transport.to_string(),
            host: host.to_string(),
            port,
            options,
        })
    }

    /// Parse, additionally rejecting transport tokens this crate does not
    /// ship a provider for.
    pub fn parse_known(text: &str) -> Result<Self, ContactPointError> {
        let parsed = Self::parse(text)?;
        if !KNOWN_TRANSPORTS.contains(&parsed.transport.as_str()) {
            return Err(ContactPointError::UnknownTransport {
                transport: parsed.transport,
                text: text.to_string(),
            });
        }
        Ok(parsed)
    }

    /// The transport kind token.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port (1-65535).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Look up a raw option value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// All options, including behavioral ones.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Whether this contact point should be dialed at startup and kept
    /// alive with automatic retries. Defaults to true when absent.
    pub fn connect_on_startup(&self) -> bool {
        self.option(OPT_CONNECT_ON_STARTUP)
            .and_then(|v| v.parse().ok())
            .unwrap_or(true)
    }

    /// Whether failed connections to this endpoint are re-dialed
    /// automatically. Defaults to true when absent.
    pub fn auto_retry(&self) -> bool {
        self.option(OPT_AUTO_RETRY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(true)
    }

    /// Configured initial retry delay in milliseconds, if present.
    pub fn retry_initial_delay_ms(&self) -> Option<u64> {
        self.option(OPT_RETRY_INITIAL_DELAY).and_then(|v| v.parse().ok())
    }

    /// Configured maximum retry delay in milliseconds, if present.
    pub fn retry_maximum_delay_ms(&self) -> Option<u64> {
        self.option(OPT_RETRY_MAXIMUM_DELAY).and_then(|v| v.parse().ok())
    }

    /// Configured retry delay multiplier, if present.
    pub fn retry_delay_multiplier(&self) -> Option<f64> {
        self.option(OPT_RETRY_DELAY_MULTIPLIER).and_then(|v| v.parse().ok())
    }

    fn meaningful_options(&self) -> impl Iterator<Item = (&String, &String)> {
        self.options
            .iter()
            .filter(|(k, _)| !BEHAVIORAL_OPTIONS.contains(&k.as_str()))
    }
}

impl PartialEq for ContactPoint {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport
            && self.host == other.host
            && self.port == other.port
            && self.meaningful_options().eq(other.meaningful_options())
    }
}

impl Hash for ContactPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        for (k, v) in self.meaningful_options() {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl fmt::Display for ContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport, self.host, self.port)?;
        if !self.options.is_empty() {
            let opts: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "({})", opts.join(","))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContactPoint({})", self)
    }
}

fn parse_options(
    full_text: &str,
    list: &str,
) -> Result<BTreeMap<String, String>, ContactPointError> {
    let mut options = BTreeMap::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| ContactPointError::malformed(full_text, "option entry without '='"))?;
        if key.trim().is_empty() {
            return Err(ContactPointError::malformed(full_text, "empty option key"));
        }
        options.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain() {
        let cp = ContactPoint::parse("tcp:host.example.org:21000").unwrap();
        assert_eq!(cp.transport(), "tcp");
        assert_eq!(cp.host(), "host.example.org");
        assert_eq!(cp.port(), 21000);
        assert!(cp.options().is_empty());
        assert!(cp.connect_on_startup());
    }

    #[test]
    fn parse_with_options() {
        let cp =
            ContactPoint::parse("tcp:10.0.0.1:20001(autoRetryInitialDelay=100,connectOnStartup=false)")
                .unwrap();
        assert_eq!(cp.retry_initial_delay_ms(), Some(100));
        assert!(!cp.connect_on_startup());
    }

    #[test]
    fn format_roundtrip() {
        let cases = [
            "tcp:localhost:1",
            "tcp:host:65535(connectOnStartup=false)",
            "ssh:gw.example.org:22(keyfileLocation=/home/u/id,loginName=user)",
            "uplink:relay:31005(clientID=default,isGateway=false)",
        ];
        for text in cases {
            let cp = ContactPoint::parse(text).unwrap();
            assert_eq!(ContactPoint::parse(&cp.to_string()).unwrap(), cp);
            // sorted option order makes the text form itself canonical
            assert_eq!(cp.to_string(), text);
        }
    }

    #[test]
    fn malformed_inputs() {
        for text in [
            "",
            "tcp",
            "tcp:",
            "tcp::21000",        // empty host
            "tcp:host:",         // missing port
            "tcp:host:0",        // out of range
            "tcp:host:65536",    // out of range
            "tcp:host:abc",      // non-numeric port
            "tcp:host:1(x)",     // option without '='
            "tcp:host:1(=v)",    // empty key
            "tcp:host:1(a=b",    // unterminated
            "tcp:host:1)",       // stray close
            ":host:1",           // empty transport
        ] {
            assert!(
                matches!(ContactPoint::parse(text), Err(ContactPointError::Malformed { .. })),
                "expected Malformed for {:?}",
                text
            );
        }
    }

    #[test]
    fn strict_parse_rejects_unknown_transport() {
        assert!(ContactPoint::parse("carrierpigeon:coop:2100").is_ok());
        assert!(matches!(
            ContactPoint::parse_known("carrierpigeon:coop:2100"),
            Err(ContactPointError::UnknownTransport { .. })
        ));
        assert!(ContactPoint::parse_known("ssh:host:22").is_ok());
    }

    #[test]
    fn behavioral_options_do_not_affect_identity() {
        let a = ContactPoint::parse("tcp:host:21000(autoRetryInitialDelay=100)").unwrap();
        let b = ContactPoint::parse("tcp:host:21000(autoRetryMaximumDelay=800)").unwrap();
        let c = ContactPoint::parse("tcp:host:21000").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);

        use std::collections::HashSet;
        let set: HashSet<ContactPoint> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn meaningful_options_affect_identity() {
        let a = ContactPoint::parse("ssh:host:22(loginName=alice)").unwrap();
        let b = ContactPoint::parse("ssh:host:22(loginName=bob)").unwrap();
        let c = ContactPoint::parse("ssh:host:22").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn empty_option_list_is_equivalent_to_none() {
        let a = ContactPoint::parse("tcp:host:21000()").unwrap();
        let b = ContactPoint::parse("tcp:host:21000").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "tcp:host:21000");
    }
}
