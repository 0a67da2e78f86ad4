//! Inbound connection admission control.
//!
//! The filter answers a single question: may a remote address open a
//! connection to this node? With no configuration (or a disabled rule set)
//! everything is accepted. An enabled rule set is a strict allow-list; an
//! enabled rule set with zero entries denies everyone. A configuration that
//! fails to parse drives the filter into the fail-closed state: this guards
//! inbound network exposure, so the safe reaction to a broken rule file is
//! to deny, never to silently fall back to allow-all.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

/// A complete admission rule set, applied atomically as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdmissionRule {
    /// Whether filtering is active at all.
    pub enabled: bool,
    /// Source IPs accepted while filtering is active.
    pub allowed_ips: BTreeSet<String>,
}

impl AdmissionRule {
    /// Build a rule from an enabled flag and an IP list.
    pub fn new(enabled: bool, allowed_ips: impl IntoIterator<Item = String>) -> Self {
        Self {
            enabled,
            allowed_ips: allowed_ips.into_iter().collect(),
        }
    }
}

/// Effective admission policy derived from the last reconfiguration.
#[derive(Clone, Debug, PartialEq, Eq)]
enum AdmissionPolicy {
    /// No rule set, or filtering disabled.
    AllowAll,
    /// Enabled rule set; only listed IPs are admitted.
    AllowList(BTreeSet<String>),
    /// Configuration was invalid; deny everything.
    DenyAll,
}

/// Thread-safe admission filter shared between the facade and listeners.
///
/// `is_allowed` and `reconfigure` may be called concurrently from any
/// number of tasks; a single mutex guards the policy, and rule sets are
/// swapped as a whole so callers never observe a partial update.
pub struct ConnectionFilter {
    policy: Mutex<AdmissionPolicy>,
}

impl Default for ConnectionFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl ConnectionFilter {
    /// Create a filter in the default allow-all state.
    pub fn allow_all() -> Self {
        Self {
            policy: Mutex::new(AdmissionPolicy::AllowAll),
        }
    }

    /// Create a filter from an already-parsed rule.
    pub fn from_rule(rule: AdmissionRule) -> Self {
        let filter = Self::allow_all();
        filter.reconfigure(rule);
        filter
    }

    /// Decide whether a remote IP may connect.
    pub fn is_allowed(&self, remote_ip: &str) -> bool {
        match &*self.lock() {
            AdmissionPolicy::AllowAll => true,
            AdmissionPolicy::AllowList(ips) => ips.contains(remote_ip),
            AdmissionPolicy::DenyAll => false,
        }
    }

    /// Replace the active rule set.
    pub fn reconfigure(&self, rule: AdmissionRule) {
        let policy = if !rule.enabled {
            AdmissionPolicy::AllowAll
        } else {
            AdmissionPolicy::AllowList(rule.allowed_ips)
        };
        match &policy {
            AdmissionPolicy::AllowAll => {
                info!("IP filtering disabled; all incoming connections are accepted")
            }
            AdmissionPolicy::AllowList(ips) => info!(
                count = ips.len(),
                "IP filtering enabled; incoming connections restricted to listed source IPs"
            ),
            AdmissionPolicy::DenyAll => unreachable!(),
        }
        *self.lock() = policy;
    }

    /// Enter the fail-closed state after an invalid filter configuration.
    pub fn fail_closed(&self) {
        warn!("IP filter configuration invalid; denying all incoming connections");
        *self.lock() = AdmissionPolicy::DenyAll;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdmissionPolicy> {
        // a poisoned policy is still a valid policy
        self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ConnectionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFilter")
            .field("policy", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_allow_all() {
        let filter = ConnectionFilter::allow_all();
        assert!(filter.is_allowed("10.0.0.1"));
        assert!(filter.is_allowed("anything"));
    }

    #[test]
    fn disabled_rule_is_allow_all() {
        let filter = ConnectionFilter::from_rule(AdmissionRule::new(
            false,
            ["10.0.0.1".to_string()],
        ));
        assert!(filter.is_allowed("10.0.0.1"));
        assert!(filter.is_allowed("192.168.0.9"));
    }

    #[test]
    fn enabled_rule_is_strict_allow_list() {
        let filter = ConnectionFilter::from_rule(AdmissionRule::new(
            true,
            ["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        ));
        assert!(filter.is_allowed("10.0.0.1"));
        assert!(filter.is_allowed("10.0.0.2"));
        assert!(!filter.is_allowed("10.0.0.3"));
    }

    #[test]
    fn enabled_empty_rule_denies_everyone() {
        let filter = ConnectionFilter::from_rule(AdmissionRule::new(true, []));
        assert!(!filter.is_allowed("10.0.0.1"));
        assert!(!filter.is_allowed("127.0.0.1"));
    }

    #[test]
    fn reconfigure_is_idempotent_and_deterministic() {
        let filter = ConnectionFilter::allow_all();
        let rule = AdmissionRule::new(true, ["10.0.0.1".to_string()]);

        filter.reconfigure(rule.clone());
        let first = filter.is_allowed("10.0.0.1");
        filter.reconfigure(rule);
        assert_eq!(filter.is_allowed("10.0.0.1"), first);
        assert!(first);

        filter.reconfigure(AdmissionRule::default());
        assert!(filter.is_allowed("203.0.113.7"));
    }

    #[test]
    fn fail_closed_denies_everything() {
        let filter = ConnectionFilter::from_rule(AdmissionRule::new(
            true,
            ["10.0.0.1".to_string()],
        ));
        filter.fail_closed();
        assert!(!filter.is_allowed("10.0.0.1"));
        assert!(!filter.is_allowed("8.8.8.8"));
    }

    #[test]
    fn concurrent_checks_and_reconfigures() {
        use std::sync::Arc;
        let filter = Arc::new(ConnectionFilter::allow_all());
        let mut handles = Vec::new();
        for i in 0..8 {
            let f = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if i % 2 == 0 {
                        f.reconfigure(AdmissionRule::new(true, ["10.0.0.1".to_string()]));
                    } else {
                        // never panics, always a definite answer
                        let _ = f.is_allowed("10.0.0.1");
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(filter.is_allowed("10.0.0.1"));
    }
}
