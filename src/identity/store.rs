//! Persisted node identity.
//!
//! The store is a single key/value record (`nodeId=<hex>`) in a properties
//! file under the state directory. It is read once at startup and never
//! overwritten while present; regenerating an id for an installation that
//! already has one would break every remote node's knowledge of it.

use super::{IdentityError, NodeId};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STORE_FILENAME: &str = "node.properties";
const NODE_ID_KEY: &str = "nodeId";

/// File-backed store for the installation's NodeId.
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Create a store rooted at the given state directory.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(STORE_FILENAME),
        }
    }

    /// Resolve the node id for this installation.
    ///
    /// Order of precedence:
    /// 1. A configured override matching the strict hex pattern. A malformed
    ///    override is rejected with a warning and resolution continues.
    /// 2. The persisted id, if the store file exists.
    /// 3. A freshly generated id, which is persisted before being returned.
    ///
    /// Any error here is fatal to startup; identity is foundational to
    /// every other component.
    pub fn resolve(&self, override_value: Option<&str>) -> Result<NodeId, IdentityError> {
        if let Some(text) = override_value {
            match NodeId::parse(text) {
                Ok(id) => {
                    info!(node_id = %id, "Using configured node id override");
                    return Ok(id);
                }
                Err(e) => {
                    warn!(
                        value = %text,
                        error = %e,
                        "Ignoring malformed node id override; falling back to persisted id"
                    );
                }
            }
        }

        if self.path.exists() {
            return self.read_persisted();
        }

        let id = NodeId::random();
        self.persist(&id)?;
        info!(node_id = %id, path = %self.path.display(), "Generated and persisted new node id");
        Ok(id)
    }

    fn read_persisted(&self) -> Result<NodeId, IdentityError> {
        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| IdentityError::ReadStore {
                path: self.path.display().to_string(),
                source: e,
            })?;

        for line in contents.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix(NODE_ID_KEY).and_then(|r| {
                r.trim_start().strip_prefix('=').map(str::trim)
            }) {
                return NodeId::parse(value)
                    .map_err(|_| IdentityError::CorruptStore(self.path.display().to_string()));
            }
        }
        Err(IdentityError::CorruptStore(self.path.display().to_string()))
    }

    fn persist(&self, id: &NodeId) -> Result<(), IdentityError> {
        let write_err = |e| IdentityError::WriteStore {
            path: self.path.display().to_string(),
            source: e,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        // write-then-rename so a crash cannot leave a truncated record
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}={}\n", NODE_ID_KEY, id)).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)
    }
}
