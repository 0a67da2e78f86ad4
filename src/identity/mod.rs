//! Node identity types.
//!
//! Every installation owns a stable 128-bit [`NodeId`], generated once and
//! persisted by the [`IdentityStore`]. Each process start additionally gets
//! a random session nonce, and the combination forms a [`SessionId`] that
//! distinguishes restarts of the same installation.

mod store;

pub use store::IdentityStore;

use std::fmt;
use thiserror::Error;

/// Errors related to node identity handling.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid node id length: expected 32 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid node id: non-hex character in {0:?}")]
    InvalidHex(String),

    #[error("failed to read identity store {path}: {source}")]
    ReadStore {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write identity store {path}: {source}")]
    WriteStore {
        path: String,
        source: std::io::Error,
    },

    #[error("identity store {0} is present but contains no usable node id")]
    CorruptStore(String),
}

/// Encode bytes as lowercase hex.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Stable 128-bit node identifier, hex-encoded as 32 lowercase characters.
///
/// Generated once per installation and persisted; immutable for the
/// installation's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Create a NodeId from a 16-byte array.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a new random NodeId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Parse a NodeId from its 32-character lowercase hex form.
    ///
    /// This is the strict pattern (`^[0-9a-f]{32}$`) applied to external
    /// overrides; uppercase digits are rejected.
    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        if text.len() != 32 {
            return Err(IdentityError::InvalidLength(text.len()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0]).ok_or_else(|| IdentityError::InvalidHex(text.into()))?;
            let lo = hex_digit(chunk[1]).ok_or_else(|| IdentityError::InvalidHex(text.into()))?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex_encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

/// A NodeId paired with a per-process-start nonce.
///
/// Two sessions with the same node part belong to the same installation;
/// differing nonces mean the process was restarted in between.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    node: NodeId,
    nonce: u32,
}

impl SessionId {
    /// Create a session id with an explicit nonce (tests).
    pub fn new(node: NodeId, nonce: u32) -> Self {
        Self { node, nonce }
    }

    /// Create a fresh session for this process start.
    pub fn fresh(node: NodeId) -> Self {
        Self {
            node,
            nonce: rand::Rng::gen(&mut rand::thread_rng()),
        }
    }

    /// The stable installation id.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The per-start nonce.
    pub fn nonce(&self) -> u32 {
        self.nonce
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:?}:{:08x})", self.node, self.nonce)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.node, self.nonce)
    }
}
