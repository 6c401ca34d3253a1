//! Core identity types: peer names and 128-bit routing tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a cluster node.
///
/// Names are opaque, globally unique within the cluster, and compared for
/// equality only: two peers with the same name are the same peer. The set of
/// node names is small and bounded (the cluster membership), so cloning the
/// backing string is cheap enough for the hot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any string-like name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// 128-bit random token.
///
/// Tokens identify in-flight calls (the `call_id` a reply is routed by),
/// reply slots (the `waiter` field carried for audit and return-path
/// addressing), and client-actor incarnations (so a stale actor can never
/// evict its successor from the registry).
///
/// A token is unforgeable in practice: both halves come from the process
/// RNG, and a call token is never reused within the lifetime of the socket
/// it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Uid {
    /// High 64 bits.
    pub first: u64,
    /// Low 64 bits.
    pub second: u64,
}

impl Uid {
    /// Create a token with explicit halves.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Generate a fresh random token.
    pub fn random() -> Self {
        Self {
            first: rand::random(),
            second: rand::random(),
        }
    }

    /// Whether the token is non-zero.
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}
