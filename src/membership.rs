//! Cluster membership contract and peer address resolution.
//!
//! The transport does not track cluster membership itself; it consumes a
//! [`Membership`] implementation for name → address mapping and optional
//! liveness probing. [`StaticMembership`] is the table-backed implementation
//! used for static topologies and tests.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::config::RpcConfig;
use crate::error::TransportError;
use crate::types::NodeId;

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// The peer answered the probe.
    Reachable,
    /// The peer did not answer the probe.
    Unreachable,
}

/// Cluster membership and liveness, as seen by the transport.
#[async_trait]
pub trait Membership: Send + Sync + 'static {
    /// Probe whether `peer` is currently alive.
    async fn ping(&self, peer: &NodeId) -> Reachability;

    /// IP address of `peer`'s listeners, or `None` for unknown peers.
    async fn address_of(&self, peer: &NodeId) -> Option<IpAddr>;
}

/// Table-backed membership for static topologies.
pub struct StaticMembership {
    peers: RwLock<HashMap<NodeId, IpAddr>>,
}

impl StaticMembership {
    /// Empty membership table.
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or re-register) a peer's address.
    pub fn add_peer(&self, peer: NodeId, addr: IpAddr) {
        self.peers
            .write()
            .expect("membership table lock poisoned")
            .insert(peer, addr);
    }

    /// Forget a peer. Subsequent resolutions fail with `UnknownPeer`.
    pub fn remove_peer(&self, peer: &NodeId) {
        self.peers
            .write()
            .expect("membership table lock poisoned")
            .remove(peer);
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn ping(&self, peer: &NodeId) -> Reachability {
        let known = self
            .peers
            .read()
            .expect("membership table lock poisoned")
            .contains_key(peer);
        if known {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        }
    }

    async fn address_of(&self, peer: &NodeId) -> Option<IpAddr> {
        self.peers
            .read()
            .expect("membership table lock poisoned")
            .get(peer)
            .copied()
    }
}

/// Resolves a peer name to the socket address of its control listener.
#[derive(Clone)]
pub(crate) struct PeerResolver {
    local: NodeId,
    local_control_port: u16,
    membership: Arc<dyn Membership>,
    config: Arc<RpcConfig>,
}

impl PeerResolver {
    pub(crate) fn new(
        local: NodeId,
        local_control_port: u16,
        membership: Arc<dyn Membership>,
        config: Arc<RpcConfig>,
    ) -> Self {
        Self {
            local,
            local_control_port,
            membership,
            config,
        }
    }

    /// Control-listener address for `peer`.
    ///
    /// The local node resolves to loopback, so the same pipeline serves
    /// self-calls without a special case in callers. Unknown peers fail with
    /// [`TransportError::UnknownPeer`].
    pub(crate) async fn resolve(&self, peer: &NodeId) -> Result<SocketAddr, TransportError> {
        if *peer == self.local {
            return Ok(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.local_control_port,
            ));
        }
        let ip = self
            .membership
            .address_of(peer)
            .await
            .ok_or(TransportError::UnknownPeer)?;
        Ok(SocketAddr::new(ip, self.config.control_port_of(peer)))
    }

    pub(crate) async fn ping(&self, peer: &NodeId) -> Reachability {
        self.membership.ping(peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(config: RpcConfig) -> (PeerResolver, Arc<StaticMembership>) {
        let membership = Arc::new(StaticMembership::new());
        let resolver = PeerResolver::new(
            NodeId::new("local@cluster"),
            4500,
            membership.clone(),
            Arc::new(config),
        );
        (resolver, membership)
    }

    #[tokio::test]
    async fn local_node_resolves_to_loopback() {
        let (resolver, _membership) = resolver(RpcConfig::default());
        let addr = resolver
            .resolve(&NodeId::new("local@cluster"))
            .await
            .expect("resolve");
        assert_eq!(addr, "127.0.0.1:4500".parse().expect("addr"));
    }

    #[tokio::test]
    async fn known_peer_resolves_through_membership() {
        let (resolver, membership) = resolver(RpcConfig::default());
        membership.add_peer(
            NodeId::new("b@cluster"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        );

        let addr = resolver
            .resolve(&NodeId::new("b@cluster"))
            .await
            .expect("resolve");
        assert_eq!(
            addr,
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                crate::config::DEFAULT_CONTROL_PORT
            )
        );
    }

    #[tokio::test]
    async fn per_peer_control_port_override_wins() {
        let mut config = RpcConfig::default();
        config
            .remote_control_ports
            .insert(NodeId::new("b@cluster"), 7001);
        let (resolver, membership) = resolver(config);
        membership.add_peer(
            NodeId::new("b@cluster"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        );

        let addr = resolver
            .resolve(&NodeId::new("b@cluster"))
            .await
            .expect("resolve");
        assert_eq!(addr.port(), 7001);
    }

    #[tokio::test]
    async fn unknown_peer_fails_resolution() {
        let (resolver, _membership) = resolver(RpcConfig::default());
        let result = resolver.resolve(&NodeId::new("ghost@cluster")).await;
        assert_eq!(result, Err(TransportError::UnknownPeer));
    }

    #[tokio::test]
    async fn removed_peer_becomes_unreachable() {
        let (resolver, membership) = resolver(RpcConfig::default());
        let peer = NodeId::new("b@cluster");
        membership.add_peer(peer.clone(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(resolver.ping(&peer).await, Reachability::Reachable);

        membership.remove_peer(&peer);
        assert_eq!(resolver.ping(&peer).await, Reachability::Unreachable);
    }
}
