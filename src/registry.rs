//! Client registry and the dispatcher that owns its mutations.
//!
//! The registry is the only shared mutable state in the crate: a peer-name →
//! client-handle map, read by every caller on the hot path and written by
//! exactly one task, the dispatcher. Serializing creation behind the
//! dispatcher is what upholds the one-actor-per-peer invariant: two callers
//! racing on a cold peer both reach the dispatcher, and the second request
//! finds the handle the first one created.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::{spawn_client, ClientHandle};
use crate::config::RpcConfig;
use crate::membership::PeerResolver;
use crate::types::{NodeId, Uid};

/// Shared read view of the per-peer client actors.
#[derive(Clone, Default)]
pub(crate) struct ClientRegistry {
    map: Arc<RwLock<HashMap<NodeId, ClientHandle>>>,
}

impl ClientRegistry {
    /// Hot-path lookup. Callers fall back to the dispatcher on a miss.
    pub(crate) fn get(&self, peer: &NodeId) -> Option<ClientHandle> {
        self.map
            .read()
            .expect("client registry lock poisoned")
            .get(peer)
            .cloned()
    }

    /// Peers with a registered client actor.
    pub(crate) fn peers(&self) -> Vec<NodeId> {
        self.map
            .read()
            .expect("client registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of all handles (used for shutdown fan-out).
    pub(crate) fn handles(&self) -> Vec<ClientHandle> {
        self.map
            .read()
            .expect("client registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Drop every handle at once (node shutdown, after the stop fan-out).
    pub(crate) fn clear(&self) {
        self.map
            .write()
            .expect("client registry lock poisoned")
            .clear();
    }

    fn insert(&self, handle: ClientHandle) {
        self.map
            .write()
            .expect("client registry lock poisoned")
            .insert(handle.peer.clone(), handle);
    }

    /// Remove `peer`'s entry, but only if it still belongs to the given
    /// actor incarnation. A release from a dead actor must never evict the
    /// fresh actor that already replaced it.
    fn remove_if(&self, peer: &NodeId, incarnation: Uid) {
        let mut map = self.map.write().expect("client registry lock poisoned");
        if map
            .get(peer)
            .is_some_and(|handle| handle.incarnation == incarnation)
        {
            map.remove(peer);
        }
    }
}

/// Messages served by the dispatcher task.
pub(crate) enum DispatcherMsg {
    /// Look up the client actor for `peer`, creating it if missing.
    Acquire {
        peer: NodeId,
        reply: oneshot::Sender<ClientHandle>,
    },
    /// A terminating actor giving back its registry slot.
    Release { peer: NodeId, incarnation: Uid },
}

/// Spawn the dispatcher task.
pub(crate) fn spawn_dispatcher(
    registry: ClientRegistry,
    local: NodeId,
    config: Arc<RpcConfig>,
    resolver: PeerResolver,
) -> (mpsc::UnboundedSender<DispatcherMsg>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher_tx = tx.clone();

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                DispatcherMsg::Acquire { peer, reply } => {
                    let handle = match registry.get(&peer) {
                        Some(existing) if !existing.is_closed() => existing,
                        _ => {
                            debug!(peer = %peer, "creating client actor");
                            let created = spawn_client(
                                peer.clone(),
                                local.clone(),
                                config.clone(),
                                resolver.clone(),
                                dispatcher_tx.clone(),
                            );
                            registry.insert(created.clone());
                            created
                        }
                    };
                    // The requester may have gone away; that is fine.
                    let _ = reply.send(handle);
                }
                DispatcherMsg::Release { peer, incarnation } => {
                    trace!(peer = %peer, incarnation = %incarnation, "releasing client slot");
                    registry.remove_if(&peer, incarnation);
                }
            }
        }
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticMembership;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A control listener that accepts and then never answers, keeping
    /// client actors parked in their handshake.
    async fn silent_listener() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                held.push(tokio::spawn(async move {
                    let mut sink = [0u8; 64];
                    while let Ok(n) = stream.read(&mut sink).await {
                        if n == 0 {
                            return;
                        }
                    }
                }));
            }
        });
        (port, handle)
    }

    async fn dispatcher_fixture(
        peer_port: u16,
    ) -> (
        ClientRegistry,
        mpsc::UnboundedSender<DispatcherMsg>,
        JoinHandle<()>,
    ) {
        let local = NodeId::new("local@cluster");
        let membership = Arc::new(StaticMembership::new());
        membership.add_peer(
            NodeId::new("b@cluster"),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let mut config = RpcConfig::local_network();
        config.connect_timeout = std::time::Duration::from_secs(30);
        config
            .remote_control_ports
            .insert(NodeId::new("b@cluster"), peer_port);
        let config = Arc::new(config);
        let registry = ClientRegistry::default();
        let resolver = PeerResolver::new(local.clone(), 0, membership, config.clone());
        let (tx, handle) = spawn_dispatcher(registry.clone(), local, config, resolver);
        (registry, tx, handle)
    }

    async fn acquire(tx: &mpsc::UnboundedSender<DispatcherMsg>, peer: &NodeId) -> ClientHandle {
        let (reply, rx) = oneshot::channel();
        tx.send(DispatcherMsg::Acquire {
            peer: peer.clone(),
            reply,
        })
        .expect("dispatcher alive");
        rx.await.expect("dispatcher replies")
    }

    #[tokio::test]
    async fn concurrent_acquires_observe_one_actor() {
        let (port, listener) = silent_listener().await;
        let (registry, tx, dispatcher) = dispatcher_fixture(port).await;
        let peer = NodeId::new("b@cluster");

        let first = acquire(&tx, &peer).await;
        let second = acquire(&tx, &peer).await;

        assert_eq!(first.incarnation, second.incarnation);
        assert_eq!(registry.peers(), vec![peer]);

        dispatcher.abort();
        listener.abort();
    }

    #[tokio::test]
    async fn stale_release_does_not_evict_fresh_actor() {
        let (port, listener) = silent_listener().await;
        let (registry, tx, dispatcher) = dispatcher_fixture(port).await;
        let peer = NodeId::new("b@cluster");

        let handle = acquire(&tx, &peer).await;

        // A release from some older incarnation is ignored.
        tx.send(DispatcherMsg::Release {
            peer: peer.clone(),
            incarnation: Uid::random(),
        })
        .expect("dispatcher alive");
        tokio::task::yield_now().await;
        assert!(registry.get(&peer).is_some());

        // The matching release takes the slot out.
        tx.send(DispatcherMsg::Release {
            peer: peer.clone(),
            incarnation: handle.incarnation,
        })
        .expect("dispatcher alive");
        let mut evicted = false;
        for _ in 0..100 {
            if registry.get(&peer).is_none() {
                evicted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(evicted, "matching release should evict the slot");

        dispatcher.abort();
        listener.abort();
    }

    #[tokio::test]
    async fn failed_startup_surfaces_its_error_and_frees_the_slot() {
        use crate::client::ClientRequest;
        use crate::error::{CallError, TransportError};

        // A port nobody listens on: startup fails fast and the actor dies.
        let dead_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            probe.local_addr().expect("addr").port()
        };
        let (_registry, tx, dispatcher) = dispatcher_fixture(dead_port).await;
        let peer = NodeId::new("b@cluster");

        let first = acquire(&tx, &peer).await;

        // A request queued on the doomed actor reports the startup failure,
        // not a generic closed channel.
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = first.send(ClientRequest::Call {
            module: "math".to_string(),
            function: "add".to_string(),
            args: vec![],
            recv_timeout: None,
            send_timeout: None,
            reply: reply_tx,
        });
        assert!(queued.is_ok(), "a live handle always admits requests");
        let verdict = reply_rx.await.expect("doomed actor answers its backlog");
        assert!(
            matches!(
                verdict,
                Err(CallError::Transport(TransportError::HandshakeFailed { .. }))
            ),
            "unexpected verdict: {verdict:?}"
        );

        // The slot was released on the way out; the next acquire builds a
        // fresh actor.
        let second = acquire(&tx, &peer).await;
        assert_ne!(first.incarnation, second.incarnation);

        dispatcher.abort();
    }
}
