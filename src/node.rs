//! The root object tying both halves of a node together.
//!
//! An [`RpcNode`] owns the serving side (control listener + acceptors), the
//! client registry, and the dispatcher. Client actors are created on demand
//! through the dispatcher and reaped on inactivity; a caller that finds a
//! dead handle retries once through the dispatcher, which is the whole
//! restart policy — nothing restarts automatically against an unreachable
//! peer, the next request does.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::{ClientHandle, ClientRequest};
use crate::config::{CallOpts, RpcConfig};
use crate::error::{CallError, TransportError};
use crate::handler::Invoker;
use crate::membership::{Membership, PeerResolver};
use crate::protocol::Term;
use crate::registry::{spawn_dispatcher, ClientRegistry, DispatcherMsg};
use crate::server::Server;
use crate::types::NodeId;

/// One cluster node's RPC endpoint: serves inbound peers and calls out to
/// remote ones.
pub struct RpcNode {
    local: NodeId,
    registry: ClientRegistry,
    dispatcher: mpsc::UnboundedSender<DispatcherMsg>,
    dispatcher_handle: JoinHandle<()>,
    server: Server,
}

impl RpcNode {
    /// Start a node: bind the control listener, start the dispatcher.
    ///
    /// `membership` supplies peer addressing and liveness; `invoker` executes
    /// inbound invocations.
    pub async fn start(
        local: NodeId,
        config: RpcConfig,
        membership: Arc<dyn Membership>,
        invoker: Arc<dyn Invoker>,
    ) -> Result<Self, TransportError> {
        let config = Arc::new(config);
        let server = Server::bind(config.clone(), invoker).await?;
        let resolver = PeerResolver::new(local.clone(), server.port(), membership, config.clone());
        let registry = ClientRegistry::default();
        let (dispatcher, dispatcher_handle) =
            spawn_dispatcher(registry.clone(), local.clone(), config, resolver);

        info!(node = %local, port = server.port(), "node started");
        Ok(Self {
            local,
            registry,
            dispatcher,
            dispatcher_handle,
            server,
        })
    }

    /// This node's name.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Effective control-listener port.
    pub fn control_port(&self) -> u16 {
        self.server.port()
    }

    /// Peers with a live outbound connection right now.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.registry.peers()
    }

    /// Invoke `module:function(args)` on `peer` and await the result, with
    /// the configured default timeouts.
    pub async fn call(
        &self,
        peer: &NodeId,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Term, CallError> {
        self.call_with(peer, module, function, args, CallOpts::default())
            .await
    }

    /// [`RpcNode::call`] with per-request timeout overrides.
    pub async fn call_with(
        &self,
        peer: &NodeId,
        module: &str,
        function: &str,
        args: Vec<Term>,
        opts: CallOpts,
    ) -> Result<Term, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ClientRequest::Call {
            module: module.to_string(),
            function: function.to_string(),
            args,
            recv_timeout: opts.recv_timeout,
            send_timeout: opts.send_timeout,
            reply: reply_tx,
        };
        self.enqueue(peer, request).await?;
        reply_rx
            .await
            .map_err(|_| CallError::Transport(TransportError::Closed))?
    }

    /// Fire-and-forget `module:function(args)` on `peer`. Resolves once the
    /// frame is written; says nothing about execution.
    pub async fn cast(
        &self,
        peer: &NodeId,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<(), CallError> {
        self.cast_with(peer, module, function, args, None).await
    }

    /// [`RpcNode::cast`] with a send-timeout override.
    pub async fn cast_with(
        &self,
        peer: &NodeId,
        module: &str,
        function: &str,
        args: Vec<Term>,
        send_timeout: Option<Duration>,
    ) -> Result<(), CallError> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = ClientRequest::Cast {
            module: module.to_string(),
            function: function.to_string(),
            args,
            send_timeout,
            done: done_tx,
        };
        self.enqueue(peer, request).await?;
        done_rx
            .await
            .map_err(|_| CallError::Transport(TransportError::Closed))?
    }

    /// Gracefully stop the client actor for `peer`, if one is running.
    pub fn stop(&self, peer: &NodeId) {
        if let Some(handle) = self.registry.get(peer) {
            handle.stop();
        }
    }

    /// Stop every client actor and the serving side.
    pub fn shutdown(&self) {
        for handle in self.registry.handles() {
            handle.stop();
        }
        // Dropping the registry entries lets terminating actors finish
        // draining even though the dispatcher stops processing releases.
        self.registry.clear();
        self.server.shutdown();
        self.dispatcher_handle.abort();
    }

    /// Hand a request to `peer`'s client actor, creating it on demand.
    async fn enqueue(&self, peer: &NodeId, request: ClientRequest) -> Result<(), CallError> {
        // Hot path: an established peer is served straight from the shared
        // map, without a dispatcher round-trip.
        let handle = match self.registry.get(peer) {
            Some(handle) if !handle.is_closed() => handle,
            _ => self.acquire(peer).await?,
        };
        match handle.send(request) {
            Ok(()) => Ok(()),
            Err(request) => {
                // The actor died between lookup and enqueue (idle reap or
                // socket failure). One recreate, then give up.
                let fresh = self.acquire(peer).await?;
                fresh
                    .send(request)
                    .map_err(|_| CallError::Transport(TransportError::Closed))?;
                Ok(())
            }
        }
    }

    async fn acquire(&self, peer: &NodeId) -> Result<ClientHandle, CallError> {
        let (reply, rx) = oneshot::channel();
        self.dispatcher
            .send(DispatcherMsg::Acquire {
                peer: peer.clone(),
                reply,
            })
            .map_err(|_| CallError::Transport(TransportError::Closed))?;
        rx.await
            .map_err(|_| CallError::Transport(TransportError::Closed))
    }
}

impl Drop for RpcNode {
    fn drop(&mut self) {
        self.server.shutdown();
        self.dispatcher_handle.abort();
    }
}
