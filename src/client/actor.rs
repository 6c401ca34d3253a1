//! The per-peer client actor.
//!
//! Owns the one data socket to its peer. Requests arrive through the
//! mailbox; replies arrive on the socket and are routed to waiters by call
//! token. The actor's life is bound to its socket: any fatal socket event
//! ends the actor, and the actor terminating closes the socket (the halves
//! are dropped with it). On the way out every pending waiter is failed with
//! the terminating transport error and the registry slot is released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RpcConfig;
use crate::error::{CallError, RpcError, TransportError};
use crate::membership::{PeerResolver, Reachability};
use crate::protocol::{ControlReply, ControlRequest, ReplyEnvelope, ReplyOutcome, Request};
use crate::registry::DispatcherMsg;
use crate::types::{NodeId, Uid};
use crate::wire;

use super::waiter::{self, WaiterSlot};
use super::{ClientHandle, ClientRequest};

/// Spawn a client actor for `peer` and return its handle.
///
/// The actor connects lazily-but-immediately: requests queued while the
/// handshake is in flight are served in order once the socket is up, or
/// failed with the startup error if it never comes up.
pub(crate) fn spawn_client(
    peer: NodeId,
    local: NodeId,
    config: Arc<RpcConfig>,
    resolver: PeerResolver,
    dispatcher: mpsc::UnboundedSender<DispatcherMsg>,
) -> ClientHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = ClientActor {
        peer: peer.clone(),
        local,
        incarnation: Uid::random(),
        config,
        resolver,
        dispatcher,
    };
    let handle = ClientHandle::new(peer, actor.incarnation, tx);
    tokio::spawn(actor.run(rx));
    handle
}

struct ClientActor {
    peer: NodeId,
    local: NodeId,
    incarnation: Uid,
    config: Arc<RpcConfig>,
    resolver: PeerResolver,
    dispatcher: mpsc::UnboundedSender<DispatcherMsg>,
}

impl ClientActor {
    async fn run(self, mut mailbox: mpsc::UnboundedReceiver<ClientRequest>) {
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "client actor failed to start");
                self.release();
                fail_queued(mailbox, err).await;
                return;
            }
        };

        let mut pending: HashMap<Uid, WaiterSlot> = HashMap::new();
        let reason = self.serve(stream, &mut mailbox, &mut pending).await;

        debug!(
            peer = %self.peer,
            pending = pending.len(),
            reason = %reason,
            "client actor terminating"
        );
        self.release();
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(CallError::Transport(reason.clone())));
        }
        fail_queued(mailbox, reason).await;
    }

    /// Resolve, run the port-allocation handshake, open the data socket.
    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let control_addr = self.resolver.resolve(&self.peer).await?;
        let data_port = self.allocate_data_port(control_addr).await?;
        let data_addr = SocketAddr::new(control_addr.ip(), data_port);

        let connect = TcpStream::connect(data_addr);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(TransportError::ConnectFailed {
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::ConnectFailed {
                    reason: format!("timed out after {:?}", self.config.connect_timeout),
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %self.peer, error = %err, "could not disable nagle");
        }
        info!(peer = %self.peer, addr = %data_addr, "data socket established");
        Ok(stream)
    }

    /// Ask the peer's control listener for a dedicated data port.
    async fn allocate_data_port(&self, control_addr: SocketAddr) -> Result<u16, TransportError> {
        let failed = |reason: String| TransportError::HandshakeFailed { reason };

        let handshake = async {
            let mut control = TcpStream::connect(control_addr)
                .await
                .map_err(|e| failed(e.to_string()))?;
            let request = ControlRequest::OpenDataPort {
                node: self.local.clone(),
            };
            let frame = wire::encode_packet(&request).map_err(|e| failed(e.to_string()))?;
            control
                .write_all(&frame)
                .await
                .map_err(|e| failed(e.to_string()))?;

            let mut buf = Vec::with_capacity(128);
            let payload = wire::read_frame(&mut control, &mut buf)
                .await
                .map_err(|e| failed(e.to_string()))?;
            match wire::decode_packet(&payload).map_err(|e| failed(e.to_string()))? {
                ControlReply::DataPort { port } => Ok(port),
                ControlReply::Refused { reason } => Err(failed(reason)),
            }
            // Control connection drops here; it exists only for this exchange.
        };

        match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(failed(format!(
                "timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Steady state: pump the mailbox, the socket, and the idle timer.
    ///
    /// Returns the transport error pending waiters are failed with.
    async fn serve(
        &self,
        stream: TcpStream,
        mailbox: &mut mpsc::UnboundedReceiver<ClientRequest>,
        pending: &mut HashMap<Uid, WaiterSlot>,
    ) -> TransportError {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                request = mailbox.recv() => {
                    let Some(request) = request else {
                        // Every handle dropped; nobody can reach us anymore.
                        return TransportError::Closed;
                    };
                    match self.process_request(request, &mut write_half, pending).await {
                        Ok(ControlFlow::Continue) => last_activity = Instant::now(),
                        Ok(ControlFlow::Stop) => return TransportError::Closed,
                        Err(err) => {
                            warn!(peer = %self.peer, error = %err, "write failed, closing socket");
                            return err;
                        }
                    }
                }

                read = read_half.read_buf(&mut read_buf) => match read {
                    Ok(0) => {
                        debug!(peer = %self.peer, "peer closed the data socket");
                        return TransportError::Closed;
                    }
                    Ok(_) => match route_replies(&self.peer, &mut read_buf, pending) {
                        Ok(true) => last_activity = Instant::now(),
                        Ok(false) => {}
                        Err(err) => {
                            warn!(peer = %self.peer, error = %err, "corrupt reply frame, closing socket");
                            return TransportError::Closed;
                        }
                    },
                    Err(err) => {
                        warn!(peer = %self.peer, error = %err, "read failed, closing socket");
                        return TransportError::Closed;
                    }
                },

                _ = self.config.client_inactivity_timeout.expire_from(last_activity) => {
                    debug!(peer = %self.peer, "idle, closing connection");
                    return TransportError::Closed;
                }
            }
        }
    }

    async fn process_request(
        &self,
        request: ClientRequest,
        write_half: &mut OwnedWriteHalf,
        pending: &mut HashMap<Uid, WaiterSlot>,
    ) -> Result<ControlFlow, TransportError> {
        match request {
            ClientRequest::Call {
                module,
                function,
                args,
                recv_timeout,
                send_timeout,
                reply,
            } => {
                let (recv_timeout, send_timeout) =
                    self.config.merge_timeouts(recv_timeout, send_timeout);

                if self.config.probe_liveness
                    && self.resolver.ping(&self.peer).await == Reachability::Unreachable
                {
                    let _ = reply.send(Err(CallError::Rpc(RpcError::NodeDown)));
                    return Ok(ControlFlow::Continue);
                }

                let call_id = Uid::random();
                let packet = Request::Call {
                    sender: self.local.clone(),
                    waiter: Uid::random(),
                    call_id,
                    module: module.clone(),
                    function: function.clone(),
                    args,
                };
                let frame = match wire::encode_packet(&packet) {
                    Ok(frame) => frame,
                    Err(err) => {
                        // Nothing hit the socket; fail only this call.
                        let _ = reply.send(Err(CallError::Transport(
                            TransportError::SendFailed {
                                reason: err.to_string(),
                            },
                        )));
                        return Ok(ControlFlow::Continue);
                    }
                };

                let slot = waiter::spawn(self.peer.clone(), call_id, recv_timeout, reply);
                pending.insert(call_id, slot);
                self.write_frame(write_half, &frame, send_timeout).await?;
                trace!(
                    peer = %self.peer,
                    call_id = %call_id,
                    module = %module,
                    function = %function,
                    in_flight = pending.len(),
                    "call sent"
                );
                Ok(ControlFlow::Continue)
            }

            ClientRequest::Cast {
                module,
                function,
                args,
                send_timeout,
                done,
            } => {
                let (_, send_timeout) = self.config.merge_timeouts(None, send_timeout);

                if self.config.probe_liveness
                    && self.resolver.ping(&self.peer).await == Reachability::Unreachable
                {
                    // Fire-and-forget: an unreachable peer is logged, not
                    // surfaced.
                    warn!(
                        peer = %self.peer,
                        module = %module,
                        function = %function,
                        "dropping cast to unreachable peer"
                    );
                    let _ = done.send(Ok(()));
                    return Ok(ControlFlow::Continue);
                }

                let packet = Request::Cast {
                    sender: self.local.clone(),
                    module: module.clone(),
                    function: function.clone(),
                    args,
                };
                let frame = match wire::encode_packet(&packet) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = done.send(Err(CallError::Transport(
                            TransportError::SendFailed {
                                reason: err.to_string(),
                            },
                        )));
                        return Ok(ControlFlow::Continue);
                    }
                };

                match self.write_frame(write_half, &frame, send_timeout).await {
                    Ok(()) => {
                        trace!(peer = %self.peer, module = %module, function = %function, "cast sent");
                        let _ = done.send(Ok(()));
                        Ok(ControlFlow::Continue)
                    }
                    Err(err) => {
                        let _ = done.send(Err(CallError::Transport(err.clone())));
                        Err(err)
                    }
                }
            }

            ClientRequest::Stop => {
                debug!(peer = %self.peer, "stop requested");
                Ok(ControlFlow::Stop)
            }
        }
    }

    async fn write_frame(
        &self,
        write_half: &mut OwnedWriteHalf,
        frame: &[u8],
        send_timeout: Duration,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(send_timeout, write_half.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TransportError::SendFailed {
                reason: err.to_string(),
            }),
            Err(_) => Err(TransportError::SendFailed {
                reason: format!("send timed out after {:?}", send_timeout),
            }),
        }
    }

    fn release(&self) {
        let _ = self.dispatcher.send(DispatcherMsg::Release {
            peer: self.peer.clone(),
            incarnation: self.incarnation,
        });
    }
}

enum ControlFlow {
    Continue,
    Stop,
}

/// Drain complete reply frames and deliver them to their waiters.
///
/// Returns whether any frame was processed. An undecodable routing envelope
/// is fatal (the stream can no longer be trusted); a malformed outcome only
/// fails the one call it addressed.
fn route_replies(
    peer: &NodeId,
    read_buf: &mut Vec<u8>,
    pending: &mut HashMap<Uid, WaiterSlot>,
) -> Result<bool, wire::FrameError> {
    let mut routed = false;
    while let Some(payload) = wire::try_take_frame(read_buf)? {
        let envelope: ReplyEnvelope = wire::decode_packet(&payload)?;
        routed = true;

        let Some(slot) = pending.remove(&envelope.call_id) else {
            // Waiter already timed out; late replies are dropped on the
            // floor.
            trace!(
                peer = %peer,
                call_id = %envelope.call_id,
                waiter = %envelope.waiter,
                "discarding unrouted reply"
            );
            continue;
        };

        let call_id = envelope.call_id;
        let verdict = match envelope.interpret() {
            Ok(ReplyOutcome::Value(value)) => Ok(value),
            Ok(ReplyOutcome::Error(remote)) => Err(CallError::Rpc(remote.into())),
            Err(err) => {
                debug!(
                    peer = %peer,
                    call_id = %call_id,
                    error = %err,
                    "reply outcome did not decode"
                );
                Err(CallError::Rpc(RpcError::InvalidMessage))
            }
        };
        if slot.send(verdict).is_err() {
            trace!(peer = %peer, call_id = %call_id, "waiter gone, reply dropped");
        }
    }
    Ok(routed)
}

/// Fail requests that were queued but never admitted to the socket.
///
/// Keeps draining until every handle to this mailbox is gone, so a caller
/// holding a live handle always learns the actual terminating error instead
/// of finding a closed channel. The registry slot was released before this
/// runs, so the loop ends as soon as the last in-flight handle drops.
async fn fail_queued(mut mailbox: mpsc::UnboundedReceiver<ClientRequest>, reason: TransportError) {
    while let Some(request) = mailbox.recv().await {
        match request {
            ClientRequest::Call { reply, .. } => {
                let _ = reply.send(Err(CallError::Transport(reason.clone())));
            }
            ClientRequest::Cast { done, .. } => {
                let _ = done.send(Err(CallError::Transport(reason.clone())));
            }
            ClientRequest::Stop => {}
        }
    }
}
