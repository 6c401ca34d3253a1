//! Outbound side: one client actor per peer, owning one data socket.

mod actor;
mod waiter;

pub(crate) use actor::spawn_client;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::CallError;
use crate::protocol::Term;
use crate::types::{NodeId, Uid};

/// A request accepted into a client actor's mailbox.
///
/// Mailbox order is wire order: frames are written to the data socket in the
/// order requests are received here.
pub(crate) enum ClientRequest {
    /// Request/reply invocation.
    Call {
        module: String,
        function: String,
        args: Vec<Term>,
        recv_timeout: Option<Duration>,
        send_timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Term, CallError>>,
    },
    /// Fire-and-forget invocation; `done` resolves once the frame is
    /// written (or the write failed).
    Cast {
        module: String,
        function: String,
        args: Vec<Term>,
        send_timeout: Option<Duration>,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    /// Graceful shutdown.
    Stop,
}

/// Cheap, shareable handle to a client actor.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    pub(crate) peer: NodeId,
    /// Identifies this actor instance; a registry release only takes effect
    /// when the incarnation still matches.
    pub(crate) incarnation: Uid,
    tx: mpsc::UnboundedSender<ClientRequest>,
}

impl ClientHandle {
    pub(crate) fn new(
        peer: NodeId,
        incarnation: Uid,
        tx: mpsc::UnboundedSender<ClientRequest>,
    ) -> Self {
        Self {
            peer,
            incarnation,
            tx,
        }
    }

    /// Enqueue a request; on failure the request is handed back so the
    /// caller can retry against a fresh actor.
    pub(crate) fn send(&self, request: ClientRequest) -> Result<(), ClientRequest> {
        self.tx.send(request).map_err(|rejected| rejected.0)
    }

    /// Whether the actor behind this handle has terminated.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Ask the actor to shut down gracefully.
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(ClientRequest::Stop);
    }
}
