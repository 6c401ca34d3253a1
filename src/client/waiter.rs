//! Call-waiters: one short-lived task per in-flight call.
//!
//! A waiter owns exactly one call's reply slot and races it against the
//! call's receive timeout, so a slow reply can never delay unrelated calls
//! through the client actor's event loop. The actor keeps only the slot
//! sender in its pending map; everything else about the call lives here.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{CallError, RpcError, TransportError};
use crate::protocol::Term;
use crate::types::{NodeId, Uid};

/// The actor's side of a waiter: where the routed reply is posted.
pub(crate) type WaiterSlot = oneshot::Sender<Result<Term, CallError>>;

/// Spawn a waiter for one call.
///
/// The returned slot goes into the actor's pending map. The waiter resolves
/// the caller exactly once, with the routed reply, with
/// [`RpcError::Timeout`] when `recv_timeout` elapses first, or with
/// [`TransportError::Closed`] when the owning actor dies and drops the slot.
pub(crate) fn spawn(
    peer: NodeId,
    call_id: Uid,
    recv_timeout: Duration,
    caller: oneshot::Sender<Result<Term, CallError>>,
) -> WaiterSlot {
    let (slot_tx, slot_rx) = oneshot::channel();
    tokio::spawn(async move {
        let verdict = tokio::select! {
            routed = slot_rx => match routed {
                Ok(verdict) => verdict,
                Err(_) => Err(CallError::Transport(TransportError::Closed)),
            },
            _ = tokio::time::sleep(recv_timeout) => {
                tracing::debug!(
                    peer = %peer,
                    call_id = %call_id,
                    timeout_ms = recv_timeout.as_millis() as u64,
                    "call timed out waiting for reply"
                );
                Err(CallError::Rpc(RpcError::Timeout))
            }
        };
        // The caller may itself have gone away; nothing left to do then.
        let _ = caller.send(verdict);
    });
    slot_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> (
        oneshot::Sender<Result<Term, CallError>>,
        oneshot::Receiver<Result<Term, CallError>>,
    ) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn delivers_routed_reply() {
        let (tx, rx) = caller();
        let slot = spawn(
            NodeId::new("b@cluster"),
            Uid::random(),
            Duration::from_secs(5),
            tx,
        );

        slot.send(Ok(Term::Int(5))).expect("waiter alive");
        assert_eq!(rx.await.expect("verdict"), Ok(Term::Int(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_reply() {
        let (tx, rx) = caller();
        let _slot = spawn(
            NodeId::new("b@cluster"),
            Uid::random(),
            Duration::from_millis(100),
            tx,
        );

        assert_eq!(
            rx.await.expect("verdict"),
            Err(CallError::Rpc(RpcError::Timeout))
        );
    }

    #[tokio::test]
    async fn actor_death_surfaces_as_closed() {
        let (tx, rx) = caller();
        let slot = spawn(
            NodeId::new("b@cluster"),
            Uid::random(),
            Duration::from_secs(5),
            tx,
        );

        drop(slot);
        assert_eq!(
            rx.await.expect("verdict"),
            Err(CallError::Transport(TransportError::Closed))
        );
    }

    #[tokio::test]
    async fn transport_failure_is_forwarded() {
        let (tx, rx) = caller();
        let slot = spawn(
            NodeId::new("b@cluster"),
            Uid::random(),
            Duration::from_secs(5),
            tx,
        );

        slot.send(Err(CallError::Transport(TransportError::SendFailed {
            reason: "broken pipe".to_string(),
        })))
        .expect("waiter alive");
        assert_eq!(
            rx.await.expect("verdict"),
            Err(CallError::Transport(TransportError::SendFailed {
                reason: "broken pipe".to_string()
            }))
        );
    }
}
