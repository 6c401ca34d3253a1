//! Error taxonomy surfaced to callers.
//!
//! Two families with very different blast radii:
//!
//! - [`RpcError`]: per-call failures. The connection stays up; only the one
//!   call is affected.
//! - [`TransportError`]: connection-level failures. Fatal to the owning
//!   client actor — the socket is closed and every in-flight waiter is
//!   failed with the error.

use thiserror::Error;

use crate::protocol::RemoteError;

/// Per-call failure. Does not disturb the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The target module is blocked by the serving node's policy.
    #[error("call not allowed by remote policy")]
    NotAllowed,

    /// The membership layer reported the peer unreachable before send.
    #[error("peer node is down")]
    NodeDown,

    /// The receive timeout elapsed before a reply arrived.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The invoked function crashed on the serving side.
    #[error("remote function crashed: {reason}")]
    Crash {
        /// Crash diagnostic from the serving side.
        reason: String,
    },

    /// The serving side returned a reply this node could not interpret.
    #[error("remote returned a malformed reply")]
    InvalidMessage,
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotAllowed => RpcError::NotAllowed,
            RemoteError::Crash { reason } => RpcError::Crash { reason },
            RemoteError::InvalidMessage => RpcError::InvalidMessage,
        }
    }
}

/// Connection-level failure. Fatal to the owning client actor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer is not known to the membership layer.
    #[error("unknown peer node")]
    UnknownPeer,

    /// The data-port allocation handshake failed.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// What went wrong on the control channel.
        reason: String,
    },

    /// The data socket could not be opened.
    #[error("connect failed: {reason}")]
    ConnectFailed {
        /// Connect diagnostic.
        reason: String,
    },

    /// A frame could not be written within the send timeout.
    #[error("send failed: {reason}")]
    SendFailed {
        /// Write diagnostic (including timeout).
        reason: String,
    },

    /// The socket dropped while a call was in flight, or the actor shut
    /// down underneath its callers.
    #[error("connection closed")]
    Closed,

    /// A listener could not be bound.
    #[error("bind failed: {reason}")]
    BindFailed {
        /// Bind diagnostic.
        reason: String,
    },
}

/// Anything a `call` or `cast` can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Per-call failure; the connection survives.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Connection-level failure; the owning actor is gone.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Whether this error was fatal to the underlying connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, CallError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_map_onto_rpc_errors() {
        assert_eq!(RpcError::from(RemoteError::NotAllowed), RpcError::NotAllowed);
        assert_eq!(
            RpcError::from(RemoteError::Crash {
                reason: "badarith".to_string()
            }),
            RpcError::Crash {
                reason: "badarith".to_string()
            }
        );
        assert_eq!(
            RpcError::from(RemoteError::InvalidMessage),
            RpcError::InvalidMessage
        );
    }

    #[test]
    fn call_error_classifies_families() {
        let rpc: CallError = RpcError::Timeout.into();
        let transport: CallError = TransportError::Closed.into();
        assert!(!rpc.is_transport());
        assert!(transport.is_transport());
    }

    #[test]
    fn display_is_stable_enough_to_log() {
        let err = TransportError::SendFailed {
            reason: "send timeout after 5s".to_string(),
        };
        assert_eq!(err.to_string(), "send failed: send timeout after 5s");
    }
}
