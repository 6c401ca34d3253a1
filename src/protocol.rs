//! Protocol packets exchanged between peers.
//!
//! Three packet families share the framing from [`crate::wire`]:
//!
//! - control packets, spoken only on the short-lived control connection used
//!   to allocate a dedicated data port;
//! - requests, spoken client → server on the data socket;
//! - replies, spoken server → client on the same data socket.
//!
//! All packets serialize as externally tagged values, so the encoding is
//! self-describing: a decoder always knows which variant it is looking at
//! before it commits to a shape.

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, Uid};

/// A protocol value: the argument and result vocabulary of remote calls.
///
/// Deliberately small — tuples, atoms (short interned names), integers,
/// binaries, and lists compose into everything the invocation layer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// Short symbolic name.
    Atom(String),
    /// Signed integer.
    Int(i64),
    /// Opaque byte payload.
    Binary(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Term>),
    /// Fixed-shape grouping of values.
    Tuple(Vec<Term>),
}

impl Term {
    /// Convenience constructor for [`Term::Atom`].
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    /// The integer payload, if this is an [`Term::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The atom name, if this is an [`Term::Atom`].
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(name) => Some(name),
            _ => None,
        }
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Term::Int(v)
    }
}

/// Client → server request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Invocation that expects a [`Reply`] routed back by `call_id`.
    ///
    /// `sender` and `waiter` identify the originating node and its reply
    /// slot; replies travel back on the same data socket, but the originator
    /// identity is retained for audit and authorization hooks.
    Call {
        /// Originating node.
        sender: NodeId,
        /// Reply-slot token on the originating node.
        waiter: Uid,
        /// Token the reply is routed by.
        call_id: Uid,
        /// Target module.
        module: String,
        /// Target function.
        function: String,
        /// Call arguments.
        args: Vec<Term>,
    },

    /// Fire-and-forget invocation. No reply, ever.
    Cast {
        /// Originating node.
        sender: NodeId,
        /// Target module.
        module: String,
        /// Target function.
        function: String,
        /// Call arguments.
        args: Vec<Term>,
    },
}

impl Request {
    /// The originating node carried in the packet.
    pub fn sender(&self) -> &NodeId {
        match self {
            Request::Call { sender, .. } | Request::Cast { sender, .. } => sender,
        }
    }
}

/// Error produced on the serving side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteError {
    /// The target module is blocked by the serving node's policy.
    NotAllowed,
    /// The invoked function crashed.
    Crash {
        /// Crash diagnostic.
        reason: String,
    },
    /// The request could not be interpreted by the executor.
    InvalidMessage,
}

/// Result of a call, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// The function's return value.
    Value(Term),
    /// A serving-side error.
    Error(RemoteError),
}

/// Server → client reply, routed to a waiter by `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Reply-slot token echoed from the request.
    pub waiter: Uid,
    /// Call token echoed from the request.
    pub call_id: Uid,
    /// Call outcome.
    pub outcome: ReplyOutcome,
}

/// The routing envelope of a reply, decoded before its payload.
///
/// Replies are decoded in two stages: the envelope (waiter and call token)
/// must parse or the stream is considered desynchronized and the socket is
/// closed; the outcome value is interpreted afterwards, and a malformed
/// outcome only fails the one call it was addressed to.
#[derive(Debug, Deserialize)]
pub(crate) struct ReplyEnvelope {
    pub waiter: Uid,
    pub call_id: Uid,
    pub outcome: serde_json::Value,
}

impl ReplyEnvelope {
    /// Interpret the outcome payload.
    pub(crate) fn interpret(self) -> Result<ReplyOutcome, serde_json::Error> {
        serde_json::from_value(self.outcome)
    }
}

/// Client → listener control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    /// Ask the serving node to allocate a dedicated data port for the
    /// requesting node.
    OpenDataPort {
        /// The requesting node's name.
        node: NodeId,
    },
}

/// Listener → client control reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    /// An acceptor is waiting on this ephemeral port.
    DataPort {
        /// Port to connect the data socket to.
        port: u16,
    },
    /// The serving node declined to allocate a port.
    Refused {
        /// Refusal diagnostic.
        reason: String,
    },
}
