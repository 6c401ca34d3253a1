//! # peerlane
//!
//! Point-to-point RPC transport for cluster nodes.
//!
//! Every node exposes local functions and can invoke them on any peer. The
//! defining property is isolation: each peer pair talks over its own
//! dedicated data socket, driven by its own client actor, so bulk RPC
//! payloads between two nodes never head-of-line block other peers or the
//! cluster's control traffic, and no single dispatcher mailbox sits in front
//! of the whole cluster's fan-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        RpcNode                             │
//! │        call / cast / stop        serves inbound peers      │
//! ├──────────────────────────────┬────────────────────────────┤
//! │  registry + dispatcher       │  control listener          │
//! │  • lookup-or-create, one     │  • allocates an ephemeral  │
//! │    client actor per peer     │    data port per peer      │
//! ├──────────────────────────────┼────────────────────────────┤
//! │  client actor (per peer)     │  acceptor (per connection) │
//! │  • owns the data socket      │  • owns the data socket    │
//! │  • pending map: token→waiter │  • one executor per request│
//! │  • idle reaping              │  • idle reaping            │
//! ├──────────────────────────────┴────────────────────────────┤
//! │            wire: [len:4 BE][tagged payload]                │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use peerlane::{HandlerMap, NodeId, RpcConfig, RpcNode, StaticMembership, Term};
//!
//! let handlers = Arc::new(HandlerMap::new());
//! handlers.register("math", "add", |args| {
//!     Ok(Term::Int(args.iter().filter_map(Term::as_int).sum()))
//! });
//!
//! let membership = Arc::new(StaticMembership::new());
//! let node = RpcNode::start(
//!     NodeId::new("a@cluster"),
//!     RpcConfig::default(),
//!     membership,
//!     handlers,
//! )
//! .await?;
//!
//! let five = node
//!     .call(&NodeId::new("b@cluster"), "math", "add", vec![Term::Int(2), Term::Int(3)])
//!     .await?;
//! ```
//!
//! ## Guarantees
//!
//! - At most one client actor (and one data socket) per peer.
//! - Replies are routed to exactly the call that issued them, by 128-bit
//!   token; late replies after a timeout are discarded.
//! - Within one peer, requests hit the wire in the order they were accepted.
//!   Completion order is not preserved — callers needing it serialize
//!   themselves.
//! - Per-call failures (policy, crash, timeout) never disturb the
//!   connection; transport failures fail every in-flight call and the next
//!   request transparently reconnects.

#![warn(missing_docs)]

mod client;
mod registry;
mod server;

pub mod config;
pub mod error;
pub mod handler;
pub mod membership;
pub mod node;
pub mod protocol;
pub mod types;
pub mod wire;

pub use config::{CallOpts, IdleTimeout, ModulePolicy, RpcConfig, DEFAULT_CONTROL_PORT};
pub use error::{CallError, RpcError, TransportError};
pub use handler::{HandlerMap, InvokeError, Invoker};
pub use membership::{Membership, Reachability, StaticMembership};
pub use node::RpcNode;
pub use protocol::{RemoteError, Reply, ReplyOutcome, Request, Term};
pub use types::{NodeId, Uid};
pub use wire::{FrameError, MAX_FRAME_SIZE};
