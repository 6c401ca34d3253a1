//! Configuration for timeouts, listener addressing, and call policy.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::types::NodeId;

/// Default control-channel listener port.
pub const DEFAULT_CONTROL_PORT: u16 = 5369;

/// An inactivity window that may be disabled entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    /// Never reap on inactivity.
    Infinity,
    /// Reap after this much inactivity.
    After(Duration),
}

impl IdleTimeout {
    /// Idle timeout from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        IdleTimeout::After(Duration::from_millis(ms))
    }

    /// Resolves when the window measured from `since` has elapsed; never
    /// resolves for [`IdleTimeout::Infinity`]. Meant for `select!` arms.
    pub(crate) async fn expire_from(self, since: tokio::time::Instant) {
        match self {
            IdleTimeout::Infinity => std::future::pending().await,
            IdleTimeout::After(window) => tokio::time::sleep_until(since + window).await,
        }
    }
}

impl From<Duration> for IdleTimeout {
    fn from(window: Duration) -> Self {
        IdleTimeout::After(window)
    }
}

/// Which modules inbound requests may target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModulePolicy {
    /// Every module is callable.
    #[default]
    Off,
    /// Only the listed modules are callable.
    Whitelist(HashSet<String>),
    /// Every module except the listed ones is callable.
    Blacklist(HashSet<String>),
}

impl ModulePolicy {
    /// Build a whitelist from module names.
    pub fn whitelist<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ModulePolicy::Whitelist(modules.into_iter().map(Into::into).collect())
    }

    /// Build a blacklist from module names.
    pub fn blacklist<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ModulePolicy::Blacklist(modules.into_iter().map(Into::into).collect())
    }

    /// Whether a call targeting `module` is allowed.
    pub fn allows(&self, module: &str) -> bool {
        match self {
            ModulePolicy::Off => true,
            ModulePolicy::Whitelist(listed) => listed.contains(module),
            ModulePolicy::Blacklist(listed) => !listed.contains(module),
        }
    }
}

/// Transport configuration.
///
/// All durations are wall-clock; inactivity windows may be
/// [`IdleTimeout::Infinity`]. Configuration is read-only once a node is
/// started.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Port of the well-known control listener.
    ///
    /// Port 0 binds an OS-assigned port; the effective port is available on
    /// the running node.
    pub control_port: u16,

    /// Address the control and data listeners bind on.
    pub listen_ip: IpAddr,

    /// Per-peer control-port overrides for peers using nonstandard ports.
    pub remote_control_ports: HashMap<NodeId, u16>,

    /// Which modules inbound requests may target.
    pub module_policy: ModulePolicy,

    /// Timeout for opening control and data sockets (also bounds each side
    /// of the port-allocation handshake).
    pub connect_timeout: Duration,

    /// Default timeout for writing one frame.
    pub send_timeout: Duration,

    /// Default timeout for awaiting one call's reply.
    pub receive_timeout: Duration,

    /// Receive timeout used by the synchronized-broadcast helpers layered
    /// on top of the core.
    pub sbcast_receive_timeout: Duration,

    /// Reap an outbound client actor after this much inactivity.
    pub client_inactivity_timeout: IdleTimeout,

    /// Reap an inbound acceptor after this much inactivity.
    pub server_inactivity_timeout: IdleTimeout,

    /// Reap the reply slot of a detached asynchronous call after this much
    /// inactivity (consumed by the async-call helpers above the core).
    pub async_call_inactivity_timeout: IdleTimeout,

    /// Probe peer liveness through the membership layer before each send.
    ///
    /// A TCP write can succeed into a kernel buffer even when the peer
    /// process is gone; the membership layer gives an earlier signal at the
    /// cost of one probe per request. Off by default.
    pub probe_liveness: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_control_ports: HashMap::new(),
            module_policy: ModulePolicy::Off,
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(15),
            sbcast_receive_timeout: Duration::from_secs(15),
            client_inactivity_timeout: IdleTimeout::After(Duration::from_secs(300)),
            server_inactivity_timeout: IdleTimeout::After(Duration::from_secs(300)),
            async_call_inactivity_timeout: IdleTimeout::After(Duration::from_secs(600)),
            probe_liveness: false,
        }
    }
}

impl RpcConfig {
    /// Configuration tuned for loopback and test clusters: OS-assigned
    /// control port, loopback binding, short timeouts.
    pub fn local_network() -> Self {
        Self {
            control_port: 0,
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(2),
            sbcast_receive_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Effective `(receive, send)` timeouts for one request: a caller-supplied
    /// value overrides the configured default independently per dimension.
    pub fn merge_timeouts(
        &self,
        recv_timeout: Option<Duration>,
        send_timeout: Option<Duration>,
    ) -> (Duration, Duration) {
        (
            recv_timeout.unwrap_or(self.receive_timeout),
            send_timeout.unwrap_or(self.send_timeout),
        )
    }

    /// Control port to dial for `peer`, honoring per-peer overrides.
    pub fn control_port_of(&self, peer: &NodeId) -> u16 {
        self.remote_control_ports
            .get(peer)
            .copied()
            .unwrap_or(self.control_port)
    }
}

/// Per-request timeout overrides for `call` and `cast`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOpts {
    /// Overrides [`RpcConfig::receive_timeout`] when set.
    pub recv_timeout: Option<Duration>,
    /// Overrides [`RpcConfig::send_timeout`] when set.
    pub send_timeout: Option<Duration>,
}

impl CallOpts {
    /// Override the receive timeout.
    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Override the send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }
}
