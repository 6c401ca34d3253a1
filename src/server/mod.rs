//! Inbound side: the control listener and data-port allocation.
//!
//! One well-known control listener runs per node. A peer that wants to talk
//! opens a short-lived control connection, names itself, and is granted a
//! freshly bound ephemeral data port with a dedicated acceptor already
//! waiting on it. The control connection is then dropped — the well-known
//! port is never used for payload traffic, so bulk RPC cannot head-of-line
//! block it.

mod acceptor;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::TransportError;
use crate::handler::Invoker;
use crate::protocol::{ControlReply, ControlRequest};
use crate::wire;

/// The serving half of a node: control listener plus its acceptors.
pub(crate) struct Server {
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
}

impl Server {
    /// Bind the control listener and start accepting peers.
    pub(crate) async fn bind(
        config: Arc<RpcConfig>,
        invoker: Arc<dyn Invoker>,
    ) -> Result<Self, TransportError> {
        let bind_addr = SocketAddr::new(config.listen_ip, config.control_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                reason: e.to_string(),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed {
                reason: e.to_string(),
            })?
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_handle = tokio::spawn(accept_loop(listener, config, invoker, shutdown_rx));
        info!(port, "control listener bound");

        Ok(Self {
            port,
            shutdown: shutdown_tx,
            accept_handle,
        })
    }

    /// Effective control port (useful when configured as 0).
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Terminate the listener and every acceptor.
    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.accept_handle.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<RpcConfig>,
    invoker: Arc<dyn Invoker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("control listener shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((control, remote)) => {
                    tokio::spawn(negotiate(
                        control,
                        remote,
                        config.clone(),
                        invoker.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "control accept failed");
                }
            },
        }
    }
}

/// Serve one control connection: read the request, allocate a data port,
/// park an acceptor on it, answer with the port.
async fn negotiate(
    mut control: TcpStream,
    remote: SocketAddr,
    config: Arc<RpcConfig>,
    invoker: Arc<dyn Invoker>,
    shutdown: watch::Receiver<bool>,
) {
    let read = tokio::time::timeout(config.connect_timeout, async {
        let mut buf = Vec::with_capacity(128);
        let payload = wire::read_frame(&mut control, &mut buf).await?;
        wire::decode_packet::<ControlRequest>(&payload)
    })
    .await;

    let request = match read {
        Ok(Ok(request)) => request,
        Ok(Err(err)) => {
            debug!(remote = %remote, error = %err, "bad control request");
            return;
        }
        Err(_) => {
            debug!(remote = %remote, "control handshake timed out");
            return;
        }
    };
    let ControlRequest::OpenDataPort { node } = request;

    // The acceptor must be parked on the port before the grant goes out, or
    // the peer could dial a port nobody is listening on.
    let data_listener = match TcpListener::bind(SocketAddr::new(config.listen_ip, 0)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(peer = %node, error = %err, "could not bind a data port");
            refuse(&mut control, &config, err.to_string()).await;
            return;
        }
    };
    let port = match data_listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            warn!(peer = %node, error = %err, "could not read data port");
            refuse(&mut control, &config, err.to_string()).await;
            return;
        }
    };

    acceptor::spawn(data_listener, node.clone(), config.clone(), invoker, shutdown);
    debug!(peer = %node, remote = %remote, port, "data port allocated");

    let grant = match wire::encode_packet(&ControlReply::DataPort { port }) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(peer = %node, error = %err, "could not encode grant");
            return;
        }
    };
    let write = tokio::time::timeout(config.send_timeout, control.write_all(&grant)).await;
    match write {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(peer = %node, error = %err, "grant write failed"),
        Err(_) => debug!(peer = %node, "grant write timed out"),
    }
    // Dropping `control` releases the control channel; the peer now dials
    // the granted data port directly.
}

async fn refuse(control: &mut TcpStream, config: &RpcConfig, reason: String) {
    let Ok(frame) = wire::encode_packet(&ControlReply::Refused { reason }) else {
        return;
    };
    let _ = tokio::time::timeout(config.send_timeout, control.write_all(&frame)).await;
}
