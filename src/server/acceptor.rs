//! The per-connection acceptor and its executors.
//!
//! An acceptor owns one inbound data socket. It decodes requests, applies
//! the module policy, and spawns one executor per invocation so a crashing
//! function can never take the connection down with it. Executors report
//! completions back over a channel; the acceptor is the only writer on the
//! socket.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RpcConfig;
use crate::handler::Invoker;
use crate::protocol::{RemoteError, Reply, ReplyOutcome, Request, Term};
use crate::types::{NodeId, Uid};
use crate::wire;

/// Completion message from an executor to its acceptor.
struct ExecutorReport {
    executor: u64,
    /// `Some` for calls; casts report for bookkeeping only.
    reply: Option<Reply>,
}

/// Handles to one in-flight executor, for termination cleanup.
struct ExecutorHandles {
    invocation: AbortHandle,
    harness: AbortHandle,
}

impl ExecutorHandles {
    fn abort(&self) {
        self.invocation.abort();
        self.harness.abort();
    }
}

/// Spawn the acceptor for a freshly allocated data port.
///
/// The acceptor waits for exactly one connection on `data_listener` (the
/// client that asked for the port), then closes the listener and serves the
/// connection until idle timeout, socket failure, or shutdown.
pub(crate) fn spawn(
    data_listener: TcpListener,
    peer: NodeId,
    config: Arc<RpcConfig>,
    invoker: Arc<dyn Invoker>,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let accepted =
            tokio::time::timeout(config.connect_timeout, data_listener.accept()).await;
        let stream = match accepted {
            Ok(Ok((stream, remote))) => {
                debug!(peer = %peer, remote = %remote, "data connection accepted");
                stream
            }
            Ok(Err(err)) => {
                warn!(peer = %peer, error = %err, "data accept failed");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "peer never connected to its data port");
                return;
            }
        };
        // One connection per listener; no other peer can reach this port.
        drop(data_listener);
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "could not disable nagle");
        }

        Acceptor {
            peer,
            config,
            invoker,
        }
        .serve(stream, shutdown)
        .await;
    });
}

struct Acceptor {
    /// Identity claimed during the control handshake; confirmed against the
    /// sender of the first frame.
    peer: NodeId,
    config: Arc<RpcConfig>,
    invoker: Arc<dyn Invoker>,
}

impl Acceptor {
    async fn serve(&self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf: Vec<u8> = Vec::with_capacity(4096);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<ExecutorReport>();
        let mut inflight: HashMap<u64, ExecutorHandles> = HashMap::new();
        let mut next_executor: u64 = 0;
        let mut confirmed_sender = false;
        let mut last_activity = Instant::now();

        let exit_reason = loop {
            tokio::select! {
                _ = shutdown.changed() => break "shutdown",

                read = read_half.read_buf(&mut read_buf) => match read {
                    Ok(0) => break "peer disconnected",
                    Ok(_) => {
                        match self.admit_requests(
                            &mut read_buf,
                            &mut confirmed_sender,
                            &mut inflight,
                            &mut next_executor,
                            &report_tx,
                        ) {
                            Ok(true) => last_activity = Instant::now(),
                            Ok(false) => {}
                            Err(err) => {
                                warn!(peer = %self.peer, error = %err, "corrupt request frame");
                                break "corrupt frame";
                            }
                        }
                    }
                    Err(err) => {
                        warn!(peer = %self.peer, error = %err, "read failed");
                        break "read error";
                    }
                },

                Some(report) = report_rx.recv() => {
                    inflight.remove(&report.executor);
                    last_activity = Instant::now();
                    if let Some(reply) = report.reply {
                        if let Err(err) = self.write_reply(&mut write_half, &reply).await {
                            warn!(peer = %self.peer, error = %err, "reply write failed");
                            break "write error";
                        }
                    }
                }

                _ = self.config.server_inactivity_timeout.expire_from(last_activity) => {
                    break "idle";
                }
            }
        };

        debug!(
            peer = %self.peer,
            in_flight = inflight.len(),
            reason = exit_reason,
            "acceptor terminating"
        );
        for handles in inflight.values() {
            handles.abort();
        }
    }

    /// Drain complete request frames and spawn executors for them.
    ///
    /// Returns whether any frame was processed.
    fn admit_requests(
        &self,
        read_buf: &mut Vec<u8>,
        confirmed_sender: &mut bool,
        inflight: &mut HashMap<u64, ExecutorHandles>,
        next_executor: &mut u64,
        report_tx: &mpsc::UnboundedSender<ExecutorReport>,
    ) -> Result<bool, wire::FrameError> {
        let mut admitted = false;
        while let Some(payload) = wire::try_take_frame(read_buf)? {
            let request: Request = wire::decode_packet(&payload)?;
            admitted = true;

            if !*confirmed_sender {
                *confirmed_sender = true;
                if *request.sender() != self.peer {
                    debug!(
                        claimed = %self.peer,
                        sender = %request.sender(),
                        "first frame sender differs from handshake identity"
                    );
                }
            }

            match request {
                Request::Call {
                    sender,
                    waiter,
                    call_id,
                    module,
                    function,
                    args,
                } => {
                    if !self.config.module_policy.allows(&module) {
                        debug!(
                            peer = %sender,
                            module = %module,
                            function = %function,
                            "call blocked by module policy"
                        );
                        // Completes immediately, without an executor.
                        let _ = report_tx.send(ExecutorReport {
                            executor: *next_executor,
                            reply: Some(Reply {
                                waiter,
                                call_id,
                                outcome: ReplyOutcome::Error(RemoteError::NotAllowed),
                            }),
                        });
                        *next_executor += 1;
                        continue;
                    }
                    let executor = *next_executor;
                    *next_executor += 1;
                    let handles = self.spawn_executor(
                        executor,
                        module,
                        function,
                        args,
                        Some((waiter, call_id)),
                        report_tx.clone(),
                    );
                    inflight.insert(executor, handles);
                }

                Request::Cast {
                    sender,
                    module,
                    function,
                    args,
                } => {
                    if !self.config.module_policy.allows(&module) {
                        debug!(
                            peer = %sender,
                            module = %module,
                            function = %function,
                            "cast blocked by module policy, dropped"
                        );
                        continue;
                    }
                    let executor = *next_executor;
                    *next_executor += 1;
                    let handles = self.spawn_executor(
                        executor,
                        module,
                        function,
                        args,
                        None,
                        report_tx.clone(),
                    );
                    inflight.insert(executor, handles);
                }
            }
        }
        Ok(admitted)
    }

    /// Run one invocation in isolation.
    ///
    /// The invocation runs in its own task so a panicking function is
    /// harvested as a crash instead of poisoning the acceptor; the harness
    /// task turns its outcome into a report.
    fn spawn_executor(
        &self,
        executor: u64,
        module: String,
        function: String,
        args: Vec<Term>,
        reply_to: Option<(Uid, Uid)>,
        report_tx: mpsc::UnboundedSender<ExecutorReport>,
    ) -> ExecutorHandles {
        let invoker = self.invoker.clone();
        let invocation = {
            let module = module.clone();
            let function = function.clone();
            tokio::spawn(async move { invoker.invoke(&module, &function, args).await })
        };
        let invocation_abort = invocation.abort_handle();

        let peer = self.peer.clone();
        let harness = tokio::spawn(async move {
            let outcome = match invocation.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(RemoteError::Crash {
                    reason: err.to_string(),
                }),
                Err(join_err) if join_err.is_panic() => Err(RemoteError::Crash {
                    reason: panic_reason(join_err),
                }),
                Err(_) => Err(RemoteError::Crash {
                    reason: "invocation cancelled".to_string(),
                }),
            };

            match reply_to {
                Some((waiter, call_id)) => {
                    if let Err(ref err) = outcome {
                        debug!(
                            peer = %peer,
                            module = %module,
                            function = %function,
                            error = ?err,
                            "call completed with error"
                        );
                    }
                    let reply = Reply {
                        waiter,
                        call_id,
                        outcome: match outcome {
                            Ok(value) => ReplyOutcome::Value(value),
                            Err(err) => ReplyOutcome::Error(err),
                        },
                    };
                    let _ = report_tx.send(ExecutorReport {
                        executor,
                        reply: Some(reply),
                    });
                }
                None => {
                    // Fire-and-forget: failures are logged, never shipped
                    // back.
                    if let Err(err) = outcome {
                        warn!(
                            peer = %peer,
                            module = %module,
                            function = %function,
                            error = ?err,
                            "cast invocation failed"
                        );
                    }
                    let _ = report_tx.send(ExecutorReport {
                        executor,
                        reply: None,
                    });
                }
            }
        });

        trace!(peer = %self.peer, executor, "executor spawned");
        ExecutorHandles {
            invocation: invocation_abort,
            harness: harness.abort_handle(),
        }
    }

    async fn write_reply(
        &self,
        write_half: &mut OwnedWriteHalf,
        reply: &Reply,
    ) -> Result<(), String> {
        let frame = wire::encode_packet(reply).map_err(|e| e.to_string())?;
        match tokio::time::timeout(self.config.send_timeout, write_half.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "send timed out after {:?}",
                self.config.send_timeout
            )),
        }
    }
}

fn panic_reason(join_err: tokio::task::JoinError) -> String {
    let payload = join_err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}
