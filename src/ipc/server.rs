//! TCP IPC server: accept loop, per-connection reader/writer, heartbeats.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::commbus::Message;
use crate::envelope::{self, Envelope, Intent, KERNEL_TARGET};
use crate::ipc::codec::{
    decode_json, encode_envelope, encode_error, read_frame, write_frame, MSG_ENVELOPE, MSG_ERROR,
};
use crate::ipc::connection::ConnectionState;
use crate::ipc::control;
use crate::kernel::Kernel;
use crate::routing::ConnectionHandle;
use crate::types::{Error, IpcConfig};

/// IPC server wrapping the kernel.
#[derive(Debug)]
pub struct IpcServer {
    kernel: Arc<Kernel>,
    addr: SocketAddr,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    next_connection: AtomicU64,
}

impl IpcServer {
    pub fn new(kernel: Arc<Kernel>, addr: SocketAddr, ipc_config: IpcConfig) -> Self {
        Self {
            kernel,
            addr,
            cancel: CancellationToken::new(),
            ipc_config,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Bind the configured address and run until cancelled.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener).await
    }

    /// Run on an already bound listener until cancelled or a fatal error occurs.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            addr = %listener.local_addr()?,
            max_connections = self.ipc_config.max_connections,
            "IPC server listening"
        );

        tokio::spawn(heartbeat(
            Arc::clone(&self.kernel),
            self.ipc_config.heartbeat_interval,
            self.cancel.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                %peer,
                                max_connections = self.ipc_config.max_connections,
                                "connection rejected: at capacity"
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        %peer,
                        connection_id,
                        active = self.ipc_config.max_connections - conn_semaphore.available_permits(),
                        "IPC connection opened"
                    );
                    let kernel = Arc::clone(&self.kernel);
                    let cancel = self.cancel.child_token();
                    let ipc_config = self.ipc_config.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer, connection_id, kernel, cancel, ipc_config, permit).await
                        {
                            tracing::warn!(%peer, connection_id, error = %e, "connection error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Ping every routable adapter each `interval`. Unanswered pings never
/// deregister anything.
async fn heartbeat(kernel: Arc<Kernel>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for (id, connection) in kernel.live_connections() {
                    let ping = Envelope::new(KERNEL_TARGET, id.as_str(), Intent::Ping, json!({}));
                    if let Err(e) = connection.send(ping) {
                        tracing::debug!(adapter_id = %id, error = %e, "heartbeat not sent");
                    }
                }
            }
        }
    }
}

/// Serve one TCP connection: inbound frames are handled in arrival order,
/// outbound frames go through a bounded queue drained by a writer task.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: u64,
    kernel: Arc<Kernel>,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(ipc_config.outbound_capacity);
    let (err_tx, err_rx) = mpsc::channel(ipc_config.outbound_capacity);

    let writer_task = tokio::spawn(write_loop(
        writer,
        rx,
        err_rx,
        ipc_config.write_timeout,
        cancel.clone(),
    ));

    let mut state = ConnectionState::new(connection_id, peer, ConnectionHandle::new(connection_id, tx));
    let result = read_loop(&kernel, &mut state, &mut reader, &err_tx, &ipc_config, &cancel).await;

    cancel.cancel();
    close(&kernel, &mut state);
    if let Ok(Err(e)) = writer_task.await {
        tracing::debug!(%peer, connection_id, error = %e, "writer stopped");
    }
    result
}

async fn read_loop(
    kernel: &Arc<Kernel>,
    state: &mut ConnectionState,
    reader: &mut OwnedReadHalf,
    errors: &mpsc::Sender<Error>,
    ipc_config: &IpcConfig,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(ipc_config.idle_timeout, read_frame(reader, ipc_config.max_frame_bytes)) => {
                match read {
                    Err(_elapsed) => {
                        tracing::debug!(
                            connection_id = state.id,
                            idle_timeout = ?ipc_config.idle_timeout,
                            "idle connection dropped"
                        );
                        break;
                    }
                    Ok(result) => match result? {
                        Some(frame) => frame,
                        None => break,
                    },
                }
            }
        };

        if let Some(id) = &state.adapter {
            kernel.touch_adapter(id);
        }

        let (msg_type, payload) = frame;
        let raw = match decode_json(msg_type, &payload) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(connection_id = state.id, peer = %state.peer, error = %e, "malformed frame dropped");
                report(errors, e);
                continue;
            }
        };
        let envelope = match envelope::validate(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(connection_id = state.id, error = %e, "invalid envelope dropped");
                report(errors, e);
                continue;
            }
        };

        on_envelope(kernel, state, envelope);
    }
    Ok(())
}

fn report(errors: &mpsc::Sender<Error>, error: Error) {
    if errors.try_send(error).is_err() {
        tracing::debug!("error frame dropped: outbound queue full");
    }
}

fn on_envelope(kernel: &Arc<Kernel>, state: &mut ConnectionState, envelope: Envelope) {
    if envelope.intent == Intent::Response {
        deliver_response(kernel, state, envelope);
        return;
    }

    if envelope.intent == Intent::Invoke && !envelope.is_kernel_bound() {
        let kernel = Arc::clone(kernel);
        let handle = state.handle.clone();
        tokio::spawn(async move {
            let body = match kernel.submit(envelope.clone()).await {
                Ok(result) => result,
                Err(e) => e.to_body(),
            };
            if let Err(e) = handle.send(envelope.reply(KERNEL_TARGET, body)) {
                tracing::debug!(trace_id = %envelope.trace_id(), error = %e, "task result not delivered");
            }
        });
        return;
    }

    let reply = match control::handle(kernel, state, &envelope) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(
                connection_id = state.id,
                intent = %envelope.intent,
                error_code = %e.code(),
                error = %e,
                "control message rejected"
            );
            Some(envelope.reply(KERNEL_TARGET, e.to_body()))
        }
    };
    if let Some(reply) = reply {
        if let Err(e) = state.handle.send(reply) {
            tracing::debug!(connection_id = state.id, error = %e, "control reply not delivered");
        }
    }
}

/// Hand an adapter's reply to the bus request waiting for it.
fn deliver_response(kernel: &Kernel, state: &ConnectionState, envelope: Envelope) {
    let topic = state
        .in_flight()
        .take(envelope.meta.correlation_id.as_deref(), envelope.trace_id());
    let Some(topic) = topic else {
        tracing::debug!(
            connection_id = state.id,
            trace_id = %envelope.trace_id(),
            "unmatched response dropped"
        );
        return;
    };
    let error = reported_error(&envelope.payload);
    kernel
        .bus()
        .publish_message(Message::response(topic, envelope.payload, error));
}

/// `{status: "error", error}` payloads fail the waiting dispatch.
fn reported_error(payload: &Value) -> Option<String> {
    if payload.get("status").and_then(Value::as_str) != Some("error") {
        return None;
    }
    Some(match payload.get("error") {
        Some(Value::String(msg)) => msg.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => "adapter reported an error".to_string(),
    })
}

/// Release everything the connection held.
fn close(kernel: &Kernel, state: &mut ConnectionState) {
    for subscription in state.subscriptions.drain(..) {
        kernel.bus().unsubscribe(&subscription);
    }

    let abandoned = state.in_flight().drain();
    for topic in abandoned {
        kernel.bus().publish_message(Message::response(
            topic,
            Value::Null,
            Some(format!("connection {} closed", state.id)),
        ));
    }

    let removed = kernel.disconnect_connection(state.id);
    tracing::debug!(
        connection_id = state.id,
        peer = %state.peer,
        adapters = removed.len(),
        "IPC connection closed"
    );
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut envelopes: mpsc::Receiver<Envelope>,
    mut errors: mpsc::Receiver<Error>,
    write_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (msg_type, encoded) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(error) = errors.recv() => (MSG_ERROR, encode_error(&error)),
            Some(envelope) = envelopes.recv() => (MSG_ENVELOPE, encode_envelope(&envelope)),
            else => break,
        };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "frame encoding failed");
                continue;
            }
        };
        if let Err(e) = timed_write(&mut writer, msg_type, &payload, write_timeout).await {
            cancel.cancel();
            return Err(e);
        }
    }
    Ok(())
}

/// Write a frame with a timeout. Returns an error if the write takes too long
/// (prevents slow consumers from holding connections indefinitely).
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, msg_type, payload))
        .await
        .map_err(|_| {
            tracing::warn!(?timeout, "write timeout, dropping connection");
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
