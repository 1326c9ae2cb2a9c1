//! One client connection: registration plus the inbound, outbound and
//! liveness pumps, run together under a single supervisor.
//!
//! [`Connection::open`] either registers the client and starts all three
//! pumps, or fails without leaving a registry entry or a task behind. Any
//! pump that stops cancels the others; the supervisor then releases the
//! registry entry (only if it still belongs to this connection) and closes
//! the socket. Teardown therefore runs exactly once whichever side fails.

use std::pin::Pin;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gogo_shared::constants::SERVER_BUSY_TEXT;
use gogo_shared::protocol::{ChatRequest, SystemNotice};
use gogo_store::Message;

use crate::error::{ConnectionError, HubError};
use crate::hub::{ConnectionHandle, HubHandle, Outbound};
use crate::persistence::Persistence;
use crate::transport::{Admission, Ingress, Transport};

/// Upper bound on flushing the close handshake to a client that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ConnectionError>> + Send>>;

/// Shared dependencies of every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub hub: HubHandle,
    pub transport: Transport,
    pub persistence: Persistence,
    /// Capacity of the outbound and overflow queues.
    pub channel_size: usize,
    pub ping_interval: Duration,
    pub read_deadline: Duration,
}

/// A running connection.
pub struct Connection {
    identity: String,
    session: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    /// Register `identity` with the hub and start the pumps.
    pub async fn open(
        identity: String,
        sink: FrameSink,
        stream: FrameStream,
        ctx: ConnectionContext,
    ) -> Result<Self, HubError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(ctx.channel_size.max(1));
        let handle = ConnectionHandle::new(identity.clone(), outbound_tx);
        let session = handle.session;

        ctx.hub.login(handle).await?;

        let cancel = CancellationToken::new();
        let ingress = Ingress::new(ctx.transport.clone(), ctx.hub.clone(), ctx.channel_size);
        let task = tokio::spawn(supervise(
            identity.clone(),
            session,
            sink,
            stream,
            outbound_rx,
            ingress,
            ctx,
            cancel.clone(),
        ));

        Ok(Self {
            identity,
            session,
            cancel,
            task,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Ask the pumps to stop. Teardown still runs in the supervisor.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the connection has been torn down.
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            warn!(user = %self.identity, error = %e, "Connection supervisor failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    identity: String,
    session: Uuid,
    sink: FrameSink,
    stream: FrameStream,
    outbound_rx: mpsc::Receiver<Outbound>,
    ingress: Ingress,
    ctx: ConnectionContext,
    cancel: CancellationToken,
) {
    debug!(user = %identity, %session, "Connection pumps started");
    let sink = Mutex::new(sink);

    tokio::join!(
        inbound_pump(&identity, stream, &sink, ingress, ctx.read_deadline, &cancel),
        outbound_pump(&identity, outbound_rx, &sink, &ctx.persistence, &cancel),
        liveness_pump(&identity, &sink, ctx.ping_interval, &cancel),
    );

    if let Err(e) = ctx.hub.release(&identity, session).await {
        debug!(user = %identity, error = %e, "Hub gone during release");
    }
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.lock().await.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(user = %identity, error = %e, "Error closing socket"),
        Err(_) => debug!(user = %identity, "Socket close timed out"),
    }
    info!(user = %identity, %session, "Connection closed");
}

async fn write_frame(sink: &Mutex<FrameSink>, frame: Frame) -> Result<(), ConnectionError> {
    sink.lock().await.send(frame).await
}

/// Reads client frames, enforces the read deadline and hands payloads to
/// the ingress.
async fn inbound_pump(
    identity: &str,
    mut stream: FrameStream,
    sink: &Mutex<FrameSink>,
    mut ingress: Ingress,
    read_deadline: Duration,
    cancel: &CancellationToken,
) {
    let deadline = tokio::time::sleep(read_deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            drained = ingress.drain_one(), if ingress.has_backlog() => {
                if drained.is_err() {
                    break;
                }
            }
            _ = &mut deadline => {
                info!(user = %identity, "Read deadline expired");
                break;
            }
            next = stream.next() => {
                let frame = match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(user = %identity, error = %e, "Read failed");
                        break;
                    }
                    None => break,
                };
                deadline.as_mut().reset(Instant::now() + read_deadline);

                let payload = match frame {
                    Frame::Text(text) => text.into_bytes(),
                    Frame::Binary(bytes) => bytes,
                    Frame::Ping(_) | Frame::Pong(_) => continue,
                    Frame::Close => {
                        debug!(user = %identity, "Client closed the connection");
                        break;
                    }
                };

                let request = match ChatRequest::from_bytes(&payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(user = %identity, error = %e, "Discarding malformed frame");
                        continue;
                    }
                };
                if request.send_id != identity {
                    warn!(
                        user = %identity,
                        claimed = %request.send_id,
                        "Discarding frame sent on behalf of another user"
                    );
                    continue;
                }

                let reply = match ingress.submit(identity, payload).await {
                    Admission::Accepted | Admission::Deferred => None,
                    Admission::Shed => {
                        warn!(user = %identity, "Hub and overflow full, shedding message");
                        Some(SERVER_BUSY_TEXT.to_string())
                    }
                    Admission::Failed => Message::from_request(&request)
                        .to_view()
                        .with_notice(SystemNotice::ServerError)
                        .to_json()
                        .ok(),
                    Admission::Closed => break,
                };

                // A client that stops reading must not pin the reader here.
                if let Some(text) = reply {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = &mut deadline => {
                            info!(user = %identity, "Read deadline expired while writing a notice");
                            break;
                        }
                        written = write_frame(sink, Frame::Text(text)) => written,
                    };
                    if written.is_err() {
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
}

/// Writes hub frames to the client and marks delivered messages as sent.
async fn outbound_pump(
    identity: &str,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    sink: &Mutex<FrameSink>,
    persistence: &Persistence,
    cancel: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound_rx.recv() => next,
            _ = cancel.cancelled() => break,
        };
        let Some(outbound) = next else {
            debug!(user = %identity, "Outbound channel closed");
            break;
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_frame(sink, Frame::Text(outbound.payload)) => written,
        };
        if let Err(e) = written {
            debug!(user = %identity, error = %e, "Write failed");
            break;
        }

        if let Some(id) = outbound.message_id {
            let persistence = persistence.clone();
            tokio::spawn(async move {
                if let Err(e) = persistence.mark_delivered(&id).await {
                    warn!(message_id = %id, error = %e, "Failed to mark message as sent");
                }
            });
        }
    }

    cancel.cancel();
}

/// Pings the client every `ping_interval`.
async fn liveness_pump(
    identity: &str,
    sink: &Mutex<FrameSink>,
    ping_interval: Duration,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let written = tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = write_frame(sink, Frame::Ping(Vec::new())) => written,
                };
                if let Err(e) = written {
                    debug!(user = %identity, error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    cancel.cancel();
}
