//! The hub: one serialized event loop that owns the registry of live
//! connections and routes every chat payload.
//!
//! Login, logout, lookup and transmit events arrive on bounded channels and
//! are applied one at a time, so the registry needs no lock. Nothing outside
//! the loop can read or mutate it; lookups are events with a reply channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gogo_shared::constants::{FAREWELL_TEXT, WELCOME_TEXT};
use gogo_shared::protocol::{ChatRequest, MessageView, SystemNotice};
use gogo_shared::types::{MessageType, ReceiverKind};
use gogo_store::Message;

use crate::cache::{conversation_key, group_key};
use crate::collaborators::GroupDirectory;
use crate::error::HubError;
use crate::persistence::Persistence;
use crate::validator::{DeliveryValidator, Verdict};

// ---------------------------------------------------------------------------
// Registry entries
// ---------------------------------------------------------------------------

/// A frame queued for one connection's outbound pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub payload: String,
    /// Id of the persisted message, `None` for system frames.
    pub message_id: Option<String>,
}

impl Outbound {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            payload: text.into(),
            message_id: None,
        }
    }

    pub fn message(payload: String, message_id: &str) -> Self {
        Self {
            payload,
            message_id: Some(message_id.to_string()),
        }
    }
}

/// What the hub keeps for one live connection.
///
/// The outbound sender held here is the only one, so dropping the entry
/// closes the connection's outbound channel.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub identity: String,
    /// Distinguishes successive connections of the same identity.
    pub session: Uuid,
    pub outbound: mpsc::Sender<Outbound>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(identity: impl Into<String>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            identity: identity.into(),
            session: Uuid::new_v4(),
            outbound,
            connected_at: Utc::now(),
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            identity: self.identity.clone(),
            session: self.session,
            connected_at: self.connected_at,
        }
    }
}

/// Read-only snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub identity: String,
    pub session: Uuid,
    pub connected_at: DateTime<Utc>,
}

/// Result of an explicit logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOutcome {
    LoggedOut,
    /// The identity had no live connection. Not an error.
    NotConnected,
}

impl LogoutOutcome {
    pub fn message(self) -> &'static str {
        match self {
            LogoutOutcome::LoggedOut => FAREWELL_TEXT,
            LogoutOutcome::NotConnected => "User is not connected",
        }
    }

    pub fn code(self) -> i32 {
        match self {
            LogoutOutcome::LoggedOut => 0,
            LogoutOutcome::NotConnected => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

struct LoginRequest {
    handle: ConnectionHandle,
    ack: oneshot::Sender<()>,
}

enum LogoutRequest {
    /// Logout requested through the API.
    Explicit {
        identity: String,
        reply: oneshot::Sender<LogoutOutcome>,
    },
    /// Teardown of one specific connection; ignored if it was replaced.
    Release { identity: String, session: Uuid },
}

struct LookupRequest {
    identity: String,
    reply: oneshot::Sender<Option<ClientInfo>>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to the hub's event channels.
#[derive(Clone)]
pub struct HubHandle {
    login_tx: mpsc::Sender<LoginRequest>,
    logout_tx: mpsc::Sender<LogoutRequest>,
    lookup_tx: mpsc::Sender<LookupRequest>,
    transmit_tx: mpsc::Sender<Vec<u8>>,
}

impl HubHandle {
    /// Register a connection, replacing any previous one for the identity.
    /// Returns once the registry holds the new entry.
    pub async fn login(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        let (ack, ack_rx) = oneshot::channel();
        self.login_tx
            .send(LoginRequest { handle, ack })
            .await
            .map_err(|_| HubError::Closed)?;
        ack_rx.await.map_err(|_| HubError::Closed)
    }

    /// Explicit logout. Idempotent.
    pub async fn logout(&self, identity: &str) -> Result<LogoutOutcome, HubError> {
        let (reply, reply_rx) = oneshot::channel();
        self.logout_tx
            .send(LogoutRequest::Explicit {
                identity: identity.to_string(),
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove the entry for `identity` only if it still belongs to `session`.
    pub async fn release(&self, identity: &str, session: Uuid) -> Result<(), HubError> {
        self.logout_tx
            .send(LogoutRequest::Release {
                identity: identity.to_string(),
                session,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn get_client(&self, identity: &str) -> Result<Option<ClientInfo>, HubError> {
        let (reply, reply_rx) = oneshot::channel();
        self.lookup_tx
            .send(LookupRequest {
                identity: identity.to_string(),
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn is_online(&self, identity: &str) -> Result<bool, HubError> {
        Ok(self.get_client(identity).await?.is_some())
    }

    /// Queue a raw payload for routing, waiting for capacity.
    pub async fn transmit(&self, payload: Vec<u8>) -> Result<(), HubError> {
        self.transmit_tx
            .send(payload)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue a raw payload without waiting. A full queue hands it back.
    pub fn try_transmit(&self, payload: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        self.transmit_tx.try_send(payload)
    }

    /// Wait until the transmit queue has room for one payload.
    pub async fn reserve_transmit(&self) -> Result<mpsc::Permit<'_, Vec<u8>>, HubError> {
        self.transmit_tx.reserve().await.map_err(|_| HubError::Closed)
    }

    pub fn try_reserve_transmit(&self) -> Result<mpsc::Permit<'_, Vec<u8>>, TrySendError<()>> {
        self.transmit_tx.try_reserve()
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Everything the routing stage depends on.
#[derive(Clone)]
pub struct HubServices {
    pub persistence: Persistence,
    pub validator: DeliveryValidator,
    pub groups: Arc<dyn GroupDirectory>,
}

pub struct Hub {
    clients: HashMap<String, ConnectionHandle>,
    services: HubServices,
    login_rx: mpsc::Receiver<LoginRequest>,
    logout_rx: mpsc::Receiver<LogoutRequest>,
    lookup_rx: mpsc::Receiver<LookupRequest>,
    transmit_rx: mpsc::Receiver<Vec<u8>>,
}

impl Hub {
    pub fn new(services: HubServices, channel_size: usize) -> (Self, HubHandle) {
        let channel_size = channel_size.max(1);
        let (login_tx, login_rx) = mpsc::channel(channel_size);
        let (logout_tx, logout_rx) = mpsc::channel(channel_size);
        let (lookup_tx, lookup_rx) = mpsc::channel(channel_size);
        let (transmit_tx, transmit_rx) = mpsc::channel(channel_size);

        let hub = Self {
            clients: HashMap::new(),
            services,
            login_rx,
            logout_rx,
            lookup_rx,
            transmit_rx,
        };
        let handle = HubHandle {
            login_tx,
            logout_tx,
            lookup_tx,
            transmit_tx,
        };
        (hub, handle)
    }

    /// Build the hub and run its loop on a new task.
    pub fn spawn(
        services: HubServices,
        channel_size: usize,
        shutdown: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(services, channel_size);
        let task = tokio::spawn(hub.run(shutdown));
        (handle, task)
    }

    /// Process events until `shutdown` fires or every handle is dropped.
    ///
    /// Dropping the registry on exit closes every outbound channel, which
    /// tears the connections down.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Hub event loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(req) = self.login_rx.recv() => self.handle_login(req),
                Some(req) = self.logout_rx.recv() => self.handle_logout(req),
                Some(req) = self.lookup_rx.recv() => self.handle_lookup(req),
                Some(payload) = self.transmit_rx.recv() => self.route(payload).await,
                else => break,
            }
        }
        let remaining = self.clients.len();
        self.clients.clear();
        info!(remaining, "Hub event loop stopped");
    }

    /// Take one queued payload without routing it.
    #[cfg(test)]
    pub(crate) fn try_next_payload(&mut self) -> Option<Vec<u8>> {
        self.transmit_rx.try_recv().ok()
    }

    // ------------------------------------------------------------------
    // Registry events
    // ------------------------------------------------------------------

    fn handle_login(&mut self, req: LoginRequest) {
        let LoginRequest { handle, ack } = req;
        let identity = handle.identity.clone();

        if handle.outbound.try_send(Outbound::system(WELCOME_TEXT)).is_err() {
            warn!(user = %identity, "Could not queue welcome frame");
        }

        if let Some(previous) = self.clients.insert(identity.clone(), handle) {
            info!(user = %identity, old_session = %previous.session, "Replaced existing connection");
        } else {
            info!(user = %identity, online = self.clients.len(), "User logged in");
        }

        let _ = ack.send(());
    }

    fn handle_logout(&mut self, req: LogoutRequest) {
        match req {
            LogoutRequest::Explicit { identity, reply } => {
                let outcome = match self.clients.remove(&identity) {
                    Some(handle) => {
                        let _ = handle.outbound.try_send(Outbound::system(FAREWELL_TEXT));
                        info!(user = %identity, "User logged out");
                        LogoutOutcome::LoggedOut
                    }
                    None => {
                        debug!(user = %identity, "Logout for user that is not connected");
                        LogoutOutcome::NotConnected
                    }
                };
                let _ = reply.send(outcome);
            }
            LogoutRequest::Release { identity, session } => {
                let current = self.clients.get(&identity).map(|h| h.session);
                if current == Some(session) {
                    self.clients.remove(&identity);
                    info!(user = %identity, %session, "Connection released");
                } else {
                    debug!(user = %identity, %session, "Release of stale connection ignored");
                }
            }
        }
    }

    fn handle_lookup(&self, req: LookupRequest) {
        let info = self.clients.get(&req.identity).map(ConnectionHandle::info);
        let _ = req.reply.send(info);
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    async fn route(&self, payload: Vec<u8>) {
        let request = match ChatRequest::from_bytes(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable payload");
                return;
            }
        };
        let kind = match request.receiver_kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(error = %e, "Dropping payload with bad receiver");
                return;
            }
        };

        match (request.message_type, kind) {
            (MessageType::Text | MessageType::File, ReceiverKind::User) => {
                self.route_direct(&request).await
            }
            (MessageType::Text | MessageType::File, ReceiverKind::Group) => {
                self.route_group(&request).await
            }
            (MessageType::AudioOrVideo, kind) => self.route_signal(&request, kind).await,
        }
    }

    async fn route_direct(&self, request: &ChatRequest) {
        let message = Message::from_request(request);
        let view = message.to_view();
        if !self.persist(&message, &view).await {
            return;
        }

        match self
            .services
            .validator
            .validate(&message.send_id, &message.receive_id)
            .await
        {
            Verdict::Deliver => {}
            Verdict::Reject(notice) => {
                self.notify(&message.send_id, &view, notice);
                return;
            }
        }

        let Some(payload) = encode(&view) else { return };
        self.deliver(
            &message.receive_id,
            Outbound::message(payload.clone(), &message.id),
        );
        if message.send_id != message.receive_id {
            self.deliver(&message.send_id, Outbound::message(payload, &message.id));
        }

        let key = conversation_key(&message.send_id, &message.receive_id);
        self.cache(&key, &view).await;
    }

    async fn route_group(&self, request: &ChatRequest) {
        let message = Message::from_request(request);
        let view = message.to_view();

        let group = match self.services.groups.group_members(&message.receive_id).await {
            Ok(group) => group,
            Err(e) => {
                warn!(group = %message.receive_id, error = %e, "Group membership lookup failed");
                self.notify(&message.send_id, &view, SystemNotice::ServerError);
                return;
            }
        };
        if !group.members.iter().any(|member| member == &message.send_id) {
            warn!(
                user = %message.send_id,
                group = %group.id,
                "Sender is not a group member, message refused"
            );
            self.notify(&message.send_id, &view, SystemNotice::NotInGroup);
            return;
        }

        if !self.persist(&message, &view).await {
            return;
        }

        let Some(payload) = encode(&view) else { return };
        let mut delivered = 0usize;
        for member in &group.members {
            if self.deliver(member, Outbound::message(payload.clone(), &message.id)) {
                delivered += 1;
            }
        }
        debug!(
            group = %group.id,
            members = group.member_count(),
            delivered,
            "Group message fanned out"
        );

        self.cache(&group_key(&group.id), &view).await;
    }

    /// Audio/video signaling goes to the receiver only; only call events
    /// are kept in history.
    async fn route_signal(&self, request: &ChatRequest, kind: ReceiverKind) {
        let signal = match request.av_signal() {
            Ok(signal) => signal,
            Err(e) => {
                warn!(sender = %request.send_id, error = %e, "Dropping unreadable signal");
                return;
            }
        };

        let message = Message::from_request(request);
        let view = message.to_view();
        let recorded = signal.is_call_record();
        if recorded && !self.persist(&message, &view).await {
            return;
        }

        if kind == ReceiverKind::Group {
            debug!(group = %message.receive_id, signal = %signal.signal_type, "Group signaling is not relayed");
            return;
        }

        match self
            .services
            .validator
            .validate(&message.send_id, &message.receive_id)
            .await
        {
            Verdict::Deliver => {}
            Verdict::Reject(notice) => {
                self.notify(&message.send_id, &view, notice);
                return;
            }
        }

        let Some(payload) = encode(&view) else { return };
        let outbound = if recorded {
            Outbound::message(payload, &message.id)
        } else {
            Outbound {
                payload,
                message_id: None,
            }
        };
        self.deliver(&message.receive_id, outbound);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Write the message durably. On failure the sender gets a system
    /// notice and routing stops.
    async fn persist(&self, message: &Message, view: &MessageView) -> bool {
        match self.services.persistence.append(message).await {
            Ok(()) => true,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to persist message");
                self.notify(&message.send_id, view, SystemNotice::ServerError);
                false
            }
        }
    }

    async fn cache(&self, key: &str, view: &MessageView) {
        if let Err(e) = self.services.persistence.append_to_cache(key, view).await {
            warn!(key, error = %e, "Failed to update cached list");
        }
    }

    /// Send a canned notice in place of the original content to `identity`.
    fn notify(&self, identity: &str, view: &MessageView, notice: SystemNotice) {
        if let Some(payload) = encode(&view.with_notice(notice)) {
            self.deliver(identity, Outbound::system(payload));
        }
    }

    /// Non-blocking push to a registered connection. Returns whether the
    /// frame was queued.
    fn deliver(&self, identity: &str, outbound: Outbound) -> bool {
        let Some(client) = self.clients.get(identity) else {
            return false;
        };
        match client.outbound.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user = %identity, "Outbound channel full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user = %identity, "Outbound channel closed");
                false
            }
        }
    }
}

fn encode(view: &MessageView) -> Option<String> {
    match view.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "Failed to encode outbound envelope");
            None
        }
    }
}
