//! In-memory collaborators and broker used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gogo_shared::protocol::ChatRequest;
use gogo_shared::types::MessageType;
use gogo_store::{Database, GroupInfo};

use crate::broker::{Broker, BrokerRecord};
use crate::cache::{MemoryCache, MessageCache};
use crate::collaborators::{ContactDirectory, ContactStatus, GroupDirectory, SessionDirectory};
use crate::error::{BrokerError, CollaboratorError};
use crate::hub::{ConnectionHandle, Hub, HubHandle, HubServices, Outbound};
use crate::persistence::Persistence;
use crate::validator::DeliveryValidator;

#[derive(Clone, Default)]
pub struct FakeContacts {
    statuses: Arc<Mutex<HashMap<(String, String), ContactStatus>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl FakeContacts {
    pub fn set(&self, sender: &str, receiver: &str, status: ContactStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert((sender.to_string(), receiver.to_string()), status);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl ContactDirectory for FakeContacts {
    async fn get_contact_status(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<ContactStatus, CollaboratorError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.statuses
            .lock()
            .unwrap()
            .get(&(sender_id.to_string(), receiver_id.to_string()))
            .copied()
            .ok_or_else(|| CollaboratorError::Failed("no such user".into()))
    }
}

#[derive(Clone, Default)]
pub struct FakeSessions {
    created: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<Mutex<bool>>,
}

impl FakeSessions {
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }
}

#[async_trait]
impl SessionDirectory for FakeSessions {
    async fn create_session_if_not_exist(
        &self,
        owner_id: &str,
        contact_id: &str,
    ) -> Result<(), CollaboratorError> {
        if *self.failing.lock().unwrap() {
            return Err(CollaboratorError::Unavailable("session service down".into()));
        }
        self.created
            .lock()
            .unwrap()
            .push((owner_id.to_string(), contact_id.to_string()));
        Ok(())
    }

    async fn delete_sessions_by_users(
        &self,
        _user_id: &str,
        _contact_id: &str,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeGroups {
    groups: Arc<Mutex<HashMap<String, GroupInfo>>>,
}

impl FakeGroups {
    pub fn insert(&self, id: &str, members: &[&str]) {
        self.groups.lock().unwrap().insert(
            id.to_string(),
            GroupInfo {
                id: id.to_string(),
                name: id.to_lowercase(),
                owner_id: members.first().map(|m| m.to_string()).unwrap_or_default(),
                members: members.iter().map(|m| m.to_string()).collect(),
                created_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl GroupDirectory for FakeGroups {
    async fn group_members(&self, group_id: &str) -> Result<GroupInfo, CollaboratorError> {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::Rejected(format!("unknown group {group_id}")))
    }
}

/// Broker keeping records in memory until they are committed.
///
/// Polled records stay unacked until committed. After [`FakeBroker::restart`]
/// the next polls hand back the unacked records before any new ones, like a
/// stream consumer that rejoins its group under the same name.
#[derive(Clone, Default)]
pub struct FakeBroker {
    queued: Arc<Mutex<VecDeque<BrokerRecord>>>,
    unacked: Arc<Mutex<Vec<BrokerRecord>>>,
    replaying: Arc<Mutex<bool>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    committed: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<bool>>,
}

impl FakeBroker {
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }

    pub fn restart(&self) {
        *self.replaying.lock().unwrap() = true;
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if *self.failing.lock().unwrap() {
            return Err(BrokerError::Malformed("broker offline".into()));
        }
        let mut published = self.published.lock().unwrap();
        published.push((key.to_string(), payload.to_vec()));
        self.queued.lock().unwrap().push_back(BrokerRecord {
            payload: payload.to_vec(),
            topic: "chat_message".to_string(),
            partition: 0,
            offset: format!("0-{}", published.len()),
        });
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<BrokerRecord>, BrokerError> {
        {
            let mut replaying = self.replaying.lock().unwrap();
            if *replaying {
                let unacked = self.unacked.lock().unwrap().clone();
                if !unacked.is_empty() {
                    return Ok(unacked);
                }
                *replaying = false;
            }
        }

        let drained: Vec<_> = self.queued.lock().unwrap().drain(..).collect();
        if drained.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.unacked.lock().unwrap().extend(drained.iter().cloned());
        Ok(drained)
    }

    async fn commit(&self, record: &BrokerRecord) -> Result<(), BrokerError> {
        self.unacked
            .lock()
            .unwrap()
            .retain(|unacked| unacked.offset != record.offset);
        self.committed.lock().unwrap().push(record.offset.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hub harness
// ---------------------------------------------------------------------------

/// A running hub wired to a throw-away store, an in-process cache and fake
/// collaborators.
pub struct Harness {
    pub hub: HubHandle,
    pub persistence: Persistence,
    pub contacts: FakeContacts,
    pub sessions: FakeSessions,
    pub groups: FakeGroups,
    pub shutdown: CancellationToken,
    pub channel_size: usize,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_channel_size(16)
    }

    pub fn with_channel_size(channel_size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("chat.db")).unwrap();
        let cache: Arc<dyn MessageCache> = Arc::new(MemoryCache::new());
        let persistence = Persistence::new(db, cache, Duration::from_secs(60), 100);

        let contacts = FakeContacts::default();
        let sessions = FakeSessions::default();
        let groups = FakeGroups::default();
        let validator = DeliveryValidator::new(
            Arc::new(contacts.clone()),
            Arc::new(sessions.clone()),
            Duration::from_secs(3),
        );

        let shutdown = CancellationToken::new();
        let services = HubServices {
            persistence: persistence.clone(),
            validator,
            groups: Arc::new(groups.clone()),
        };
        let (hub, _task) = Hub::spawn(services, channel_size, shutdown.clone());

        Self {
            hub,
            persistence,
            contacts,
            sessions,
            groups,
            shutdown,
            channel_size,
            _dir: dir,
        }
    }

    /// Register `identity` with a bare outbound channel.
    pub async fn connect(&self, identity: &str) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.channel_size);
        let handle = ConnectionHandle::new(identity, tx);
        let session = handle.session;
        self.hub.login(handle).await.unwrap();
        (session, rx)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Next outbound frame, failing the test after a short wait.
pub async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound channel closed")
}

pub fn request(from: &str, to: &str, message_type: MessageType) -> ChatRequest {
    ChatRequest {
        session_id: format!("S-{from}-{to}"),
        message_type,
        content: String::new(),
        url: String::new(),
        send_id: from.to_string(),
        send_name: from.to_lowercase(),
        send_avatar: format!("https://10.0.0.1:8000/static/avatars/{from}.png"),
        receive_id: to.to_string(),
        file_size: String::new(),
        file_type: String::new(),
        file_name: String::new(),
        av_data: String::new(),
    }
}

pub fn text_payload(from: &str, to: &str, content: &str) -> Vec<u8> {
    let mut req = request(from, to, MessageType::Text);
    req.content = content.to_string();
    req.to_bytes().unwrap()
}

pub fn av_payload(from: &str, to: &str, call_id: &str, signal: &str) -> Vec<u8> {
    let mut req = request(from, to, MessageType::AudioOrVideo);
    req.av_data = serde_json::json!({ "message_id": call_id, "type": signal }).to_string();
    req.to_bytes().unwrap()
}
