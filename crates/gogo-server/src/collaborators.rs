//! Clients for the services the hub consults but does not own.
//!
//! The relationship and conversation services are reached over HTTP/JSON.
//! Every reply uses one tagged taxonomy, [`RpcReply`], so callers never
//! interpret numeric sentinel codes. Group membership snapshots are read
//! from the local store.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gogo_store::{GroupInfo, StoreError};

use crate::error::{CollaboratorError, PersistenceError};
use crate::persistence::Persistence;

// ---------------------------------------------------------------------------
// Wire taxonomy
// ---------------------------------------------------------------------------

/// Reply envelope shared by every collaborator endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RpcReply<T> {
    /// The call succeeded.
    Success { data: T },
    /// The request was understood and refused for a business reason.
    Rejected { message: String },
    /// The collaborator could not complete the call.
    Failure { message: String },
}

impl<T> RpcReply<T> {
    pub fn into_result(self) -> Result<T, CollaboratorError> {
        match self {
            RpcReply::Success { data } => Ok(data),
            RpcReply::Rejected { message } => Err(CollaboratorError::Rejected(message)),
            RpcReply::Failure { message } => Err(CollaboratorError::Failed(message)),
        }
    }
}

/// Relationship between two users (or a user and a group) as recorded by
/// the relationship service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Normal,
    /// The contact has blocked the user.
    BlockedBy,
    /// The user has blocked the contact.
    Blocked,
    Deleted,
    DeletedBy,
    Silenced,
    QuitGroup,
    KickedOut,
}

impl ContactStatus {
    pub fn allows_delivery(self) -> bool {
        self == ContactStatus::Normal
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactStatusRequest {
    pub user_id: String,
    pub contact_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactStatusData {
    pub status: ContactStatus,
}

/// Body of the conversation create and teardown calls.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionPairRequest {
    pub owner_id: String,
    pub contact_id: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn get_contact_status(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<ContactStatus, CollaboratorError>;
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Make sure `owner_id` has a conversation with `contact_id`.
    async fn create_session_if_not_exist(
        &self,
        owner_id: &str,
        contact_id: &str,
    ) -> Result<(), CollaboratorError>;

    /// Remove the conversations between two users, both directions.
    async fn delete_sessions_by_users(
        &self,
        user_id: &str,
        contact_id: &str,
    ) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn group_members(&self, group_id: &str) -> Result<GroupInfo, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// HTTP clients
// ---------------------------------------------------------------------------

/// Shared JSON-over-HTTP plumbing for the collaborator clients.
#[derive(Clone)]
struct RpcClient {
    http: reqwest::Client,
    base_url: String,
}

impl RpcClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> Result<T, CollaboratorError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!("{status}: {text}")));
        }

        let reply: RpcReply<T> = response.json().await?;
        reply.into_result()
    }
}

/// Relationship lookups against the user service.
#[derive(Clone)]
pub struct HttpContactDirectory {
    rpc: RpcClient,
}

impl HttpContactDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            rpc: RpcClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl ContactDirectory for HttpContactDirectory {
    async fn get_contact_status(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<ContactStatus, CollaboratorError> {
        let request = ContactStatusRequest {
            user_id: sender_id.to_string(),
            contact_id: receiver_id.to_string(),
        };
        let data: ContactStatusData = self.rpc.call("/contact/getContactStatus", &request).await?;
        debug!(sender = %sender_id, receiver = %receiver_id, status = ?data.status, "Contact status");
        Ok(data.status)
    }
}

/// Conversation bookkeeping against the session service.
#[derive(Clone)]
pub struct HttpSessionDirectory {
    rpc: RpcClient,
}

impl HttpSessionDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            rpc: RpcClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl SessionDirectory for HttpSessionDirectory {
    async fn create_session_if_not_exist(
        &self,
        owner_id: &str,
        contact_id: &str,
    ) -> Result<(), CollaboratorError> {
        let request = SessionPairRequest {
            owner_id: owner_id.to_string(),
            contact_id: contact_id.to_string(),
        };
        let _: serde_json::Value = self
            .rpc
            .call("/session/createSessionIfNotExist", &request)
            .await?;
        Ok(())
    }

    async fn delete_sessions_by_users(
        &self,
        user_id: &str,
        contact_id: &str,
    ) -> Result<(), CollaboratorError> {
        let request = SessionPairRequest {
            owner_id: user_id.to_string(),
            contact_id: contact_id.to_string(),
        };
        let _: serde_json::Value = self
            .rpc
            .call("/session/deleteSessionsByUsers", &request)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store-backed groups
// ---------------------------------------------------------------------------

/// Group membership read from the `group_info` table.
#[derive(Clone)]
pub struct StoreGroupDirectory {
    persistence: Persistence,
}

impl StoreGroupDirectory {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl GroupDirectory for StoreGroupDirectory {
    async fn group_members(&self, group_id: &str) -> Result<GroupInfo, CollaboratorError> {
        match self.persistence.group_info(group_id).await {
            Ok(group) => Ok(group),
            Err(PersistenceError::Store(StoreError::NotFound)) => Err(
                CollaboratorError::Rejected(format!("group {group_id} does not exist")),
            ),
            Err(e) => Err(CollaboratorError::Unavailable(e.to_string())),
        }
    }
}
