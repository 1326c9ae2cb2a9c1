//! Relationship check run before a one-to-one message is routed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use gogo_shared::protocol::SystemNotice;

use crate::collaborators::{ContactDirectory, SessionDirectory};

/// Outcome of [`DeliveryValidator::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Do not route; send this notice to the sender instead.
    Reject(SystemNotice),
}

#[derive(Clone)]
pub struct DeliveryValidator {
    contacts: Arc<dyn ContactDirectory>,
    sessions: Arc<dyn SessionDirectory>,
    timeout: Duration,
}

impl DeliveryValidator {
    pub fn new(
        contacts: Arc<dyn ContactDirectory>,
        sessions: Arc<dyn SessionDirectory>,
        timeout: Duration,
    ) -> Self {
        Self {
            contacts,
            sessions,
            timeout,
        }
    }

    /// Decide whether `sender_id` may message `receiver_id`.
    ///
    /// On success the receiver's conversation with the sender is created if
    /// missing. That call is best effort and never changes the verdict.
    pub async fn validate(&self, sender_id: &str, receiver_id: &str) -> Verdict {
        let lookup = self.contacts.get_contact_status(sender_id, receiver_id);
        let status = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(sender = %sender_id, receiver = %receiver_id, error = %e, "Contact lookup failed");
                return Verdict::Reject(SystemNotice::ServerError);
            }
            Err(_) => {
                warn!(sender = %sender_id, receiver = %receiver_id, "Contact lookup timed out");
                return Verdict::Reject(SystemNotice::ServerError);
            }
        };

        if !status.allows_delivery() {
            info!(sender = %sender_id, receiver = %receiver_id, ?status, "Users are not contacts");
            return Verdict::Reject(SystemNotice::NotFriends);
        }

        let create = self
            .sessions
            .create_session_if_not_exist(receiver_id, sender_id);
        match tokio::time::timeout(self.timeout, create).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(owner = %receiver_id, contact = %sender_id, error = %e, "Failed to create receiver session");
            }
            Err(_) => {
                warn!(owner = %receiver_id, contact = %sender_id, "Receiver session creation timed out");
            }
        }

        Verdict::Deliver
    }
}
