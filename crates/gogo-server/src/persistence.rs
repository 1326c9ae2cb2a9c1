//! Bridge between the async hub and the synchronous store and cache.
//!
//! Every accepted message is written durably before fan-out. Recent-message
//! lists are kept cache-aside: they are only ever extended by appends, and a
//! miss is reported as "no recent list" rather than rebuilt from the store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use gogo_shared::protocol::MessageView;
use gogo_store::{Database, GroupInfo, Message};

use crate::cache::MessageCache;
use crate::error::{CacheError, PersistenceError};

#[derive(Clone)]
pub struct Persistence {
    db: Arc<Mutex<Database>>,
    cache: Arc<dyn MessageCache>,
    cache_ttl: Duration,
    list_limit: usize,
}

impl Persistence {
    pub fn new(
        db: Database,
        cache: Arc<dyn MessageCache>,
        cache_ttl: Duration,
        list_limit: usize,
    ) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            cache,
            cache_ttl,
            list_limit: list_limit.max(1),
        }
    }

    /// Run a store operation on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> gogo_store::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| PersistenceError::Poisoned)?;
            f(&guard).map_err(PersistenceError::from)
        })
        .await?
    }

    /// Durably record a freshly ingested message.
    pub async fn append(&self, message: &Message) -> Result<(), PersistenceError> {
        let message = message.clone();
        self.with_db(move |db| db.insert_message(&message)).await
    }

    /// Flip a message to delivered. Idempotent.
    pub async fn mark_delivered(&self, id: &str) -> Result<bool, PersistenceError> {
        let id = id.to_string();
        self.with_db(move |db| db.mark_message_sent(&id)).await
    }

    pub async fn group_info(&self, group_id: &str) -> Result<GroupInfo, PersistenceError> {
        let group_id = group_id.to_string();
        self.with_db(move |db| db.get_group(&group_id)).await
    }

    /// Most recent `list_limit` messages between two users, oldest first.
    pub async fn conversation_history(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<Vec<MessageView>, PersistenceError> {
        let (a, b) = (user_a.to_string(), user_b.to_string());
        let limit = self.list_limit as u32;
        let messages = self
            .with_db(move |db| db.list_conversation(&a, &b, limit))
            .await?;
        Ok(messages.iter().map(Message::to_view).collect())
    }

    pub async fn group_history(&self, group_id: &str) -> Result<Vec<MessageView>, PersistenceError> {
        let group_id = group_id.to_string();
        let limit = self.list_limit as u32;
        let messages = self
            .with_db(move |db| db.list_group_messages(&group_id, limit))
            .await?;
        Ok(messages.iter().map(Message::to_view).collect())
    }

    // ------------------------------------------------------------------
    // Cache-aside lists
    // ------------------------------------------------------------------

    /// Cached recent list for `key`, or `None` on a miss.
    pub async fn cache_list(&self, key: &str) -> Result<Option<Vec<MessageView>>, CacheError> {
        match self.cache.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Append one envelope to the cached list under `key`, starting a new
    /// list on a miss. The list keeps the newest `list_limit` entries and
    /// its expiry is refreshed.
    pub async fn append_to_cache(&self, key: &str, view: &MessageView) -> Result<(), CacheError> {
        let mut list = match self.cache_list(key).await {
            Ok(list) => list.unwrap_or_default(),
            Err(CacheError::Json(e)) => {
                warn!(key, error = %e, "Discarding unreadable cached list");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        list.push(view.clone());
        if list.len() > self.list_limit {
            let excess = list.len() - self.list_limit;
            list.drain(..excess);
        }

        let raw = serde_json::to_string(&list)?;
        self.cache.set_ex(key, &raw, self.cache_ttl).await?;
        debug!(key, len = list.len(), "Appended to cached list");
        Ok(())
    }
}
