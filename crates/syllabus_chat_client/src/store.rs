//! Conversation persistence.
//!
//! [`ConversationStore`] is the seam to the document store: conversations are
//! keyed by user id and conversation id, shared copies by share id. Backends
//! implement six primitives; history, archiving, renaming and sharing are
//! built on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::model::{Conversation, ConversationStatus, SharedChat};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("shared chat {0} not found")]
    SharedNotFound(String),
    #[error("invalid document id: {0:?}")]
    InvalidId(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of [`ConversationStore::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Active,
    Archived,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn put(&self, user_id: &str, conversation: &Conversation) -> Result<(), StoreError>;
    /// Returns whether a document was removed.
    async fn remove(&self, user_id: &str, id: &str) -> Result<bool, StoreError>;
    async fn list_all(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;
    async fn get_shared(&self, share_id: &str) -> Result<Option<SharedChat>, StoreError>;
    async fn put_shared(&self, shared: &SharedChat) -> Result<(), StoreError>;

    /// Create the document if absent, otherwise update its messages and
    /// last-message fields. Title and status of an existing document are left
    /// alone so a rename or archive made elsewhere survives.
    async fn save(
        &self,
        user_id: &str,
        conversation: &Conversation,
    ) -> Result<SaveOutcome, StoreError> {
        match self.get(user_id, &conversation.id).await? {
            Some(mut stored) => {
                stored.messages = conversation.messages.clone();
                stored.last_message = conversation.last_message.clone();
                stored.last_message_time = conversation.last_message_time;
                self.put(user_id, &stored).await?;
                tracing::info!(conversation = %conversation.id, "conversation updated");
                Ok(SaveOutcome::Updated)
            }
            None => {
                self.put(user_id, conversation).await?;
                tracing::info!(conversation = %conversation.id, "conversation created");
                Ok(SaveOutcome::Created)
            }
        }
    }

    async fn load(&self, user_id: &str, id: &str) -> Result<Conversation, StoreError> {
        self.get(user_id, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Active conversations newest first, or archived ones most recently
    /// archived first.
    async fn list(
        &self,
        user_id: &str,
        filter: ListFilter,
        limit: usize,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut chats: Vec<Conversation> = self
            .list_all(user_id)
            .await?
            .into_iter()
            .filter(|c| match filter {
                ListFilter::Active => !c.is_archived(),
                ListFilter::Archived => c.is_archived(),
            })
            .collect();
        match filter {
            ListFilter::Active => chats.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
            ListFilter::Archived => chats.sort_by(|a, b| {
                b.archived_at
                    .unwrap_or(b.timestamp)
                    .cmp(&a.archived_at.unwrap_or(a.timestamp))
            }),
        }
        chats.truncate(limit);
        Ok(chats)
    }

    async fn set_status(
        &self,
        user_id: &str,
        id: &str,
        status: ConversationStatus,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self.load(user_id, id).await?;
        conversation.status = status;
        conversation.archived_at = match status {
            ConversationStatus::Archived => Some(now),
            ConversationStatus::Active => None,
        };
        self.put(user_id, &conversation).await?;
        tracing::info!(conversation = %id, ?status, "conversation status changed");
        Ok(conversation)
    }

    /// Renaming also rewrites `firstMessage`, which the history list shows.
    async fn rename(
        &self,
        user_id: &str,
        id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self.load(user_id, id).await?;
        conversation.title = title.to_string();
        conversation.first_message = title.to_string();
        self.put(user_id, &conversation).await?;
        Ok(conversation)
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
        if self.remove(user_id, id).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    /// Delete every conversation of the user; returns how many were removed.
    async fn clear(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for conversation in self.list_all(user_id).await? {
            if self.remove(user_id, &conversation.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Publish a copy of the conversation under a new share id.
    async fn share(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<SharedChat, StoreError> {
        let conversation = self.load(user_id, id).await?;
        let title = if conversation.title.is_empty() {
            "Untitled Chat".to_string()
        } else {
            conversation.title
        };
        let shared = SharedChat {
            share_id: uuid::Uuid::new_v4().to_string(),
            original_chat_id: conversation.id,
            original_user_id: user_id.to_string(),
            title,
            messages: conversation.messages,
            timestamp: now,
            share_count: 0,
        };
        self.put_shared(&shared).await?;
        tracing::info!(share_id = %shared.share_id, conversation = %id, "conversation shared");
        Ok(shared)
    }

    /// Fetch a shared copy and count the view.
    async fn open_shared(&self, share_id: &str) -> Result<SharedChat, StoreError> {
        let mut shared = self
            .get_shared(share_id)
            .await?
            .ok_or_else(|| StoreError::SharedNotFound(share_id.to_string()))?;
        shared.share_count += 1;
        self.put_shared(&shared).await?;
        Ok(shared)
    }
}

/// In-process store, for guests and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chats: Mutex<HashMap<(String, String), Conversation>>,
    shared: Mutex<HashMap<String, SharedChat>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<Conversation>, StoreError> {
        let chats = self.chats.lock().await;
        Ok(chats.get(&(user_id.to_string(), id.to_string())).cloned())
    }

    async fn put(&self, user_id: &str, conversation: &Conversation) -> Result<(), StoreError> {
        let mut chats = self.chats.lock().await;
        chats.insert(
            (user_id.to_string(), conversation.id.clone()),
            conversation.clone(),
        );
        Ok(())
    }

    async fn remove(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let mut chats = self.chats.lock().await;
        Ok(chats
            .remove(&(user_id.to_string(), id.to_string()))
            .is_some())
    }

    async fn list_all(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let chats = self.chats.lock().await;
        Ok(chats
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_shared(&self, share_id: &str) -> Result<Option<SharedChat>, StoreError> {
        Ok(self.shared.lock().await.get(share_id).cloned())
    }

    async fn put_shared(&self, shared: &SharedChat) -> Result<(), StoreError> {
        self.shared
            .lock()
            .await
            .insert(shared.share_id.clone(), shared.clone());
        Ok(())
    }
}

/// JSON documents on disk:
/// `<root>/users/<user>/chats/<id>.json` and `<root>/shared/<share_id>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chats_dir(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join("users")
            .join(checked_id(user_id)?)
            .join("chats"))
    }

    fn chat_path(&self, user_id: &str, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .chats_dir(user_id)?
            .join(format!("{}.json", checked_id(id)?)))
    }

    fn shared_path(&self, share_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join("shared")
            .join(format!("{}.json", checked_id(share_id)?)))
    }
}

/// Ids become file names; reject anything that could leave its directory.
fn checked_id(id: &str) -> Result<&str, StoreError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        Err(StoreError::InvalidId(id.to_string()))
    } else {
        Ok(id)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file so a reader never sees half a document.
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn get(&self, user_id: &str, id: &str) -> Result<Option<Conversation>, StoreError> {
        read_json(&self.chat_path(user_id, id)?).await
    }

    async fn put(&self, user_id: &str, conversation: &Conversation) -> Result<(), StoreError> {
        write_json(&self.chat_path(user_id, &conversation.id)?, conversation).await
    }

    async fn remove(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.chat_path(user_id, id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let dir = self.chats_dir(user_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut chats = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Conversation>(&path).await {
                Ok(Some(chat)) => chats.push(chat),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable conversation");
                }
            }
        }
        Ok(chats)
    }

    async fn get_shared(&self, share_id: &str) -> Result<Option<SharedChat>, StoreError> {
        read_json(&self.shared_path(share_id)?).await
    }

    async fn put_shared(&self, shared: &SharedChat) -> Result<(), StoreError> {
        write_json(&self.shared_path(&shared.share_id)?, shared).await
    }

    /// Removes every document file, including ones `list_all` cannot parse.
    async fn clear(&self, user_id: &str) -> Result<usize, StoreError> {
        let dir = self.chats_dir(user_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
