//! Conversation documents: messages, source citations and the conversation record
//! stored by the persistence collaborator.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Titles are cut to this many characters of the first message.
pub const TITLE_MAX_CHARS: usize = 50;

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One retrieved syllabus passage cited by an answer.
///
/// The server sends extra metadata (document type, page, chunk id, similarity
/// score); it is kept in `extra` so a citation round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub content: String,
    pub source: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Source {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
}

impl Message {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
            sources: None,
        }
    }

    /// Empty assistant message that a stream fills in.
    pub fn pending_assistant(timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            timestamp,
            sources: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
}

/// A persisted sequence of user/assistant turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub first_message: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// New, empty conversation with a fresh id. Title fields are filled by the
    /// first question.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            first_message: String::new(),
            messages: Vec::new(),
            timestamp,
            status: ConversationStatus::Active,
            last_message: None,
            last_message_time: None,
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == ConversationStatus::Archived
    }

    /// Last message, if it is an assistant message.
    pub fn last_assistant_mut(&mut self) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|m| m.role == Role::Assistant)
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.role == Role::Assistant)
    }

    /// Case-insensitive match against the title and every message body.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self
                .messages
                .iter()
                .any(|m| m.content.to_lowercase().contains(&needle))
    }
}

/// Title derived from the first question: 50 characters, `...` when cut.
pub fn title_from(first_message: &str) -> String {
    let mut chars = first_message.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Source locators in first-seen order, without repeats.
pub fn unique_locators(sources: &[Source]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for source in sources {
        if seen.insert(source.source.as_str()) {
            unique.push(source.source.as_str());
        }
    }
    unique
}

/// Signed-in user as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: Option<String>,
}

/// Read-only copy of a conversation published under a share id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedChat {
    pub share_id: String,
    pub original_chat_id: String,
    pub original_user_id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub share_count: u64,
}
