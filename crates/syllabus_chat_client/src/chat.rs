//! Chat controller: runs turns against the API, projects their events into
//! [`ChatState`] and writes finished conversations to the store.

use chrono::Utc;

use crate::client::{Client, SessionError};
use crate::frame::Frame;
use crate::messages::StreamEvent;
use crate::model::{Conversation, ConversationStatus, SharedChat, Source, UserIdentity};
use crate::projector::{ChatState, ConversationView, ProjectError, TurnOutcome, TurnTicket};
use crate::store::{ConversationStore, ListFilter, SaveOutcome, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("guest limit of {0} messages reached; sign in to keep chatting")]
    GuestLimitReached(usize),
    #[error("sign in to use chat history")]
    SignInRequired,
    #[error("title is empty")]
    EmptyTitle,
}

/// Result of one question/answer turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub conversation_id: String,
    pub answer: String,
    pub sources: Option<Vec<Source>>,
    pub completed: bool,
    /// Error reported by the server in the stream, if any.
    pub server_error: Option<String>,
    pub diagnostics: usize,
    /// `None` when nothing was written (guest, or no `complete`).
    pub persisted: Option<SaveOutcome>,
}

pub struct ChatController<S> {
    client: Client,
    store: S,
    state: ChatState,
    user: Option<UserIdentity>,
    guest_limit: usize,
    guest_sent: usize,
    history_limit: usize,
}

impl<S: ConversationStore> ChatController<S> {
    pub fn new(client: Client, store: S, user: Option<UserIdentity>) -> Self {
        Self {
            client,
            store,
            state: ChatState::new(),
            user,
            guest_limit: crate::config::DEFAULT_GUEST_MESSAGE_LIMIT,
            guest_sent: 0,
            history_limit: crate::config::DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_guest_limit(mut self, limit: usize) -> Self {
        self.guest_limit = limit;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// Mutable access for callers driving turns by hand.
    pub fn state_mut(&mut self) -> &mut ChatState {
        &mut self.state
    }

    pub fn conversation(&self, id: &str) -> Option<&ConversationView> {
        self.state.get(id)
    }

    /// Start an empty conversation; it is persisted after its first answer.
    pub fn new_chat(&mut self) -> String {
        self.state.new_conversation(Utc::now())
    }

    /// Load a stored conversation so it can be continued.
    pub async fn open(&mut self, id: &str) -> Result<&ConversationView, ChatError> {
        let user_id = self.require_user()?.id.clone();
        let conversation = self.store.load(&user_id, id).await?;
        self.state.insert(conversation)?;
        self.state
            .get(id)
            .ok_or_else(|| ProjectError::NotFound(id.to_string()).into())
    }

    /// Ask `question` in conversation `id` (a new one when `None`).
    ///
    /// `observer` sees every event as it arrives, before it is projected.
    /// A transport failure is recorded on the conversation and returned as
    /// [`ChatError::Session`]; text already streamed stays in place.
    pub async fn send<F>(
        &mut self,
        id: Option<&str>,
        question: &str,
        observer: F,
    ) -> Result<TurnReport, ChatError>
    where
        F: FnMut(&StreamEvent),
    {
        self.check_guest_limit()?;
        if question.trim().is_empty() {
            return Err(ProjectError::EmptyQuestion.into());
        }
        let id = match id {
            Some(id) => {
                self.ensure_loaded(id).await?;
                id.to_string()
            }
            None => self.new_chat(),
        };
        let ticket = self.state.begin_turn(&id, question, Utc::now())?;
        self.count_guest_question();
        self.run_turn(ticket, question, observer).await
    }

    /// Replace the user message at `index` with `content`, drop every later
    /// message and stream a fresh answer.
    pub async fn edit_and_resend<F>(
        &mut self,
        id: &str,
        index: usize,
        content: &str,
        observer: F,
    ) -> Result<TurnReport, ChatError>
    where
        F: FnMut(&StreamEvent),
    {
        self.check_guest_limit()?;
        self.ensure_loaded(id).await?;
        let ticket = self.state.begin_edit(id, index, content, Utc::now())?;
        self.count_guest_question();
        self.run_turn(ticket, content, observer).await
    }

    async fn run_turn<F>(
        &mut self,
        ticket: TurnTicket,
        question: &str,
        mut observer: F,
    ) -> Result<TurnReport, ChatError>
    where
        F: FnMut(&StreamEvent),
    {
        tracing::info!(
            conversation = %ticket.conversation_id,
            generation = ticket.generation,
            "turn started"
        );
        let email = self.user.as_ref().and_then(|u| u.email.clone());
        let state = &mut self.state;
        let result = self
            .client
            .ask_stream(question, email.as_deref(), |frame| match frame {
                Frame::Event(event) => {
                    observer(&event);
                    state.apply(&ticket, &event);
                }
                Frame::Diagnostic(diagnostic) => state.record_diagnostic(&ticket, diagnostic),
            })
            .await;

        let outcome = match &result {
            Ok(_) => TurnOutcome::Finished,
            Err(e) => TurnOutcome::Failed(e.to_string()),
        };
        let snapshot = self.state.finish_turn(&ticket, outcome);

        let persisted = match (snapshot, &self.user) {
            (Some(conversation), Some(user)) => {
                Some(self.store.save(&user.id, &conversation).await?)
            }
            _ => None,
        };

        let summary = result.map_err(|e| {
            tracing::error!(conversation = %ticket.conversation_id, error = %e, "turn failed");
            e
        })?;

        let view = self
            .state
            .get(&ticket.conversation_id)
            .ok_or_else(|| ProjectError::NotFound(ticket.conversation_id.clone()))?;
        let last = view.conversation.last_assistant();
        Ok(TurnReport {
            conversation_id: ticket.conversation_id.clone(),
            answer: last.map(|m| m.content.clone()).unwrap_or_default(),
            sources: last.and_then(|m| m.sources.clone()),
            completed: summary.completed,
            server_error: summary.server_error,
            diagnostics: summary.diagnostics,
            persisted,
        })
    }

    /// Active conversations, newest first. `limit` overrides the configured
    /// history limit.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<Conversation>, ChatError> {
        let user = self.require_user()?;
        let limit = limit.unwrap_or(self.history_limit);
        Ok(self.store.list(&user.id, ListFilter::Active, limit).await?)
    }

    pub async fn archived(&self) -> Result<Vec<Conversation>, ChatError> {
        let user = self.require_user()?;
        Ok(self
            .store
            .list(&user.id, ListFilter::Archived, usize::MAX)
            .await?)
    }

    /// Active conversations whose title or messages contain `query`.
    pub async fn search(&self, query: &str) -> Result<Vec<Conversation>, ChatError> {
        let user = self.require_user()?;
        let chats = self
            .store
            .list(&user.id, ListFilter::Active, usize::MAX)
            .await?;
        Ok(chats.into_iter().filter(|c| c.matches(query)).collect())
    }

    pub async fn rename(&mut self, id: &str, title: &str) -> Result<Conversation, ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::EmptyTitle);
        }
        let user_id = self.require_user()?.id.clone();
        let conversation = self.store.rename(&user_id, id, title).await?;
        self.state.set_title(id, title);
        Ok(conversation)
    }

    /// Archiving closes the conversation locally as well.
    pub async fn archive(&mut self, id: &str) -> Result<Conversation, ChatError> {
        self.ensure_idle(id)?;
        let user_id = self.require_user()?.id.clone();
        let conversation = self
            .store
            .set_status(&user_id, id, ConversationStatus::Archived, Utc::now())
            .await?;
        self.state.remove(id);
        Ok(conversation)
    }

    pub async fn unarchive(&mut self, id: &str) -> Result<Conversation, ChatError> {
        let user_id = self.require_user()?.id.clone();
        let conversation = self
            .store
            .set_status(&user_id, id, ConversationStatus::Active, Utc::now())
            .await?;
        self.state.set_status(id, ConversationStatus::Active);
        Ok(conversation)
    }

    pub async fn delete(&mut self, id: &str) -> Result<(), ChatError> {
        self.ensure_idle(id)?;
        let user_id = self.require_user()?.id.clone();
        self.store.delete(&user_id, id).await?;
        self.state.remove(id);
        Ok(())
    }

    /// Delete every stored conversation of the user, and forget the loaded
    /// ones so a later send cannot write them back.
    pub async fn clear_history(&mut self) -> Result<usize, ChatError> {
        let user_id = self.require_user()?.id.clone();
        if let Some(id) = self.state.streaming() {
            return Err(ProjectError::Busy(id.to_string()).into());
        }
        let removed = self.store.clear(&user_id).await?;
        self.state.clear();
        tracing::info!(removed, "chat history cleared");
        Ok(removed)
    }

    pub async fn share(&self, id: &str) -> Result<SharedChat, ChatError> {
        let user = self.require_user()?;
        Ok(self.store.share(&user.id, id, Utc::now()).await?)
    }

    /// Viewing a shared chat requires a signed-in user.
    pub async fn open_shared(&self, share_id: &str) -> Result<SharedChat, ChatError> {
        self.require_user()?;
        Ok(self.store.open_shared(share_id).await?)
    }

    fn check_guest_limit(&self) -> Result<(), ChatError> {
        if self.user.is_none() && self.guest_sent >= self.guest_limit {
            return Err(ChatError::GuestLimitReached(self.guest_limit));
        }
        Ok(())
    }

    fn count_guest_question(&mut self) {
        if self.user.is_none() {
            self.guest_sent += 1;
        }
    }

    fn require_user(&self) -> Result<&UserIdentity, ChatError> {
        self.user.as_ref().ok_or(ChatError::SignInRequired)
    }

    fn ensure_idle(&self, id: &str) -> Result<(), ChatError> {
        match self.state.get(id) {
            Some(view) if view.is_streaming() => Err(ProjectError::Busy(id.to_string()).into()),
            _ => Ok(()),
        }
    }

    async fn ensure_loaded(&mut self, id: &str) -> Result<(), ChatError> {
        if self.state.contains(id) {
            return Ok(());
        }
        match &self.user {
            Some(user) => {
                let conversation = self.store.load(&user.id, id).await?;
                self.state.insert(conversation)?;
                Ok(())
            }
            None => Err(ProjectError::NotFound(id.to_string()).into()),
        }
    }
}
