//! Conversation state and the transitions that stream events drive.
//!
//! [`ChatState`] holds one [`ConversationView`] per conversation id. A turn is
//! opened with [`ChatState::begin_turn`] (or [`ChatState::begin_edit`]), which
//! hands back a [`TurnTicket`] carrying a fresh generation. Events are applied
//! with that ticket; once the turn is finished, or superseded, events bearing
//! the old generation are dropped. Only one turn per conversation may be open.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::frame::ParseDiagnostic;
use crate::messages::StreamEvent;
use crate::model::{title_from, Conversation, ConversationStatus, Message, Role};

pub type Generation = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("a response is still streaming for conversation {0}")]
    Busy(String),
    #[error("message index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("message {0} is not a user message")]
    NotUserMessage(usize),
    #[error("question is empty")]
    EmptyQuestion,
}

/// Identifies one open turn of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnTicket {
    pub conversation_id: String,
    pub generation: Generation,
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Applied,
    /// `complete` was seen on a turn without a server error; the
    /// conversation should be persisted once the stream has ended.
    PersistRequested,
    /// The ticket no longer matches the open turn.
    Stale,
}

/// How the transport side of a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Finished,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenTurn {
    generation: Generation,
    completed: bool,
    /// The server sent `error` during this turn.
    failed: bool,
}

/// A conversation plus the transient indicators shown while it streams.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub loading: bool,
    pub loading_message: Option<String>,
    pub typing: bool,
    pub error: Option<String>,
    pub diagnostics: Vec<ParseDiagnostic>,
    generation: Generation,
    open_turn: Option<OpenTurn>,
}

impl ConversationView {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            loading: false,
            loading_message: None,
            typing: false,
            error: None,
            diagnostics: Vec::new(),
            generation: 0,
            open_turn: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.open_turn.is_some()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    fn accepts(&self, ticket: &TurnTicket) -> bool {
        matches!(self.open_turn, Some(turn) if turn.generation == ticket.generation)
    }

    fn open(&mut self, conversation_id: &str) -> TurnTicket {
        self.generation += 1;
        self.open_turn = Some(OpenTurn {
            generation: self.generation,
            completed: false,
            failed: false,
        });
        self.loading = false;
        self.loading_message = None;
        self.typing = false;
        self.error = None;
        self.diagnostics.clear();
        TurnTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.generation,
        }
    }
}

/// Apply one event to a view. Does no I/O.
pub fn project(view: &mut ConversationView, event: &StreamEvent) -> Projection {
    match event {
        StreamEvent::Loading(message) => {
            view.loading = true;
            view.loading_message = message.clone();
        }
        StreamEvent::Chunk(text) => {
            match view.conversation.last_assistant_mut() {
                Some(last) => last.content.push_str(text),
                None => tracing::warn!(
                    conversation = %view.conversation.id,
                    "chunk arrived with no assistant message to extend"
                ),
            }
            view.loading = false;
            view.loading_message = None;
            view.typing = true;
        }
        StreamEvent::Sources(sources) => {
            if let Some(last) = view.conversation.last_assistant_mut() {
                last.sources = Some(sources.clone());
            }
        }
        StreamEvent::Complete => {
            view.typing = false;
            view.loading = false;
            view.loading_message = None;
            let Some(turn) = view.open_turn.as_mut() else {
                return Projection::Applied;
            };
            turn.completed = true;
            if !turn.failed {
                return Projection::PersistRequested;
            }
        }
        StreamEvent::Error(message) => {
            view.loading = false;
            view.loading_message = None;
            view.error = Some(message.clone());
            if let Some(turn) = view.open_turn.as_mut() {
                turn.failed = true;
            }
        }
    }
    Projection::Applied
}

/// All conversations known to this client, keyed by id.
#[derive(Debug, Default)]
pub struct ChatState {
    views: HashMap<String, ConversationView>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty conversation and return its id.
    pub fn new_conversation(&mut self, now: DateTime<Utc>) -> String {
        let conversation = Conversation::new(now);
        let id = conversation.id.clone();
        self.views.insert(id.clone(), ConversationView::new(conversation));
        id
    }

    /// Insert a conversation loaded from the store, replacing any idle copy.
    pub fn insert(&mut self, conversation: Conversation) -> Result<(), ProjectError> {
        if let Some(existing) = self.views.get(&conversation.id) {
            if existing.is_streaming() {
                return Err(ProjectError::Busy(conversation.id));
            }
        }
        self.views
            .insert(conversation.id.clone(), ConversationView::new(conversation));
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<ConversationView> {
        self.views.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ConversationView> {
        self.views.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.views.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Id of some conversation with an open turn.
    pub fn streaming(&self) -> Option<&str> {
        self.views
            .iter()
            .find(|(_, view)| view.is_streaming())
            .map(|(id, _)| id.as_str())
    }

    /// Drop every view. Callers check [`ChatState::streaming`] first.
    pub fn clear(&mut self) {
        self.views.clear();
    }

    /// Keep a cached view in step with a rename done in the store.
    pub fn set_title(&mut self, id: &str, title: &str) {
        if let Some(view) = self.views.get_mut(id) {
            view.conversation.title = title.to_string();
            view.conversation.first_message = title.to_string();
        }
    }

    pub fn set_status(&mut self, id: &str, status: ConversationStatus) {
        if let Some(view) = self.views.get_mut(id) {
            view.conversation.status = status;
        }
    }

    /// Append the user's question and an empty assistant message, and open a
    /// new turn. Rejected while another turn of the same conversation is open.
    pub fn begin_turn(
        &mut self,
        id: &str,
        question: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnTicket, ProjectError> {
        if question.trim().is_empty() {
            return Err(ProjectError::EmptyQuestion);
        }
        let view = self.open_view(id)?;
        let conversation = &mut view.conversation;
        if conversation.messages.is_empty() && conversation.first_message.is_empty() {
            conversation.first_message = question.to_string();
            conversation.title = title_from(question);
            conversation.timestamp = now;
        }
        conversation.messages.push(Message::user(question, now));
        conversation.messages.push(Message::pending_assistant(now));
        conversation.last_message = Some(question.to_string());
        conversation.last_message_time = Some(now);
        Ok(view.open(id))
    }

    /// Replace the user message at `index`, discard everything after it and
    /// open a new turn for the edited question.
    pub fn begin_edit(
        &mut self,
        id: &str,
        index: usize,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnTicket, ProjectError> {
        if content.trim().is_empty() {
            return Err(ProjectError::EmptyQuestion);
        }
        let view = self.open_view(id)?;
        let conversation = &mut view.conversation;
        let original = conversation
            .messages
            .get(index)
            .ok_or(ProjectError::IndexOutOfRange(index))?;
        if original.role != Role::User {
            return Err(ProjectError::NotUserMessage(index));
        }
        let mut edited = original.clone();
        edited.content = content.to_string();
        conversation.messages.truncate(index);
        conversation.messages.push(edited);
        conversation.messages.push(Message::pending_assistant(now));
        conversation.last_message = Some(content.to_string());
        conversation.last_message_time = Some(now);
        Ok(view.open(id))
    }

    /// Apply an event for the turn identified by `ticket`.
    pub fn apply(&mut self, ticket: &TurnTicket, event: &StreamEvent) -> Projection {
        match self.views.get_mut(&ticket.conversation_id) {
            Some(view) if view.accepts(ticket) => project(view, event),
            _ => {
                tracing::debug!(
                    conversation = %ticket.conversation_id,
                    generation = ticket.generation,
                    kind = event.kind(),
                    "dropping event from stale turn"
                );
                Projection::Stale
            }
        }
    }

    pub fn record_diagnostic(&mut self, ticket: &TurnTicket, diagnostic: ParseDiagnostic) {
        if let Some(view) = self.views.get_mut(&ticket.conversation_id) {
            if view.accepts(ticket) {
                view.diagnostics.push(diagnostic);
            }
        }
    }

    /// Close the turn. Returns the conversation to persist when the turn saw
    /// `complete` and no server `error`; that is the only place a persist
    /// request is issued, so a turn is saved at most once.
    pub fn finish_turn(
        &mut self,
        ticket: &TurnTicket,
        outcome: TurnOutcome,
    ) -> Option<Conversation> {
        let view = self.views.get_mut(&ticket.conversation_id)?;
        if !view.accepts(ticket) {
            return None;
        }
        let turn = view.open_turn.take()?;
        view.loading = false;
        view.loading_message = None;
        view.typing = false;
        if let TurnOutcome::Failed(message) = outcome {
            view.error = Some(message);
        }
        (turn.completed && !turn.failed).then(|| view.conversation.clone())
    }

    fn open_view(&mut self, id: &str) -> Result<&mut ConversationView, ProjectError> {
        let view = self
            .views
            .get_mut(id)
            .ok_or_else(|| ProjectError::NotFound(id.to_string()))?;
        if view.is_streaming() {
            return Err(ProjectError::Busy(id.to_string()));
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn started(question: &str) -> (ChatState, TurnTicket) {
        let mut state = ChatState::new();
        let id = state.new_conversation(Utc::now());
        let ticket = state.begin_turn(&id, question, Utc::now()).unwrap();
        (state, ticket)
    }

    fn answer(state: &ChatState, ticket: &TurnTicket) -> String {
        state
            .get(&ticket.conversation_id)
            .and_then(|v| v.conversation.last_assistant())
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    #[test]
    fn chunks_accumulate_and_complete_requests_one_persist() {
        let (mut state, ticket) = started("Môn IT001 có mấy tín chỉ?");
        assert_eq!(state.apply(&ticket, &StreamEvent::Chunk("A".into())), Projection::Applied);
        assert_eq!(state.apply(&ticket, &StreamEvent::Chunk("B".into())), Projection::Applied);
        assert_eq!(state.apply(&ticket, &StreamEvent::Complete), Projection::PersistRequested);
        assert_eq!(answer(&state, &ticket), "AB");

        let saved = state.finish_turn(&ticket, TurnOutcome::Finished);
        assert!(saved.is_some());
        assert!(state.finish_turn(&ticket, TurnOutcome::Finished).is_none());
    }

    #[test]
    fn first_question_sets_title() {
        let (state, ticket) = started("Học phần này đánh giá thế nào?");
        let view = state.get(&ticket.conversation_id).unwrap();
        assert_eq!(view.conversation.title, "Học phần này đánh giá thế nào?");
        assert_eq!(view.conversation.messages.len(), 2);
        assert!(view.is_streaming());
    }

    #[test]
    fn loading_then_chunk_toggles_indicators() {
        let (mut state, ticket) = started("q");
        state.apply(&ticket, &StreamEvent::Loading(Some("Đang tìm kiếm".into())));
        let view = state.get(&ticket.conversation_id).unwrap();
        assert!(view.loading);
        assert_eq!(view.loading_message.as_deref(), Some("Đang tìm kiếm"));
        assert_eq!(answer(&state, &ticket), "");

        state.apply(&ticket, &StreamEvent::Chunk("x".into()));
        let view = state.get(&ticket.conversation_id).unwrap();
        assert!(!view.loading);
        assert!(view.loading_message.is_none());
        assert!(view.typing);

        state.apply(&ticket, &StreamEvent::Complete);
        assert!(!state.get(&ticket.conversation_id).unwrap().typing);
    }

    #[test]
    fn sources_are_attached_unchanged() {
        let (mut state, ticket) = started("q");
        let sources = vec![Source::new("CLO1", "IT001.pdf"), Source::new("CLO2", "IT001.pdf")];
        state.apply(&ticket, &StreamEvent::Sources(sources.clone()));
        state.apply(&ticket, &StreamEvent::Complete);
        let saved = state.finish_turn(&ticket, TurnOutcome::Finished).unwrap();
        assert_eq!(saved.last_assistant().unwrap().sources.as_ref(), Some(&sources));
    }

    #[test]
    fn server_error_keeps_partial_content() {
        let (mut state, ticket) = started("q");
        state.apply(&ticket, &StreamEvent::Chunk("partial".into()));
        state.apply(&ticket, &StreamEvent::Error("Vectorstore not ready".into()));
        let view = state.get(&ticket.conversation_id).unwrap();
        assert_eq!(view.error.as_deref(), Some("Vectorstore not ready"));
        assert_eq!(answer(&state, &ticket), "partial");
    }

    #[test]
    fn error_then_complete_is_not_persisted() {
        let (mut state, ticket) = started("q");
        state.apply(&ticket, &StreamEvent::Error("Vectorstore not ready".into()));
        assert_eq!(state.apply(&ticket, &StreamEvent::Complete), Projection::Applied);

        assert!(state.finish_turn(&ticket, TurnOutcome::Finished).is_none());
        let view = state.get(&ticket.conversation_id).unwrap();
        assert!(!view.is_streaming());
        assert_eq!(view.error.as_deref(), Some("Vectorstore not ready"));
    }

    #[test]
    fn next_turn_after_server_error_is_persisted() {
        let (mut state, first) = started("q");
        state.apply(&first, &StreamEvent::Error("busy".into()));
        state.apply(&first, &StreamEvent::Complete);
        state.finish_turn(&first, TurnOutcome::Finished);

        let second = state
            .begin_turn(&first.conversation_id, "again", Utc::now())
            .unwrap();
        state.apply(&second, &StreamEvent::Chunk("ok".into()));
        assert_eq!(state.apply(&second, &StreamEvent::Complete), Projection::PersistRequested);
        assert!(state.finish_turn(&second, TurnOutcome::Finished).is_some());
    }

    #[test]
    fn streaming_reports_an_open_turn() {
        let (mut state, ticket) = started("q");
        assert_eq!(state.streaming(), Some(ticket.conversation_id.as_str()));
        state.finish_turn(&ticket, TurnOutcome::Finished);
        assert_eq!(state.streaming(), None);
        assert_eq!(state.len(), 1);
        state.clear();
        assert!(state.is_empty());
    }

    #[test]
    fn failed_turn_keeps_partial_text_and_rejects_late_events() {
        let (mut state, ticket) = started("q");
        state.apply(&ticket, &StreamEvent::Chunk("par".into()));
        let saved = state.finish_turn(&ticket, TurnOutcome::Failed("timed out".into()));
        assert!(saved.is_none());
        assert_eq!(
            state.apply(&ticket, &StreamEvent::Chunk("tial".into())),
            Projection::Stale
        );
        let view = state.get(&ticket.conversation_id).unwrap();
        assert_eq!(view.error.as_deref(), Some("timed out"));
        assert_eq!(answer(&state, &ticket), "par");
    }

    #[test]
    fn second_turn_is_rejected_while_streaming() {
        let (mut state, ticket) = started("first");
        let err = state
            .begin_turn(&ticket.conversation_id, "second", Utc::now())
            .unwrap_err();
        assert_eq!(err, ProjectError::Busy(ticket.conversation_id.clone()));
        assert_eq!(state.get(&ticket.conversation_id).unwrap().conversation.messages.len(), 2);
    }

    #[test]
    fn superseded_generation_is_ignored() {
        let (mut state, first) = started("first");
        state.apply(&first, &StreamEvent::Chunk("one".into()));
        state.finish_turn(&first, TurnOutcome::Finished);
        let second = state
            .begin_turn(&first.conversation_id, "second", Utc::now())
            .unwrap();
        assert!(second.generation > first.generation);

        assert_eq!(state.apply(&first, &StreamEvent::Chunk("stale".into())), Projection::Stale);
        state.apply(&second, &StreamEvent::Chunk("two".into()));
        assert_eq!(answer(&state, &second), "two");
    }

    #[test]
    fn edit_discards_later_messages() {
        let (mut state, ticket) = started("first");
        state.apply(&ticket, &StreamEvent::Chunk("answer one".into()));
        state.apply(&ticket, &StreamEvent::Complete);
        state.finish_turn(&ticket, TurnOutcome::Finished);
        let second = state
            .begin_turn(&ticket.conversation_id, "second", Utc::now())
            .unwrap();
        state.finish_turn(&second, TurnOutcome::Finished);

        let edit = state
            .begin_edit(&ticket.conversation_id, 0, "first, edited", Utc::now())
            .unwrap();
        let view = state.get(&edit.conversation_id).unwrap();
        let contents: Vec<_> = view.conversation.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first, edited", ""]);
        assert!(view.is_streaming());
    }

    #[test]
    fn edit_rejects_assistant_index() {
        let (mut state, ticket) = started("q");
        state.finish_turn(&ticket, TurnOutcome::Finished);
        assert_eq!(
            state.begin_edit(&ticket.conversation_id, 1, "x", Utc::now()),
            Err(ProjectError::NotUserMessage(1))
        );
        assert_eq!(
            state.begin_edit(&ticket.conversation_id, 5, "x", Utc::now()),
            Err(ProjectError::IndexOutOfRange(5))
        );
    }

    #[test]
    fn diagnostics_are_kept_for_the_open_turn() {
        let (mut state, ticket) = started("q");
        state.record_diagnostic(
            &ticket,
            ParseDiagnostic {
                line: "data: {oops".into(),
                reason: "expected value".into(),
            },
        );
        assert_eq!(state.get(&ticket.conversation_id).unwrap().diagnostics.len(), 1);
    }

    #[test]
    fn empty_question_is_rejected() {
        let mut state = ChatState::new();
        let id = state.new_conversation(Utc::now());
        assert_eq!(state.begin_turn(&id, "   ", Utc::now()), Err(ProjectError::EmptyQuestion));
    }
}
