//! Course-syllabus chatbot client library: streamed answers from the
//! `ask_stream` endpoint, conversation state, and chat history persistence.
//! Used by the `syllabus-chat` binary.

pub mod chat;
pub mod client;
pub mod config;
pub mod frame;
pub mod messages;
pub mod model;
pub mod projector;
pub mod store;

pub use chat::{ChatController, ChatError, TurnReport};
pub use client::{Client, SessionError, StreamSummary};
pub use config::{default_config_path, Config, ConfigError};
pub use frame::{Frame, FrameParser, ParseDiagnostic};
pub use messages::StreamEvent;
pub use model::{Conversation, ConversationStatus, Message, Role, SharedChat, Source, UserIdentity};
pub use projector::{ChatState, ConversationView, Projection, ProjectError, TurnOutcome, TurnTicket};
pub use store::{ConversationStore, FileStore, ListFilter, MemoryStore, SaveOutcome, StoreError};
