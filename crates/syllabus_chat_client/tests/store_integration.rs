//! Integration tests for conversation persistence, run against both the
//! in-memory store and the JSON file store.

use chrono::{Duration, TimeZone, Utc};
use syllabus_chat_client::model::Message;
use syllabus_chat_client::{
    ChatController, ChatError, Client, Conversation, ConversationStatus, ConversationStore,
    FileStore, ListFilter, MemoryStore, SaveOutcome, StoreError, UserIdentity,
};

const USER: &str = "user-1";

fn conversation(id: &str, question: &str, minutes: i64) -> Conversation {
    let at = Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes);
    let mut c = Conversation::new(at);
    c.id = id.to_string();
    c.title = question.to_string();
    c.first_message = question.to_string();
    c.messages.push(Message::user(question, at));
    c.last_message = Some(question.to_string());
    c.last_message_time = Some(at);
    c
}

async fn save_creates_then_updates(store: impl ConversationStore) {
    let mut c = conversation("c1", "What is IT001?", 0);
    assert_eq!(store.save(USER, &c).await.unwrap(), SaveOutcome::Created);

    store.rename(USER, "c1", "Intro course").await.unwrap();
    c.messages.push(Message::user("And IT002?", c.timestamp));
    c.last_message = Some("And IT002?".into());
    assert_eq!(store.save(USER, &c).await.unwrap(), SaveOutcome::Updated);

    let stored = store.load(USER, "c1").await.unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.last_message.as_deref(), Some("And IT002?"));
    // The rename survives a later save.
    assert_eq!(stored.title, "Intro course");
    assert_eq!(stored.first_message, "Intro course");
}

async fn listing_and_archiving(store: impl ConversationStore) {
    for (id, minutes) in [("old", 0), ("mid", 10), ("new", 20)] {
        store
            .save(USER, &conversation(id, id, minutes))
            .await
            .unwrap();
    }
    store
        .save("someone-else", &conversation("other", "other", 30))
        .await
        .unwrap();

    let ids = |chats: Vec<Conversation>| chats.into_iter().map(|c| c.id).collect::<Vec<_>>();

    let active = store.list(USER, ListFilter::Active, 10).await.unwrap();
    assert_eq!(ids(active), ["new", "mid", "old"]);
    let limited = store.list(USER, ListFilter::Active, 2).await.unwrap();
    assert_eq!(ids(limited), ["new", "mid"]);

    let t0 = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
    store
        .set_status(USER, "old", ConversationStatus::Archived, t0)
        .await
        .unwrap();
    let archived = store
        .set_status(USER, "new", ConversationStatus::Archived, t0 + Duration::hours(1))
        .await
        .unwrap();
    assert!(archived.is_archived());
    assert!(archived.archived_at.is_some());

    let active = store.list(USER, ListFilter::Active, 10).await.unwrap();
    assert_eq!(ids(active), ["mid"]);
    let archived = store.list(USER, ListFilter::Archived, 10).await.unwrap();
    assert_eq!(ids(archived), ["new", "old"]);

    let restored = store
        .set_status(USER, "old", ConversationStatus::Active, t0)
        .await
        .unwrap();
    assert_eq!(restored.archived_at, None);
    let active = store.list(USER, ListFilter::Active, 10).await.unwrap();
    assert_eq!(ids(active), ["mid", "old"]);
}

async fn delete_and_clear(store: impl ConversationStore) {
    store.save(USER, &conversation("a", "a", 0)).await.unwrap();
    store.save(USER, &conversation("b", "b", 1)).await.unwrap();
    store.save(USER, &conversation("c", "c", 2)).await.unwrap();

    store.delete(USER, "a").await.unwrap();
    assert!(matches!(
        store.delete(USER, "a").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.load(USER, "a").await,
        Err(StoreError::NotFound(_))
    ));

    assert_eq!(store.clear(USER).await.unwrap(), 2);
    assert!(store.list_all(USER).await.unwrap().is_empty());
}

async fn sharing_counts_views(store: impl ConversationStore) {
    let mut c = conversation("c1", "", 0);
    c.title.clear();
    store.save(USER, &c).await.unwrap();

    let now = Utc::now();
    let shared = store.share(USER, "c1", now).await.unwrap();
    assert_eq!(shared.original_chat_id, "c1");
    assert_eq!(shared.original_user_id, USER);
    assert_eq!(shared.title, "Untitled Chat");
    assert_eq!(shared.share_count, 0);

    store.open_shared(&shared.share_id).await.unwrap();
    let viewed = store.open_shared(&shared.share_id).await.unwrap();
    assert_eq!(viewed.share_count, 2);
    assert_eq!(viewed.messages, c.messages);

    assert!(matches!(
        store.open_shared("missing").await,
        Err(StoreError::SharedNotFound(_))
    ));
}

#[tokio::test]
async fn memory_store_save_creates_then_updates() {
    save_creates_then_updates(MemoryStore::new()).await;
}

#[tokio::test]
async fn file_store_save_creates_then_updates() {
    let dir = tempfile::tempdir().unwrap();
    save_creates_then_updates(FileStore::new(dir.path())).await;
    assert!(dir.path().join("users/user-1/chats/c1.json").exists());
}

#[tokio::test]
async fn memory_store_listing_and_archiving() {
    listing_and_archiving(MemoryStore::new()).await;
}

#[tokio::test]
async fn file_store_listing_and_archiving() {
    let dir = tempfile::tempdir().unwrap();
    listing_and_archiving(FileStore::new(dir.path())).await;
}

#[tokio::test]
async fn memory_store_delete_and_clear() {
    delete_and_clear(MemoryStore::new()).await;
}

#[tokio::test]
async fn file_store_delete_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    delete_and_clear(FileStore::new(dir.path())).await;
}

#[tokio::test]
async fn memory_store_sharing_counts_views() {
    sharing_counts_views(MemoryStore::new()).await;
}

#[tokio::test]
async fn file_store_sharing_counts_views() {
    let dir = tempfile::tempdir().unwrap();
    sharing_counts_views(FileStore::new(dir.path())).await;
}

#[tokio::test]
async fn file_store_documents_use_camel_case_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    store
        .save(USER, &conversation("c1", "What is IT001?", 0))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("users/user-1/chats/c1.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["firstMessage"], "What is IT001?");
    assert_eq!(json["status"], "active");
    assert_eq!(json["messages"][0]["role"], "user");
}

#[tokio::test]
async fn file_store_skips_unreadable_documents() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    store.save(USER, &conversation("good", "q", 0)).await.unwrap();
    std::fs::write(dir.path().join("users/user-1/chats/bad.json"), "{ nope").unwrap();

    let all = store.list_all(USER).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "good");
}

#[tokio::test]
async fn file_store_clear_removes_unreadable_documents() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    store.save(USER, &conversation("good", "q", 0)).await.unwrap();
    let chats = dir.path().join("users/user-1/chats");
    std::fs::write(chats.join("bad.json"), "{ nope").unwrap();
    std::fs::write(chats.join("notes.txt"), "keep").unwrap();

    assert_eq!(store.clear(USER).await.unwrap(), 2);
    assert!(!chats.join("good.json").exists());
    assert!(!chats.join("bad.json").exists());
    assert!(chats.join("notes.txt").exists());
    assert_eq!(store.clear("nobody").await.unwrap(), 0);
}

#[tokio::test]
async fn file_store_rejects_path_like_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    assert!(matches!(
        store.load(USER, "../escape").await,
        Err(StoreError::InvalidId(_))
    ));
    assert!(matches!(
        store.list_all("../root").await,
        Err(StoreError::InvalidId(_))
    ));
}

fn controller(user: Option<UserIdentity>) -> ChatController<MemoryStore> {
    let client = Client::new("http://127.0.0.1:9", std::time::Duration::from_secs(1)).unwrap();
    ChatController::new(client, MemoryStore::new(), user)
}

#[tokio::test]
async fn history_operations_require_a_user() {
    let mut chat = controller(None);
    assert!(matches!(chat.history(None).await, Err(ChatError::SignInRequired)));
    assert!(matches!(chat.archived().await, Err(ChatError::SignInRequired)));
    assert!(matches!(chat.search("x").await, Err(ChatError::SignInRequired)));
    assert!(matches!(chat.clear_history().await, Err(ChatError::SignInRequired)));
    assert!(matches!(chat.open("c1").await, Err(ChatError::SignInRequired)));
    assert!(matches!(
        chat.open_shared("s1").await,
        Err(ChatError::SignInRequired)
    ));
}

#[tokio::test]
async fn controller_history_search_and_archive() {
    let mut chat = controller(Some(UserIdentity {
        id: USER.into(),
        email: None,
    }))
    .with_history_limit(2);
    for (id, q, minutes) in [
        ("c1", "Credits of IT001", 0),
        ("c2", "Prerequisites of IT002", 1),
        ("c3", "Exam format of IT001", 2),
    ] {
        chat.store().save(USER, &conversation(id, q, minutes)).await.unwrap();
    }

    let history = chat.history(None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, "c3");
    // An explicit limit may go past the configured one.
    assert_eq!(chat.history(Some(3)).await.unwrap().len(), 3);
    assert_eq!(chat.history(Some(1)).await.unwrap().len(), 1);

    let found = chat.search("it001").await.unwrap();
    let mut ids: Vec<_> = found.iter().map(|c| c.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["c1", "c3"]);

    chat.open("c3").await.unwrap();
    chat.archive("c3").await.unwrap();
    assert!(chat.conversation("c3").is_none());
    assert_eq!(chat.archived().await.unwrap().len(), 1);
    assert!(chat.search("exam").await.unwrap().is_empty());

    chat.unarchive("c3").await.unwrap();
    assert!(chat.archived().await.unwrap().is_empty());

    assert!(matches!(chat.rename("c1", "   ").await, Err(ChatError::EmptyTitle)));
    let renamed = chat.rename("c1", "  IT001 credits ").await.unwrap();
    assert_eq!(renamed.title, "IT001 credits");
}
