use std::path::Path;

use parley_storage::{
    Conversation, Folder, HealthStatus, Message, MessageRole, SqliteConversationStore, StoreConfig,
};

fn config_in(dir: &Path) -> StoreConfig {
    StoreConfig {
        database_path: dir.join("store").join("conversations.db"),
        fallback_dir: dir.join("fallback"),
        lock_dir: Some(dir.join("locks")),
        init_backoff_ms: 1,
        upgrade_blocked_wait_ms: 500,
        ..StoreConfig::default()
    }
}

fn conversation(title: &str) -> Conversation {
    let mut conversation = Conversation::new(title);
    conversation.push_message(Message::new(MessageRole::Human, "question"));
    conversation.push_message(Message::new(MessageRole::Assistant, "answer"));
    conversation
}

#[tokio::test]
async fn conversations_and_folders_persist_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());

    let store = SqliteConversationStore::open(config.clone());
    store.init().await.expect("init");
    let folder = store.save_folder(Folder::new("projects", None)).await.expect("folder");
    let mut filed = conversation("filed");
    filed.folder_id = Some(folder.id.clone());
    store
        .save_conversations(vec![filed.clone(), conversation("loose")])
        .await
        .expect("save");
    let saved = store.get_conversations().await.expect("read");
    store.close().await;

    let reopened = SqliteConversationStore::open(config);
    assert_eq!(reopened.get_conversations().await.expect("read after reopen"), saved);
    assert_eq!(reopened.get_folders().await.expect("folders"), vec![folder]);
    assert!(dir.path().join("fallback").join("conversations-backup.json").exists());
    assert!(dir.path().join("locks").join("parley-store-write.lock").exists());
}

#[tokio::test]
async fn dropped_table_is_recreated_and_refilled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let store = SqliteConversationStore::open(config.clone());
    store
        .save_conversations(vec![conversation("survivor")])
        .await
        .expect("save");

    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", config.database_path.display()))
        .await
        .expect("external connection");
    sqlx::query("DROP TABLE conversations")
        .execute(&pool)
        .await
        .expect("drop table");
    pool.close().await;

    let loaded = store.get_conversations().await.expect("read");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].title, "survivor");

    let health = store.check_database_health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.missing_tables.is_empty());
    assert_eq!(health.schema_version, Some(2));
}

#[tokio::test]
async fn force_reset_starts_from_an_empty_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteConversationStore::open(config_in(dir.path()));
    store
        .save_conversations(vec![conversation("temporary")])
        .await
        .expect("save");

    store.force_reset().await.expect("reset");
    assert!(store.get_conversations().await.expect("read").is_empty());

    let health = store.check_database_health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.schema_version, Some(1));
    assert_eq!(health.conversation_records, 0);
    assert!(!dir.path().join("fallback").join("conversations-backup.json").exists());
}
