use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parley_storage::backend::{CONVERSATIONS_TABLE, EXPECTED_TABLES, FOLDERS_TABLE};
use parley_storage::{
    Conversation, ConversationStore, Folder, HealthStatus, LockScope, MemoryBackend, MemorySlot,
    Message, MessageRole, StorageError, StoreConfig, merge_conversations,
};

type MemoryStore = ConversationStore<MemoryBackend, MemorySlot>;

fn test_config() -> StoreConfig {
    StoreConfig {
        init_backoff_ms: 1,
        upgrade_blocked_wait_ms: 50,
        max_recovery_attempts: 2,
        ..StoreConfig::default()
    }
}

fn store_on(backend: &MemoryBackend, slot: &MemorySlot) -> MemoryStore {
    ConversationStore::new(test_config(), backend.clone(), slot.clone())
}

fn conversation(title: &str, accessed: u64) -> Conversation {
    let mut conversation = Conversation::new(title);
    conversation.push_message(Message::new(MessageRole::Human, format!("hello from {title}")));
    conversation.push_message(Message::new(MessageRole::Assistant, "hi"));
    conversation.last_accessed_at = accessed;
    conversation
}

/// Content view that ignores the version stamp.
fn content(conversations: &[Conversation]) -> Vec<(String, String, usize, Option<String>, bool)> {
    let mut view = conversations
        .iter()
        .map(|conversation| {
            (
                conversation.id.to_string(),
                conversation.title.clone(),
                conversation.messages.len(),
                conversation.folder_id.as_ref().map(ToString::to_string),
                conversation.is_active,
            )
        })
        .collect::<Vec<_>>();
    view.sort();
    view
}

#[tokio::test]
async fn saved_conversations_read_back_in_order() {
    let store = MemoryStore::in_memory(test_config());
    store.init().await.expect("init");

    let saved = vec![conversation("first", 30), conversation("second", 20), conversation("third", 10)];
    store.save_conversations(saved.clone()).await.expect("save");

    let loaded = store.get_conversations().await.expect("read");
    let titles = loaded.iter().map(|c| c.title.as_str()).collect::<Vec<_>>();
    assert_eq!(titles, vec!["first", "second", "third"]);
    assert_eq!(loaded[0].messages, saved[0].messages);
    assert!(loaded.iter().all(|c| c.version.is_some()));

    let again = store.get_conversations().await.expect("read again");
    assert_eq!(again, loaded);
}

#[tokio::test]
async fn soft_deleted_conversation_is_hidden_but_still_stored() {
    let store = MemoryStore::in_memory(test_config());
    let live: Vec<Conversation> = serde_json::from_str(
        r#"[{"id":"a","title":"T1","messages":[{"role":"human","content":"hi"}],"isActive":true,"_version":1}]"#,
    )
    .expect("decode");
    store.save_conversations(live).await.expect("save live");

    let deleted: Vec<Conversation> = serde_json::from_str(
        r#"[{"id":"a","title":"T1","messages":[{"role":"human","content":"hi"}],"isActive":false,"_version":2}]"#,
    )
    .expect("decode");
    store.save_conversations(deleted).await.expect("save tombstone");

    assert!(store.get_conversations().await.expect("read").is_empty());

    let health = store.check_database_health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.conversation_records, 1);
    assert_eq!(health.active_conversations, 0);
    assert_eq!(health.backup_conversations, 0);
}

#[tokio::test]
async fn stale_copy_cannot_resurrect_a_deleted_conversation() {
    let store = MemoryStore::in_memory(test_config());
    let original = conversation("doomed", 10);
    store.save_conversations(vec![original.clone()]).await.expect("save");

    let mut records = store.get_conversation_records().await.expect("records");
    let stale = records.clone();
    records[0].soft_delete();
    store.save_conversations(records).await.expect("delete");

    let persisted = store.get_conversation_records().await.expect("records");
    let merged = merge_conversations(persisted, stale);
    assert_eq!(merged.len(), 1);
    assert!(merged[0].is_tombstone());

    store.save_conversations(merged).await.expect("save merged");
    assert!(store.get_conversations().await.expect("read").is_empty());
}

#[tokio::test]
async fn missing_conversations_table_next_to_folders_recovers_empty() {
    let backend = MemoryBackend::new();
    backend.upgrade_from_other_context(1, &[FOLDERS_TABLE]);
    let store = store_on(&backend, &MemorySlot::new());

    let conversations = store.get_conversations().await.expect("never throws");
    assert!(conversations.is_empty());

    let health = store.check_database_health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.missing_tables.is_empty());
    assert_eq!(health.tables.len(), EXPECTED_TABLES.len());
    assert!(health.schema_version.is_some_and(|version| version >= 2));
}

#[tokio::test]
async fn lost_primary_table_is_refilled_from_the_mirror() {
    let backend = MemoryBackend::new();
    let store = store_on(&backend, &MemorySlot::new());
    let saved = vec![conversation("kept", 10)];
    store.save_conversations(saved.clone()).await.expect("save");

    backend.drop_table(CONVERSATIONS_TABLE);
    let loaded = store.get_conversations().await.expect("read");
    assert_eq!(content(&loaded), content(&saved));

    // The restore wrote the mirror back as the primary snapshot.
    assert!(backend.raw_get(CONVERSATIONS_TABLE, "current").is_some());
}

#[tokio::test]
async fn saves_survive_a_dropped_connection() {
    let backend = MemoryBackend::new();
    let store = store_on(&backend, &MemorySlot::new());
    let saved = vec![conversation("durable", 10), conversation("also durable", 5)];
    store.save_conversations(saved.clone()).await.expect("save");
    let expected = store.get_conversations().await.expect("read");

    backend.sever_connections();
    store.init().await.expect("re-init");
    assert_eq!(store.get_conversations().await.expect("read after drop"), expected);

    backend.sever_connections();
    store
        .save_conversations(vec![conversation("after drop", 1)])
        .await
        .expect("save reopens transparently");
    assert_eq!(store.get_conversations().await.expect("read").len(), 1);
}

#[tokio::test]
async fn layout_upgraded_elsewhere_is_adopted() {
    let backend = MemoryBackend::new();
    let slot = MemorySlot::new();
    let first_tab = store_on(&backend, &slot);
    let second_tab = store_on(&backend, &slot);
    first_tab.init().await.expect("init first");
    second_tab.init().await.expect("init second");

    backend.upgrade_from_other_context(4, &EXPECTED_TABLES);
    first_tab
        .save_conversations(vec![conversation("shared", 1)])
        .await
        .expect("save after upgrade");

    let seen = second_tab.get_conversations().await.expect("read");
    assert_eq!(seen.len(), 1);
    assert_eq!(second_tab.check_database_health().await.schema_version, Some(4));
}

#[tokio::test]
async fn importing_the_same_export_twice_adds_nothing() {
    let source = MemoryStore::in_memory(test_config());
    source
        .save_conversations(vec![conversation("one", 2), conversation("two", 1)])
        .await
        .expect("save");
    let export = source.export_conversations().await.expect("export");

    let target = MemoryStore::in_memory(test_config());
    let first = target.import_conversations(&export).await.expect("first import");
    assert_eq!(first.imported_conversations, 2);

    let second = target.import_conversations(&export).await.expect("second import");
    assert_eq!(second.imported_conversations, 0);
    assert_eq!(second.skipped_duplicates, 2);

    let records = target.get_conversation_records().await.expect("records");
    let ids = records.iter().map(|c| c.id.clone()).collect::<HashSet<_>>();
    assert_eq!(ids.len(), records.len());
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn export_reset_import_restores_the_active_set() {
    let store = MemoryStore::in_memory(test_config());
    let folder = store.save_folder(Folder::new("work", None)).await.expect("folder");

    let filed = conversation("filed", 30);
    let loose = conversation("loose", 20);
    let mut gone = conversation("gone", 10);
    gone.soft_delete();
    store
        .save_conversations(vec![filed.clone(), loose, gone])
        .await
        .expect("save");
    assert!(
        store
            .move_conversation_to_folder(&filed.id, Some(&folder.id))
            .await
            .expect("move")
    );

    let before = store.get_conversations().await.expect("before");
    assert_eq!(before.len(), 2);
    let export = store.export_conversations().await.expect("export");

    store.force_reset().await.expect("reset");
    assert!(store.get_conversations().await.expect("after reset").is_empty());
    assert!(store.get_folders().await.expect("folders after reset").is_empty());

    let report = store.import_conversations(&export).await.expect("import");
    assert_eq!(report.imported_conversations, 2);
    assert_eq!(report.imported_folders, 1);

    let after = store.get_conversations().await.expect("after");
    assert_eq!(content(&after), content(&before));
    assert_eq!(store.get_folders().await.expect("folders")[0].id, folder.id);
}

#[tokio::test]
async fn folder_cycles_are_rejected_before_writing() {
    let store = MemoryStore::in_memory(test_config());
    let root = store.save_folder(Folder::new("root", None)).await.expect("root");
    let child = store
        .save_folder(Folder::new("child", Some(root.id.clone())))
        .await
        .expect("child");

    let mut looped = root.clone();
    looped.parent_id = Some(child.id.clone());
    let error = store.save_folder(looped).await.expect_err("cycle");
    assert!(matches!(error, StorageError::FolderCycle { .. }));

    let folders = store.get_folders().await.expect("folders");
    let stored_root = folders.iter().find(|folder| folder.id == root.id).expect("root");
    assert_eq!(stored_root.parent_id, None);

    store.delete_folder(&root.id).await.expect("delete");
    let remaining = store.get_folders().await.expect("folders");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].parent_id.as_ref(), Some(&root.id));
}

#[tokio::test]
async fn moving_reports_whether_the_conversation_exists() {
    let store = MemoryStore::in_memory(test_config());
    let folder = store.save_folder(Folder::new("inbox", None)).await.expect("folder");
    let kept = conversation("kept", 1);
    store.save_conversations(vec![kept.clone()]).await.expect("save");

    let absent = Conversation::new("never saved");
    assert!(
        !store
            .move_conversation_to_folder(&absent.id, Some(&folder.id))
            .await
            .expect("move absent")
    );

    let ghost = Folder::new("ghost", None);
    let error = store
        .move_conversation_to_folder(&kept.id, Some(&ghost.id))
        .await
        .expect_err("unknown folder");
    assert!(matches!(error, StorageError::NotFound { .. }));

    assert!(store.move_conversation_to_folder(&kept.id, None).await.expect("unfile"));
    assert_eq!(store.get_conversations().await.expect("read")[0].folder_id, None);
}

#[tokio::test]
async fn concurrent_saves_are_serialized() {
    let store = Arc::new(MemoryStore::in_memory(test_config()));
    store.init().await.expect("init");

    let mut payloads = Vec::new();
    let mut tasks = Vec::new();
    for index in 0..8 {
        let payload = vec![
            conversation(&format!("batch-{index}-a"), 2),
            conversation(&format!("batch-{index}-b"), 1),
        ];
        payloads.push(content(&payload));
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move { store.save_conversations(payload).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("save");
    }

    // Whatever won, the snapshot is one complete batch, never a mix.
    let stored = content(&store.get_conversations().await.expect("read"));
    assert!(payloads.contains(&stored));
    assert!(!store.save_in_flight());
}

#[tokio::test]
async fn try_save_refuses_while_another_writer_holds_the_scope() {
    let store = MemoryStore::in_memory(test_config());
    store.init().await.expect("init");

    let writer = store.locks().acquire(LockScope::Write).await;
    let error = store
        .try_save_conversations(vec![conversation("late", 1)])
        .await
        .expect_err("busy");
    assert!(matches!(error, StorageError::SaveInProgress { .. }));

    drop(writer);
    store
        .try_save_conversations(vec![conversation("late", 1)])
        .await
        .expect("free again");
}

#[tokio::test]
async fn aborted_write_surfaces_and_keeps_the_previous_snapshot() {
    let backend = MemoryBackend::new();
    let store = store_on(&backend, &MemorySlot::new());
    store
        .save_conversations(vec![conversation("committed", 1)])
        .await
        .expect("save");

    backend.abort_next_writes(1);
    let error = store
        .save_conversations(vec![conversation("aborted", 1)])
        .await
        .expect_err("abort");
    assert!(matches!(error, StorageError::Transaction { .. }));

    let titles = store
        .get_conversations()
        .await
        .expect("read")
        .into_iter()
        .map(|c| c.title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["committed".to_string()]);
}

#[tokio::test]
async fn recovery_gives_up_after_the_persisted_bound() {
    let backend = MemoryBackend::new();
    let slot = MemorySlot::new();
    let store = store_on(&backend, &slot);
    let saved = vec![conversation("precious", 1)];
    store.save_conversations(saved.clone()).await.expect("save");

    backend.set_upgrades_blocked(true);
    backend.drop_table(CONVERSATIONS_TABLE);

    // Reads stay available from the fallback slot while recovery keeps failing.
    for _ in 0..3 {
        let loaded = store.get_conversations().await.expect("reads never throw");
        assert_eq!(content(&loaded), content(&saved));
    }

    let health = store.check_database_health().await;
    assert_eq!(health.status, HealthStatus::Unavailable);
    assert_eq!(health.recovery_attempts, 2);

    // A fresh context sharing the slot sees the same exhausted counter.
    let other_tab = store_on(&backend, &slot);
    assert_eq!(other_tab.check_database_health().await.recovery_attempts, 2);

    backend.set_upgrades_blocked(false);
    store.repair_database().await.expect("manual repair");
    let loaded = store.get_conversations().await.expect("read");
    assert_eq!(content(&loaded), content(&saved));

    let health = store.check_database_health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.recovery_attempts, 0);
}

#[tokio::test]
async fn reads_fail_only_before_the_first_successful_init() {
    let backend = MemoryBackend::new();
    backend.set_upgrades_blocked(true);
    let store = store_on(&backend, &MemorySlot::new());

    let error = store.get_conversations().await.expect_err("never initialized");
    assert!(matches!(error, StorageError::UpgradeBlocked { .. }));

    backend.set_upgrades_blocked(false);
    assert!(store.get_conversations().await.expect("initialized now").is_empty());
}

#[tokio::test]
async fn whitespace_only_content_is_still_content() {
    let store = MemoryStore::in_memory(test_config());
    let mut spaced = Conversation::new("spaced");
    spaced.push_message(Message::new(MessageRole::Human, " "));
    store.save_conversations(vec![spaced.clone()]).await.expect("save");

    let loaded = store.get_conversations().await.expect("read");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].messages[0].content, " ");
}

#[tokio::test]
async fn import_queued_behind_a_move_keeps_the_move() {
    let store = Arc::new(MemoryStore::in_memory(test_config()));
    let folder = store.save_folder(Folder::new("filed", None)).await.expect("folder");
    let kept = conversation("kept", 2);
    store.save_conversations(vec![kept.clone()]).await.expect("save");
    let incoming = serde_json::to_string(&vec![conversation("incoming", 1)]).expect("encode");

    let writer = store.locks().acquire(LockScope::Write).await;
    let moving = {
        let store = Arc::clone(&store);
        let (conversation_id, folder_id) = (kept.id.clone(), folder.id.clone());
        tokio::spawn(async move { store.move_conversation_to_folder(&conversation_id, Some(&folder_id)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let importing = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.import_conversations(&incoming).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(writer);

    assert!(moving.await.expect("join").expect("move"));
    let report = importing.await.expect("join").expect("import");
    assert_eq!(report.imported_conversations, 1);

    let loaded = store.get_conversations().await.expect("read");
    assert_eq!(loaded.len(), 2);
    let moved = loaded.iter().find(|c| c.id == kept.id).expect("kept");
    assert_eq!(moved.folder_id.as_ref(), Some(&folder.id));
}

#[tokio::test]
async fn queued_restore_never_overwrites_a_newer_save() {
    let slot = MemorySlot::new();
    let seeding = store_on(&MemoryBackend::new(), &slot);
    seeding
        .save_conversations(vec![conversation("old-backup", 1)])
        .await
        .expect("seed backup");

    let store = Arc::new(store_on(&MemoryBackend::new(), &slot));
    store.init().await.expect("init");

    let writer = store.locks().acquire(LockScope::Write).await;
    let saving = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.save_conversations(vec![conversation("new-save", 2)]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let reading = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.get_conversations().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(writer);

    saving.await.expect("join").expect("save");
    let titles = |conversations: Vec<Conversation>| {
        conversations.into_iter().map(|c| c.title).collect::<Vec<_>>()
    };
    let read = reading.await.expect("join").expect("read");
    assert_eq!(titles(read), vec!["new-save".to_string()]);
    let reread = store.get_conversations().await.expect("read again");
    assert_eq!(titles(reread), vec!["new-save".to_string()]);
}
