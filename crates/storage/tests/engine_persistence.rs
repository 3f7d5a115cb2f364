use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use murmur_storage::{
    ApplicationState, Attachment, Channel, Conversation, EngineConfig, Message, MessageRole,
    PersistEngine, Persona, PluginDataStore, PluginDataValue, PluginRecord, PluginStore,
    STATE_KEY, ShadowConfig, SqliteEngine, StateStore,
};

fn message(id: &str, content: &str, created_at: i64) -> Message {
    Message {
        id: id.to_string(),
        role: MessageRole::Assistant,
        content: content.to_string(),
        reasoning: None,
        attachments: Vec::new(),
        tool_calls: Vec::new(),
        created_at,
        updated_at: created_at,
        parent_id: None,
        status: Some("done".to_string()),
        finish_reason: None,
        metadata: Value::Null,
    }
}

fn conversation(id: &str, updated_at: i64, messages: Vec<Message>) -> Conversation {
    Conversation {
        id: id.to_string(),
        title: format!("conversation {id}"),
        created_at: 1_000,
        updated_at,
        persona_id: Some("persona-1".to_string()),
        selected_channel_id: Some("channel-1".to_string()),
        selected_model: Some("sonnet".to_string()),
        stream_override: Some(true),
        reasoning_override: None,
        active_branches: [("m1".to_string(), "m2".to_string())].into(),
        metadata: json!({"provider": {"deep": {"nested": {"payload": [1, 2, 3]}}}}),
        messages,
    }
}

fn fixture_state() -> ApplicationState {
    ApplicationState {
        personas: vec![Persona {
            id: "persona-1".to_string(),
            name: "Archivist".to_string(),
            system_prompt: Some("keep receipts".to_string()),
            metadata: Value::Null,
        }],
        active_persona_id: Some("persona-1".to_string()),
        conversations: vec![
            conversation(
                "conv-a",
                5_000,
                vec![message("a1", "hello", 100), message("a2", "world", 200)],
            ),
            conversation(
                "conv-b",
                6_000,
                vec![
                    message("b1", "one", 100),
                    message("b2", "two", 200),
                    message("b3", "three", 300),
                ],
            ),
            conversation("conv-c", 7_000, vec![message("c1", "lonely", 100)]),
        ],
        active_conversation_id: Some("conv-b".to_string()),
        persona_last_conversation: [("persona-1".to_string(), "conv-b".to_string())].into(),
        channels: vec![Channel {
            id: "channel-1".to_string(),
            name: "default".to_string(),
            provider: "anthropic".to_string(),
            model: Some("sonnet".to_string()),
            settings: json!({"stream": true}),
        }],
        plugin_states: [("themer".to_string(), json!({"enabled": true}))].into(),
        settings: [("locale".to_string(), json!("en"))].into(),
        logs: Vec::new(),
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

async fn open_engine(dir: &TempDir) -> SqliteEngine {
    init_tracing();
    SqliteEngine::open(&dir.path().join("murmur.db").display().to_string())
        .await
        .expect("sqlite engine should open in a fresh directory")
}

#[tokio::test]
async fn round_trip_preserves_the_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    assert!(engine.load_state().await.unwrap().is_none());

    let state = fixture_state();
    engine.save_state(&state, false).await.unwrap();
    assert_eq!(engine.load_state().await.unwrap(), Some(state.clone()));

    // A separate engine instance over the same file sees identical data.
    let reopened = open_engine(&dir).await;
    assert_eq!(reopened.load_state().await.unwrap(), Some(state));
}

#[tokio::test]
async fn saving_twice_without_mutation_writes_zero_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let state = fixture_state();
    let first = engine.save_state(&state, false).await.unwrap();
    assert_eq!(first.conversations_written, 3);
    assert_eq!(first.messages_written, 6);

    let second = engine.save_state(&state, false).await.unwrap();
    assert!(second.is_noop(), "unchanged save must cost zero row writes");
    assert_eq!(engine.load_state().await.unwrap(), Some(state));
}

#[tokio::test]
async fn mutating_one_message_writes_exactly_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let mut state = fixture_state();
    engine.save_state(&state, false).await.unwrap();

    // Streaming append to conv-b's last message, without touching updated_at.
    state.conversations[1].messages[2].content.push_str(" +token");
    let report = engine.save_state(&state, false).await.unwrap();
    assert_eq!(report.messages_written, 1);
    assert_eq!(report.conversations_written, 0);
    assert_eq!(report.messages_deleted, 0);

    // Bumping conv-b's updated_at additionally rewrites that one row.
    state.conversations[1].updated_at += 1;
    let report = engine.save_state(&state, false).await.unwrap();
    assert_eq!(report.conversations_written, 1);
    assert_eq!(report.messages_written, 0);

    assert_eq!(engine.load_state().await.unwrap(), Some(state));
}

#[tokio::test]
async fn removing_a_conversation_deletes_its_rows_and_nothing_else() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let mut state = fixture_state();
    engine.save_state(&state, false).await.unwrap();

    state.conversations.remove(1);
    let report = engine.save_state(&state, false).await.unwrap();
    assert_eq!(report.conversations_deleted, 1);
    assert_eq!(report.messages_written, 0);
    // conv-c moved from position 2 to 1, so its order column is rewritten.
    assert_eq!(report.conversations_written, 1);

    let loaded = engine.load_state().await.unwrap().unwrap();
    assert_eq!(
        loaded
            .conversations
            .iter()
            .map(|conversation| conversation.id.as_str())
            .collect::<Vec<_>>(),
        ["conv-a", "conv-c"]
    );

    let orphaned =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
            .bind("conv-b")
            .fetch_one(engine.pool())
            .await
            .unwrap();
    assert_eq!(orphaned, 0);
}

#[tokio::test]
async fn legacy_snapshot_migrates_into_normalized_tables() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let state = fixture_state();
    let legacy_blob = serde_json::to_string(&state).unwrap();
    sqlx::query("INSERT INTO legacy_state (key, value) VALUES (?, ?)")
        .bind(STATE_KEY)
        .bind(&legacy_blob)
        .execute(engine.pool())
        .await
        .unwrap();

    // Load reconstructs the aggregate and seeds the sharded tables.
    assert_eq!(engine.load_state().await.unwrap(), Some(state.clone()));

    let legacy_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM legacy_state")
        .fetch_one(engine.pool())
        .await
        .unwrap();
    assert_eq!(legacy_rows, 0, "migration reclaims the legacy blob");

    // With the legacy store gone, the normalized tables alone satisfy load.
    let reopened = open_engine(&dir).await;
    assert_eq!(reopened.load_state().await.unwrap(), Some(state));
}

#[tokio::test]
async fn empty_titles_round_trip_verbatim_through_the_normalized_tables() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let mut state = fixture_state();
    state.conversations[0].title = String::new();
    engine.save_state(&state, false).await.unwrap();
    assert_eq!(engine.load_state().await.unwrap(), Some(state));
}

#[tokio::test]
async fn legacy_import_defaults_untitled_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let mut state = fixture_state();
    state.conversations[0].title = String::new();
    sqlx::query("INSERT INTO legacy_state (key, value) VALUES (?, ?)")
        .bind(STATE_KEY)
        .bind(serde_json::to_string(&state).unwrap())
        .execute(engine.pool())
        .await
        .unwrap();

    let migrated = engine.load_state().await.unwrap().unwrap();
    assert_eq!(migrated.conversations[0].title, "New Conversation");
    // The defaulted title is what lands in the normalized tables.
    let reopened = open_engine(&dir).await;
    let reloaded = reopened.load_state().await.unwrap().unwrap();
    assert_eq!(reloaded.conversations[0].title, "New Conversation");
}

#[tokio::test]
async fn cleared_store_keeps_its_marker_and_skips_migration() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine.save_state(&fixture_state(), false).await.unwrap();
    engine.clear().await.unwrap();

    // A stale legacy blob appearing after an intentional clear must not be
    // resurrected: the marker says "legitimately empty".
    sqlx::query("INSERT INTO legacy_state (key, value) VALUES (?, ?)")
        .bind(STATE_KEY)
        .bind(serde_json::to_string(&fixture_state()).unwrap())
        .execute(engine.pool())
        .await
        .unwrap();

    let loaded = engine.load_state().await.unwrap().unwrap();
    assert!(loaded.conversations.is_empty());
    assert!(loaded.personas.is_empty());

    // After a clear, the next save rewrites everything from scratch.
    let report = engine.save_state(&fixture_state(), false).await.unwrap();
    assert_eq!(report.conversations_written, 3);
}

#[tokio::test]
async fn rows_without_explicit_order_fall_back_to_recency() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine.save_state(&fixture_state(), false).await.unwrap();
    sqlx::query("UPDATE conversations SET sort_order = NULL")
        .execute(engine.pool())
        .await
        .unwrap();

    let reopened = open_engine(&dir).await;
    let loaded = reopened.load_state().await.unwrap().unwrap();
    assert_eq!(
        loaded
            .conversations
            .iter()
            .map(|conversation| conversation.id.as_str())
            .collect::<Vec<_>>(),
        ["conv-c", "conv-b", "conv-a"],
        "updated_at descending when no order column survives"
    );
}

#[tokio::test]
async fn plugin_registry_and_data_are_isolated_keyspaces() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine
        .save_plugin(&PluginRecord {
            id: "imaging".to_string(),
            manifest: json!({"name": "Imaging", "version": "1.2.0"}),
            updated_at: 10,
        })
        .await
        .unwrap();
    assert_eq!(engine.get_all_plugins().await.unwrap().len(), 1);

    let blob = PluginDataValue::Binary {
        mime_type: "image/png".to_string(),
        bytes: vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A],
    };
    engine.set_plugin_data("p1", "thumb", &blob).await.unwrap();
    engine
        .set_plugin_data("p1", "config", &PluginDataValue::Json { value: json!({"dpi": 300}) })
        .await
        .unwrap();
    engine
        .set_plugin_data("p2", "thumb", &PluginDataValue::Text { value: "other".to_string() })
        .await
        .unwrap();

    // The sqlite path stores binary natively and returns it unchanged.
    assert_eq!(engine.get_plugin_data("p1", "thumb").await.unwrap(), Some(blob));
    assert_eq!(
        engine.get_plugin_data_keys("p1").await.unwrap(),
        ["config", "thumb"]
    );

    engine.clear_plugin_data("p1").await.unwrap();
    assert!(engine.get_all_plugin_data("p1").await.unwrap().is_empty());
    assert_eq!(engine.get_all_plugin_data("p2").await.unwrap().len(), 1);

    // Plugin churn never touches the main aggregate.
    assert!(engine.load_state().await.unwrap().is_none());

    engine.delete_plugin("imaging").await.unwrap();
    assert!(engine.get_plugin("imaging").await.unwrap().is_none());
}

#[tokio::test]
async fn attachments_and_tool_calls_survive_the_message_payload() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let mut state = fixture_state();
    state.conversations[0].messages[0].attachments.push(Attachment {
        name: "report.pdf".to_string(),
        mime_type: "application/pdf".to_string(),
        size_bytes: 2_048,
        source: Some("upload".to_string()),
        data: Some("data:application/pdf;base64,JVBERg==".to_string()),
    });
    state.conversations[0].messages[0]
        .tool_calls
        .push(murmur_storage::ToolCallRecord {
            id: "t1".to_string(),
            name: "search".to_string(),
            status: Some("done".to_string()),
            arguments: json!({"q": "receipts"}),
            result: json!({"hits": 2}),
            error: None,
            started_at: Some(1),
            finished_at: Some(2),
        });

    engine.save_state(&state, false).await.unwrap();
    assert_eq!(engine.load_state().await.unwrap(), Some(state));
}

fn fast_engine_config(dir: &TempDir) -> EngineConfig {
    init_tracing();
    let mut config = EngineConfig::at_data_dir(dir.path());
    config.shadow = ShadowConfig {
        schedule_delay: Duration::from_millis(20),
        min_write_interval: Duration::from_millis(50),
        ..ShadowConfig::default()
    };
    config
}

#[tokio::test]
async fn facade_saves_feed_the_shadow_record_and_clear_erases_it() {
    let dir = tempfile::tempdir().unwrap();
    let engine = PersistEngine::open(fast_engine_config(&dir)).await;
    assert!(!engine.is_degraded());

    let state = fixture_state();
    engine.save(&state).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let shadow = engine.read_shadow().expect("shadow record should exist");
    assert_eq!(shadow.active_conversation.unwrap().id, "conv-b");
    assert_eq!(shadow.personas.len(), 1);

    engine.clear().await.unwrap();
    assert!(engine.read_shadow().is_none());
    let cleared = engine.load().await.unwrap().unwrap();
    assert!(cleared.conversations.is_empty());
}

#[tokio::test]
async fn delete_of_the_state_key_is_equivalent_to_clear() {
    let dir = tempfile::tempdir().unwrap();
    let engine = PersistEngine::open(fast_engine_config(&dir)).await;

    engine.save(&fixture_state()).await.unwrap();
    engine.delete(STATE_KEY).await.unwrap();
    let cleared = engine.load().await.unwrap().unwrap();
    assert!(cleared.conversations.is_empty());

    // Unrecognized keys are ignored rather than destructive.
    engine.save(&fixture_state()).await.unwrap();
    engine.delete("somebody-elses-key").await.unwrap();
    assert_eq!(
        engine.load().await.unwrap().unwrap().conversations.len(),
        3
    );
}

#[tokio::test]
async fn unavailable_sqlite_degrades_to_the_fallback_facade() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_engine_config(&dir);
    // A directory where the database file should be makes sqlite unopenable.
    std::fs::create_dir_all(&config.database_path).unwrap();

    let engine = PersistEngine::open(config).await;
    assert!(engine.is_degraded());

    let state = fixture_state();
    engine.save(&state).await.unwrap();
    assert_eq!(engine.load().await.unwrap(), Some(state));

    // Binary plugin data still round-trips as an opaque text encoding.
    let blob = PluginDataValue::Binary {
        mime_type: "image/png".to_string(),
        bytes: vec![1, 2, 3],
    };
    engine.set_plugin_data("p1", "icon", &blob).await.unwrap();
    match engine.get_plugin_data("p1", "icon").await.unwrap().unwrap() {
        PluginDataValue::Text { value } => {
            assert!(value.starts_with("data:image/png;base64,"));
        }
        other => panic!("expected coerced text, got {other:?}"),
    }
}
