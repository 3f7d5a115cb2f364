use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::warn;

use super::diff::{
    DiffCache, META_APP, META_CHANNELS, META_LOGS, META_PERSONAS, META_PLUGIN_STATES,
    META_SCHEMA_VERSION, META_SETTINGS, MetaWrite, SCHEMA_VERSION, WritePlan,
};
use super::error::{
    CreateSqliteDirectorySnafu, DeserializeSnafu, InvariantViolationSnafu, SerializeSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::time::unix_timestamp_millis;
use super::types::{
    ApplicationState, Conversation, Message, PluginDataValue, PluginRecord, SaveReport,
};
use super::{PluginDataStore, PluginStore, StateStore};

/// The one key recognized by the legacy single-blob keyspace, and by
/// `delete` as "the whole state".
pub const STATE_KEY: &str = "app_state";

const PLUGIN_DATA_KIND_JSON: &str = "json";
const PLUGIN_DATA_KIND_TEXT: &str = "text";
const PLUGIN_DATA_KIND_BINARY: &str = "binary";

/// Normalized sqlite store: Meta/Conversations/Messages sharding with
/// fingerprint-gated diff writes, plus the plugin keyspaces and the legacy
/// blob table it migrates away from.
#[derive(Debug)]
pub struct SqliteEngine {
    pool: SqlitePool,
    /// Never held across an await; a plan is computed under the lock, the
    /// transaction runs without it, and only a confirmed commit re-locks to
    /// fold the plan back in.
    cache: Mutex<DiffCache>,
}

impl SqliteEngine {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        Ok(Self {
            pool,
            cache: Mutex::new(DiffCache::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn locked_cache(&self) -> std::sync::MutexGuard<'_, DiffCache> {
        self.cache.lock().expect("diff cache mutex poisoned")
    }

    async fn execute_plan(&self, plan: &WritePlan) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "save-begin",
        })?;

        for meta_write in &plan.meta_writes {
            sqlx::query(
                "INSERT INTO meta (name, value) VALUES (?, ?) \
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            )
            .bind(meta_write.name)
            .bind(&meta_write.serialized)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "save-upsert-meta",
            })?;
        }

        for conversation_write in &plan.conversation_writes {
            sqlx::query(
                "INSERT INTO conversations (id, sort_order, created_at, updated_at, payload) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET sort_order = excluded.sort_order, \
                 created_at = excluded.created_at, updated_at = excluded.updated_at, \
                 payload = excluded.payload",
            )
            .bind(&conversation_write.id)
            .bind(conversation_write.sort_order)
            .bind(conversation_write.created_at)
            .bind(conversation_write.updated_at)
            .bind(&conversation_write.payload)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "save-upsert-conversation",
            })?;
        }

        for message_write in &plan.message_writes {
            sqlx::query(
                "INSERT INTO messages (conversation_id, id, created_at, updated_at, payload) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(conversation_id, id) DO UPDATE SET \
                 created_at = excluded.created_at, updated_at = excluded.updated_at, \
                 payload = excluded.payload",
            )
            .bind(&message_write.conversation_id)
            .bind(&message_write.id)
            .bind(message_write.created_at)
            .bind(message_write.updated_at)
            .bind(&message_write.payload)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "save-upsert-message",
            })?;
        }

        for (conversation_id, message_id) in &plan.message_deletes {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ? AND id = ?")
                .bind(conversation_id)
                .bind(message_id)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "save-delete-message",
                })?;
        }

        // A vanished conversation takes all of its message rows with it in
        // the same transaction.
        for conversation_id in &plan.conversation_deletes {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "save-cascade-messages",
                })?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "save-delete-conversation",
                })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "save-commit",
        })
    }

    async fn read_legacy_snapshot(&self) -> StorageResult<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM legacy_state WHERE key = ?")
            .bind(STATE_KEY)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "legacy-read-snapshot",
            })
    }

    /// Seed the normalized tables from a reconstructed legacy aggregate and
    /// reclaim the legacy row. Both steps are non-fatal: on failure the
    /// store simply stays un-migrated until the next successful save.
    async fn migrate_legacy(&self, state: &ApplicationState) {
        match self.save_state(state, true).await {
            Ok(report) => {
                tracing::info!(
                    conversations = report.conversations_written,
                    messages = report.messages_written,
                    "migrated legacy snapshot into normalized tables"
                );
                let reclaimed = sqlx::query("DELETE FROM legacy_state WHERE key = ?")
                    .bind(STATE_KEY)
                    .execute(&self.pool)
                    .await;
                if let Err(error) = reclaimed {
                    warn!(%error, "failed to reclaim legacy snapshot after migration");
                }
            }
            Err(error) => {
                warn!(%error, "legacy migration save failed; will retry on a later load");
                self.locked_cache().clear();
            }
        }
    }

    async fn load_normalized(&self) -> StorageResult<LoadedTables> {
        let meta_rows = sqlx::query_as::<_, MetaRow>("SELECT name, value FROM meta")
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "load-meta-query",
            })?;
        let conversation_rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, sort_order, created_at, updated_at, payload FROM conversations",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "load-conversations-query",
        })?;
        let message_rows = sqlx::query_as::<_, MessageRow>(
            "SELECT conversation_id, created_at, payload FROM messages \
             ORDER BY conversation_id, created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "load-messages-query",
        })?;

        Ok(LoadedTables {
            meta: meta_rows
                .into_iter()
                .map(|row| (row.name, row.value))
                .collect(),
            conversations: conversation_rows,
            messages: message_rows,
        })
    }
}

impl StateStore for SqliteEngine {
    async fn save_state(
        &self,
        state: &ApplicationState,
        force_full: bool,
    ) -> StorageResult<SaveReport> {
        let plan = self.locked_cache().plan(state, force_full)?;
        if plan.is_empty() {
            return Ok(SaveReport::default());
        }

        self.execute_plan(&plan).await?;
        // Only a confirmed commit may update the diff cache; a failed
        // transaction above has already returned with the cache untouched.
        self.locked_cache().commit_plan(&plan);
        Ok(plan.report())
    }

    async fn load_state(&self) -> StorageResult<Option<ApplicationState>> {
        // No incremental trust survives a reload.
        self.locked_cache().clear();

        let tables = self.load_normalized().await?;
        let has_marker = tables.meta.contains_key(META_SCHEMA_VERSION);

        if !has_marker && tables.conversations.is_empty() {
            if let Some(raw_snapshot) = self.read_legacy_snapshot().await? {
                match serde_json::from_str::<ApplicationState>(&raw_snapshot) {
                    Ok(mut state) => {
                        // Legacy snapshots could carry untitled conversations;
                        // titles from the normalized tables are kept verbatim.
                        for conversation in &mut state.conversations {
                            if conversation.title.trim().is_empty() {
                                conversation.title =
                                    super::types::DEFAULT_CONVERSATION_TITLE.to_string();
                            }
                        }
                        self.migrate_legacy(&state).await;
                        return Ok(Some(state));
                    }
                    Err(error) => {
                        warn!(%error, "legacy snapshot is unreadable; ignoring it");
                    }
                }
            }
            if tables.meta.is_empty() && tables.messages.is_empty() {
                // Truly empty store, as opposed to an intentionally cleared
                // one (which keeps its schema marker).
                return Ok(None);
            }
        }

        let state = assemble_state(tables)?;
        self.locked_cache().rebuild(&state);
        Ok(Some(state))
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "clear-begin",
        })?;
        for (statement, stage) in [
            ("DELETE FROM messages", "clear-messages"),
            ("DELETE FROM conversations", "clear-conversations"),
            ("DELETE FROM meta", "clear-meta"),
            ("DELETE FROM legacy_state", "clear-legacy"),
        ] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu { stage })?;
        }

        // Keep the marker so a later load sees "legitimately empty" instead
        // of attempting to resurrect anything.
        let marker = MetaWrite {
            name: META_SCHEMA_VERSION,
            serialized: serde_json::json!(SCHEMA_VERSION).to_string(),
        };
        sqlx::query("INSERT INTO meta (name, value) VALUES (?, ?)")
            .bind(marker.name)
            .bind(&marker.serialized)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "clear-reinsert-marker",
            })?;
        tx.commit().await.context(SqliteQuerySnafu {
            stage: "clear-commit",
        })?;

        let mut cache = self.locked_cache();
        cache.clear();
        cache.commit_plan(&WritePlan {
            meta_writes: vec![marker],
            ..WritePlan::default()
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if key == STATE_KEY {
            return self.clear().await;
        }
        warn!(key, "ignoring delete for unrecognized storage key");
        Ok(())
    }
}

impl PluginStore for SqliteEngine {
    async fn save_plugin(&self, plugin: &PluginRecord) -> StorageResult<()> {
        let manifest = serde_json::to_string(&plugin.manifest).context(SerializeSnafu {
            stage: "plugin-save-manifest",
            what: "plugin manifest",
        })?;
        sqlx::query(
            "INSERT INTO plugins (id, manifest, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET manifest = excluded.manifest, \
             updated_at = excluded.updated_at",
        )
        .bind(&plugin.id)
        .bind(&manifest)
        .bind(plugin.updated_at)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-save-upsert",
        })?;
        Ok(())
    }

    async fn get_plugin(&self, plugin_id: &str) -> StorageResult<Option<PluginRecord>> {
        let row = sqlx::query_as::<_, PluginRow>(
            "SELECT id, manifest, updated_at FROM plugins WHERE id = ?",
        )
        .bind(plugin_id)
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-get-query",
        })?;
        row.map(plugin_row_to_record).transpose()
    }

    async fn get_all_plugins(&self) -> StorageResult<Vec<PluginRecord>> {
        let rows = sqlx::query_as::<_, PluginRow>(
            "SELECT id, manifest, updated_at FROM plugins ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-list-query",
        })?;
        rows.into_iter().map(plugin_row_to_record).collect()
    }

    async fn delete_plugin(&self, plugin_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM plugins WHERE id = ?")
            .bind(plugin_id)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "plugin-delete-apply",
            })?;
        Ok(())
    }

    async fn clear_plugins(&self) -> StorageResult<()> {
        sqlx::query("DELETE FROM plugins")
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "plugin-clear-apply",
            })?;
        Ok(())
    }
}

impl PluginDataStore for SqliteEngine {
    async fn set_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
        value: &PluginDataValue,
    ) -> StorageResult<()> {
        let (kind, bytes, mime_type) = encode_plugin_data(value)?;
        sqlx::query(
            "INSERT INTO plugin_data (plugin_id, key, kind, value, mime_type, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(plugin_id, key) DO UPDATE SET kind = excluded.kind, \
             value = excluded.value, mime_type = excluded.mime_type, \
             updated_at = excluded.updated_at",
        )
        .bind(plugin_id)
        .bind(key)
        .bind(kind)
        .bind(bytes)
        .bind(mime_type)
        .bind(unix_timestamp_millis())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-data-set-upsert",
        })?;
        Ok(())
    }

    async fn get_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
    ) -> StorageResult<Option<PluginDataValue>> {
        let row = sqlx::query_as::<_, PluginDataRow>(
            "SELECT key, kind, value, mime_type FROM plugin_data \
             WHERE plugin_id = ? AND key = ?",
        )
        .bind(plugin_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-data-get-query",
        })?;
        row.map(|row| decode_plugin_data(&row.kind, row.value, row.mime_type))
            .transpose()
    }

    async fn delete_plugin_data(&self, plugin_id: &str, key: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM plugin_data WHERE plugin_id = ? AND key = ?")
            .bind(plugin_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "plugin-data-delete-apply",
            })?;
        Ok(())
    }

    async fn get_plugin_data_keys(&self, plugin_id: &str) -> StorageResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT key FROM plugin_data WHERE plugin_id = ? ORDER BY key ASC",
        )
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-data-keys-query",
        })
    }

    async fn get_all_plugin_data(
        &self,
        plugin_id: &str,
    ) -> StorageResult<BTreeMap<String, PluginDataValue>> {
        let rows = sqlx::query_as::<_, PluginDataRow>(
            "SELECT key, kind, value, mime_type FROM plugin_data \
             WHERE plugin_id = ? ORDER BY key ASC",
        )
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "plugin-data-list-query",
        })?;

        rows.into_iter()
            .map(|row| {
                let decoded = decode_plugin_data(&row.kind, row.value, row.mime_type)?;
                Ok((row.key, decoded))
            })
            .collect()
    }

    async fn clear_plugin_data(&self, plugin_id: &str) -> StorageResult<()> {
        // Delete-each rather than a range delete, matching engines that
        // offer no native range-delete guarantee.
        let keys = self.get_plugin_data_keys(plugin_id).await?;
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "plugin-data-clear-begin",
        })?;
        for key in keys {
            sqlx::query("DELETE FROM plugin_data WHERE plugin_id = ? AND key = ?")
                .bind(plugin_id)
                .bind(&key)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "plugin-data-clear-delete",
                })?;
        }
        tx.commit().await.context(SqliteQuerySnafu {
            stage: "plugin-data-clear-commit",
        })
    }
}

struct LoadedTables {
    meta: HashMap<String, String>,
    conversations: Vec<ConversationRow>,
    messages: Vec<MessageRow>,
}

#[derive(Debug, FromRow)]
struct MetaRow {
    name: String,
    value: String,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    sort_order: Option<i64>,
    created_at: i64,
    updated_at: i64,
    payload: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    conversation_id: String,
    created_at: i64,
    payload: String,
}

#[derive(Debug, FromRow)]
struct PluginRow {
    id: String,
    manifest: String,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct PluginDataRow {
    key: String,
    kind: String,
    value: Vec<u8>,
    mime_type: Option<String>,
}

fn assemble_state(tables: LoadedTables) -> StorageResult<ApplicationState> {
    let mut messages_by_conversation: HashMap<String, Vec<(i64, Message)>> = HashMap::new();
    for row in tables.messages {
        let message: Message = serde_json::from_str(&row.payload).context(DeserializeSnafu {
            stage: "load-message-payload",
            what: "message",
        })?;
        messages_by_conversation
            .entry(row.conversation_id)
            .or_default()
            .push((row.created_at, message));
    }

    let mut conversation_rows = tables.conversations;
    // Explicit order wins; rows without one fall back to recency.
    conversation_rows.sort_by(|left, right| {
        let left_key = (left.sort_order.unwrap_or(i64::MAX), Reverse(left.updated_at));
        let right_key = (right.sort_order.unwrap_or(i64::MAX), Reverse(right.updated_at));
        left_key.cmp(&right_key).then_with(|| left.id.cmp(&right.id))
    });

    let mut conversations = Vec::with_capacity(conversation_rows.len());
    for row in conversation_rows {
        let mut conversation: Conversation =
            serde_json::from_str(&row.payload).context(DeserializeSnafu {
                stage: "load-conversation-payload",
                what: "conversation",
            })?;
        if let Some(mut grouped) = messages_by_conversation.remove(&row.id) {
            grouped.sort_by(|left, right| {
                left.0.cmp(&right.0).then_with(|| left.1.id.cmp(&right.1.id))
            });
            conversation.messages = grouped.into_iter().map(|(_, message)| message).collect();
        }
        conversations.push(conversation);
    }

    let mut state = ApplicationState {
        conversations,
        ..ApplicationState::default()
    };
    if let Some(app) = parse_meta::<serde_json::Value>(&tables.meta, META_APP) {
        state.active_persona_id = app
            .get("active_persona_id")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        state.active_conversation_id = app
            .get("active_conversation_id")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        if let Some(map) = app.get("persona_last_conversation") {
            state.persona_last_conversation =
                serde_json::from_value(map.clone()).unwrap_or_default();
        }
    }
    state.personas = parse_meta(&tables.meta, META_PERSONAS).unwrap_or_default();
    state.channels = parse_meta(&tables.meta, META_CHANNELS).unwrap_or_default();
    state.plugin_states = parse_meta(&tables.meta, META_PLUGIN_STATES).unwrap_or_default();
    state.settings = parse_meta(&tables.meta, META_SETTINGS).unwrap_or_default();
    state.logs = parse_meta(&tables.meta, META_LOGS).unwrap_or_default();
    Ok(state)
}

// A corrupt meta row degrades to the field's default instead of failing the
// whole load; conversations and messages stay strict.
fn parse_meta<T: serde::de::DeserializeOwned>(
    meta: &HashMap<String, String>,
    name: &'static str,
) -> Option<T> {
    let raw = meta.get(name)?;
    match serde_json::from_str(raw) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn!(meta = name, %error, "ignoring unreadable meta row");
            None
        }
    }
}

fn plugin_row_to_record(row: PluginRow) -> StorageResult<PluginRecord> {
    Ok(PluginRecord {
        id: row.id,
        manifest: serde_json::from_str(&row.manifest).context(DeserializeSnafu {
            stage: "plugin-row-manifest",
            what: "plugin manifest",
        })?,
        updated_at: row.updated_at,
    })
}

fn encode_plugin_data(
    value: &PluginDataValue,
) -> StorageResult<(&'static str, Vec<u8>, Option<String>)> {
    Ok(match value {
        PluginDataValue::Json { value } => {
            let serialized = serde_json::to_vec(value).context(SerializeSnafu {
                stage: "plugin-data-encode-json",
                what: "plugin data",
            })?;
            (PLUGIN_DATA_KIND_JSON, serialized, None)
        }
        PluginDataValue::Text { value } => {
            (PLUGIN_DATA_KIND_TEXT, value.as_bytes().to_vec(), None)
        }
        PluginDataValue::Binary { mime_type, bytes } => (
            PLUGIN_DATA_KIND_BINARY,
            bytes.clone(),
            Some(mime_type.clone()),
        ),
    })
}

fn decode_plugin_data(
    kind: &str,
    bytes: Vec<u8>,
    mime_type: Option<String>,
) -> StorageResult<PluginDataValue> {
    match kind {
        PLUGIN_DATA_KIND_JSON => Ok(PluginDataValue::Json {
            value: serde_json::from_slice(&bytes).context(DeserializeSnafu {
                stage: "plugin-data-decode-json",
                what: "plugin data",
            })?,
        }),
        PLUGIN_DATA_KIND_TEXT => Ok(PluginDataValue::Text {
            value: String::from_utf8_lossy(&bytes).into_owned(),
        }),
        PLUGIN_DATA_KIND_BINARY => Ok(PluginDataValue::Binary {
            mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            bytes,
        }),
        other => InvariantViolationSnafu {
            stage: "plugin-data-decode-kind",
            details: format!("unknown plugin data kind '{other}'"),
        }
        .fail(),
    }
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
