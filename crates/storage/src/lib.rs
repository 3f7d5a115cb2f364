pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod shadow;
pub mod sqlite;
mod time;
pub mod types;

use std::collections::BTreeMap;

pub use config::{EngineConfig, ShadowConfig};
pub use diff::{DiffCache, SCHEMA_VERSION, WritePlan};
pub use engine::PersistEngine;
pub use error::{StorageError, StorageResult};
pub use fallback::FallbackStore;
pub use shadow::{ShadowSnapshot, ShadowWriter};
pub use sqlite::{STATE_KEY, SqliteEngine};
pub use types::{
    ApplicationState, Attachment, Channel, Conversation, DEFAULT_CONVERSATION_TITLE, LogEntry,
    Message, MessageRole, Persona, PluginDataValue, PluginRecord, SaveReport, ToolCallRecord,
};

#[allow(async_fn_in_trait)]
pub trait StateStore {
    /// Persist a full, self-consistent snapshot of the aggregate.
    /// `force_full` bypasses diff checks; normal callers pass `false`.
    async fn save_state(
        &self,
        state: &ApplicationState,
        force_full: bool,
    ) -> StorageResult<SaveReport>;
    /// Reconstruct the aggregate; `None` means a truly empty store.
    async fn load_state(&self) -> StorageResult<Option<ApplicationState>>;
    async fn clear(&self) -> StorageResult<()>;
    /// Targeted removal; the one recognized key is the whole-state key.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

#[allow(async_fn_in_trait)]
pub trait PluginStore {
    async fn save_plugin(&self, plugin: &PluginRecord) -> StorageResult<()>;
    async fn get_plugin(&self, plugin_id: &str) -> StorageResult<Option<PluginRecord>>;
    async fn get_all_plugins(&self) -> StorageResult<Vec<PluginRecord>>;
    async fn delete_plugin(&self, plugin_id: &str) -> StorageResult<()>;
    async fn clear_plugins(&self) -> StorageResult<()>;
}

#[allow(async_fn_in_trait)]
pub trait PluginDataStore {
    async fn set_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
        value: &PluginDataValue,
    ) -> StorageResult<()>;
    async fn get_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
    ) -> StorageResult<Option<PluginDataValue>>;
    async fn delete_plugin_data(&self, plugin_id: &str, key: &str) -> StorageResult<()>;
    async fn get_plugin_data_keys(&self, plugin_id: &str) -> StorageResult<Vec<String>>;
    async fn get_all_plugin_data(
        &self,
        plugin_id: &str,
    ) -> StorageResult<BTreeMap<String, PluginDataValue>>;
    /// Delete-all for one plugin, implemented as delete-each.
    async fn clear_plugin_data(&self, plugin_id: &str) -> StorageResult<()>;
}
