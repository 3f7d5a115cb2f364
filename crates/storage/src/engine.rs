use std::collections::BTreeMap;

use tracing::warn;

use super::config::EngineConfig;
use super::error::StorageResult;
use super::fallback::FallbackStore;
use super::shadow::{ShadowSnapshot, ShadowWriter};
use super::sqlite::SqliteEngine;
use super::types::{ApplicationState, PluginDataValue, PluginRecord, SaveReport};
use super::{PluginDataStore, PluginStore, StateStore};

#[derive(Debug)]
enum Backend {
    Sqlite(SqliteEngine),
    Fallback(FallbackStore),
}

/// Top-level persistence engine handed to the application.
///
/// Prefers the normalized sqlite backend; when that cannot be opened at all,
/// every operation transparently routes to the flat-file fallback facade.
/// Every successful state save also feeds the throttled shadow backup
/// writer, and clearing the store cancels pending shadow work first so a
/// stale flush can never resurrect deleted data.
#[derive(Debug)]
pub struct PersistEngine {
    backend: Backend,
    shadow: ShadowWriter,
}

impl PersistEngine {
    pub async fn open(config: EngineConfig) -> Self {
        let shadow = ShadowWriter::new(config.shadow_path.clone(), config.shadow.clone());
        let backend = match SqliteEngine::open(&config.database_path).await {
            Ok(engine) => Backend::Sqlite(engine),
            Err(error) => {
                warn!(%error, "preferred storage engine unavailable; degrading to flat fallback store");
                Backend::Fallback(FallbackStore::new(
                    config.fallback_path.clone(),
                    config.fallback_ceiling_bytes,
                ))
            }
        };
        Self { backend, shadow }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.backend, Backend::Fallback(_))
    }

    /// Persist the given snapshot. Safe to call at arbitrarily high
    /// frequency; cost is proportional to what actually changed.
    pub async fn save(&self, state: &ApplicationState) -> StorageResult<SaveReport> {
        let report = match &self.backend {
            Backend::Sqlite(engine) => engine.save_state(state, false).await?,
            Backend::Fallback(fallback) => fallback.save_state(state, false).await?,
        };
        self.shadow.schedule(state);
        Ok(report)
    }

    /// Reconstruct the aggregate, migrating legacy data as a side effect.
    pub async fn load(&self) -> StorageResult<Option<ApplicationState>> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.load_state().await,
            Backend::Fallback(fallback) => fallback.load_state().await,
        }
    }

    /// Erase all primary, legacy, and shadow data.
    pub async fn clear(&self) -> StorageResult<()> {
        // Cancel in-flight shadow work before touching the primary store.
        self.shadow.clear()?;
        match &self.backend {
            Backend::Sqlite(engine) => engine.clear().await,
            Backend::Fallback(fallback) => fallback.clear().await,
        }
    }

    /// Targeted removal; the one recognized key is the whole-state key.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        if key == super::sqlite::STATE_KEY {
            return self.clear().await;
        }
        match &self.backend {
            Backend::Sqlite(engine) => engine.delete(key).await,
            Backend::Fallback(fallback) => fallback.delete(key).await,
        }
    }

    /// Disaster-recovery record, if a recognizable one exists.
    pub fn read_shadow(&self) -> Option<ShadowSnapshot> {
        self.shadow.read()
    }

    pub async fn save_plugin(&self, plugin: &PluginRecord) -> StorageResult<()> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.save_plugin(plugin).await,
            Backend::Fallback(fallback) => fallback.save_plugin(plugin).await,
        }
    }

    pub async fn get_plugin(&self, plugin_id: &str) -> StorageResult<Option<PluginRecord>> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.get_plugin(plugin_id).await,
            Backend::Fallback(fallback) => fallback.get_plugin(plugin_id).await,
        }
    }

    pub async fn get_all_plugins(&self) -> StorageResult<Vec<PluginRecord>> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.get_all_plugins().await,
            Backend::Fallback(fallback) => fallback.get_all_plugins().await,
        }
    }

    pub async fn delete_plugin(&self, plugin_id: &str) -> StorageResult<()> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.delete_plugin(plugin_id).await,
            Backend::Fallback(fallback) => fallback.delete_plugin(plugin_id).await,
        }
    }

    pub async fn clear_plugins(&self) -> StorageResult<()> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.clear_plugins().await,
            Backend::Fallback(fallback) => fallback.clear_plugins().await,
        }
    }

    pub async fn set_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
        value: &PluginDataValue,
    ) -> StorageResult<()> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.set_plugin_data(plugin_id, key, value).await,
            Backend::Fallback(fallback) => fallback.set_plugin_data(plugin_id, key, value).await,
        }
    }

    pub async fn get_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
    ) -> StorageResult<Option<PluginDataValue>> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.get_plugin_data(plugin_id, key).await,
            Backend::Fallback(fallback) => fallback.get_plugin_data(plugin_id, key).await,
        }
    }

    pub async fn delete_plugin_data(&self, plugin_id: &str, key: &str) -> StorageResult<()> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.delete_plugin_data(plugin_id, key).await,
            Backend::Fallback(fallback) => fallback.delete_plugin_data(plugin_id, key).await,
        }
    }

    pub async fn get_plugin_data_keys(&self, plugin_id: &str) -> StorageResult<Vec<String>> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.get_plugin_data_keys(plugin_id).await,
            Backend::Fallback(fallback) => fallback.get_plugin_data_keys(plugin_id).await,
        }
    }

    pub async fn get_all_plugin_data(
        &self,
        plugin_id: &str,
    ) -> StorageResult<BTreeMap<String, PluginDataValue>> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.get_all_plugin_data(plugin_id).await,
            Backend::Fallback(fallback) => fallback.get_all_plugin_data(plugin_id).await,
        }
    }

    pub async fn clear_plugin_data(&self, plugin_id: &str) -> StorageResult<()> {
        match &self.backend {
            Backend::Sqlite(engine) => engine.clear_plugin_data(plugin_id).await,
            Backend::Fallback(fallback) => fallback.clear_plugin_data(plugin_id).await,
        }
    }
}
