use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use snafu::ResultExt;
use tracing::warn;

use super::config::DEFAULT_FALLBACK_CEILING_BYTES;
use super::error::{
    CreateFallbackDirectorySnafu, DeserializeSnafu, FallbackCapacityExceededSnafu,
    ReadFallbackStoreSnafu, SerializeSnafu, StorageResult, WriteFallbackStoreSnafu,
};
use super::sqlite::STATE_KEY;
use super::types::{ApplicationState, PluginDataValue, PluginRecord, SaveReport};
use super::{PluginDataStore, PluginStore, StateStore};

const PLUGIN_KEY_PREFIX: &str = "plugin:";
const PLUGIN_DATA_KEY_PREFIX: &str = "plugin-data:";

/// Degraded storage path: one synchronous flat key-value file with a hard
/// total-size ceiling, used end-to-end when sqlite cannot be opened.
///
/// No diffing and no sharding: every state save rewrites the whole
/// aggregate under one key. Binary plugin data is transcoded to a text-safe
/// data URI at the write boundary because the flat file cannot carry raw
/// bytes; readers get that stored representation back verbatim.
#[derive(Debug, Clone)]
pub struct FallbackStore {
    path: PathBuf,
    ceiling_bytes: usize,
}

type FlatMap = BTreeMap<String, String>;

impl FallbackStore {
    pub fn new(path: PathBuf, ceiling_bytes: usize) -> Self {
        Self {
            path,
            ceiling_bytes,
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self::new(path, DEFAULT_FALLBACK_CEILING_BYTES)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> StorageResult<FlatMap> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FlatMap::new());
            }
            Err(source) => {
                return Err(source).context(ReadFallbackStoreSnafu {
                    stage: "fallback-read-store",
                    path: self.path.display().to_string(),
                });
            }
        };

        serde_json::from_str(&raw).context(DeserializeSnafu {
            stage: "fallback-parse-store",
            what: "fallback store map",
        })
    }

    // Every write failure propagates: in this degraded mode there is no
    // further fallback tier, and a visible error beats silent data loss.
    fn write_map(&self, map: &FlatMap) -> StorageResult<()> {
        let serialized = serde_json::to_string(map).context(SerializeSnafu {
            stage: "fallback-serialize-store",
            what: "fallback store map",
        })?;
        snafu::ensure!(
            serialized.len() <= self.ceiling_bytes,
            FallbackCapacityExceededSnafu {
                stage: "fallback-write-ceiling",
                attempted_bytes: serialized.len(),
                ceiling_bytes: self.ceiling_bytes,
            }
        );

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateFallbackDirectorySnafu {
                stage: "fallback-create-directory",
                path: parent.display().to_string(),
            })?;
        }
        std::fs::write(&self.path, serialized).context(WriteFallbackStoreSnafu {
            stage: "fallback-write-store",
            path: self.path.display().to_string(),
        })
    }
}

impl StateStore for FallbackStore {
    async fn save_state(
        &self,
        state: &ApplicationState,
        _force_full: bool,
    ) -> StorageResult<SaveReport> {
        let mut map = self.read_map()?;
        let serialized = serde_json::to_string(state).context(SerializeSnafu {
            stage: "fallback-serialize-state",
            what: "application state",
        })?;
        map.insert(STATE_KEY.to_string(), serialized);
        self.write_map(&map)?;
        Ok(SaveReport {
            conversations_written: state.conversations.len(),
            messages_written: state
                .conversations
                .iter()
                .map(|conversation| conversation.messages.len())
                .sum(),
            meta_written: 1,
            ..SaveReport::default()
        })
    }

    async fn load_state(&self) -> StorageResult<Option<ApplicationState>> {
        let map = self.read_map()?;
        let Some(raw) = map.get(STATE_KEY) else {
            return Ok(None);
        };
        let state = serde_json::from_str(raw).context(DeserializeSnafu {
            stage: "fallback-parse-state",
            what: "application state",
        })?;
        Ok(Some(state))
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut map = self.read_map()?;
        if map.remove(STATE_KEY).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if key == STATE_KEY {
            return StateStore::clear(self).await;
        }
        warn!(key, "ignoring delete for unrecognized storage key");
        Ok(())
    }
}

impl PluginStore for FallbackStore {
    async fn save_plugin(&self, plugin: &PluginRecord) -> StorageResult<()> {
        let mut map = self.read_map()?;
        let serialized = serde_json::to_string(plugin).context(SerializeSnafu {
            stage: "fallback-serialize-plugin",
            what: "plugin record",
        })?;
        map.insert(plugin_key(&plugin.id), serialized);
        self.write_map(&map)
    }

    async fn get_plugin(&self, plugin_id: &str) -> StorageResult<Option<PluginRecord>> {
        let map = self.read_map()?;
        map.get(&plugin_key(plugin_id))
            .map(|raw| {
                serde_json::from_str(raw).context(DeserializeSnafu {
                    stage: "fallback-parse-plugin",
                    what: "plugin record",
                })
            })
            .transpose()
    }

    async fn get_all_plugins(&self) -> StorageResult<Vec<PluginRecord>> {
        let map = self.read_map()?;
        map.iter()
            .filter(|(key, _)| key.starts_with(PLUGIN_KEY_PREFIX))
            .map(|(_, raw)| {
                serde_json::from_str(raw).context(DeserializeSnafu {
                    stage: "fallback-parse-plugin-list",
                    what: "plugin record",
                })
            })
            .collect()
    }

    async fn delete_plugin(&self, plugin_id: &str) -> StorageResult<()> {
        let mut map = self.read_map()?;
        if map.remove(&plugin_key(plugin_id)).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    async fn clear_plugins(&self) -> StorageResult<()> {
        let mut map = self.read_map()?;
        map.retain(|key, _| !key.starts_with(PLUGIN_KEY_PREFIX));
        self.write_map(&map)
    }
}

impl PluginDataStore for FallbackStore {
    async fn set_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
        value: &PluginDataValue,
    ) -> StorageResult<()> {
        let storable = match value {
            // The flat store cannot carry raw bytes: coerce to a data URI
            // once, at the write boundary, instead of dropping the payload.
            PluginDataValue::Binary { mime_type, bytes } => PluginDataValue::Text {
                value: format!("data:{mime_type};base64,{}", BASE64.encode(bytes)),
            },
            other => other.clone(),
        };
        let serialized = serde_json::to_string(&storable).context(SerializeSnafu {
            stage: "fallback-serialize-plugin-data",
            what: "plugin data",
        })?;

        let mut map = self.read_map()?;
        map.insert(plugin_data_key(plugin_id, key), serialized);
        self.write_map(&map)
    }

    async fn get_plugin_data(
        &self,
        plugin_id: &str,
        key: &str,
    ) -> StorageResult<Option<PluginDataValue>> {
        let map = self.read_map()?;
        map.get(&plugin_data_key(plugin_id, key))
            .map(|raw| {
                serde_json::from_str(raw).context(DeserializeSnafu {
                    stage: "fallback-parse-plugin-data",
                    what: "plugin data",
                })
            })
            .transpose()
    }

    async fn delete_plugin_data(&self, plugin_id: &str, key: &str) -> StorageResult<()> {
        let mut map = self.read_map()?;
        if map.remove(&plugin_data_key(plugin_id, key)).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    async fn get_plugin_data_keys(&self, plugin_id: &str) -> StorageResult<Vec<String>> {
        let prefix = plugin_data_prefix(plugin_id);
        let map = self.read_map()?;
        Ok(map
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(unescape_component)
            .collect())
    }

    async fn get_all_plugin_data(
        &self,
        plugin_id: &str,
    ) -> StorageResult<BTreeMap<String, PluginDataValue>> {
        let prefix = plugin_data_prefix(plugin_id);
        let map = self.read_map()?;
        map.iter()
            .filter_map(|(key, raw)| {
                key.strip_prefix(&prefix)
                    .map(|suffix| (unescape_component(suffix), raw))
            })
            .map(|(key, raw)| {
                let value = serde_json::from_str(raw).context(DeserializeSnafu {
                    stage: "fallback-parse-plugin-data-list",
                    what: "plugin data",
                })?;
                Ok((key, value))
            })
            .collect()
    }

    async fn clear_plugin_data(&self, plugin_id: &str) -> StorageResult<()> {
        let prefix = plugin_data_prefix(plugin_id);
        let mut map = self.read_map()?;
        map.retain(|key, _| !key.starts_with(&prefix));
        self.write_map(&map)
    }
}

fn plugin_key(plugin_id: &str) -> String {
    format!("{PLUGIN_KEY_PREFIX}{}", escape_component(plugin_id))
}

fn plugin_data_prefix(plugin_id: &str) -> String {
    format!("{PLUGIN_DATA_KEY_PREFIX}{}:", escape_component(plugin_id))
}

fn plugin_data_key(plugin_id: &str, key: &str) -> String {
    format!("{}{}", plugin_data_prefix(plugin_id), escape_component(key))
}

// Composite keys share one flat namespace, so the separator must never
// occur un-escaped inside an id. 'p1:x' and 'p1' + ':x' must not alias.
fn escape_component(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

fn unescape_component(component: &str) -> String {
    component.replace("%3A", ":").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> FallbackStore {
        FallbackStore::at(dir.path().join("fallback.json"))
    }

    #[tokio::test]
    async fn state_round_trips_through_the_flat_file() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = store(&dir);

        assert!(fallback.load_state().await.unwrap().is_none());

        let mut state = ApplicationState::default();
        state.active_persona_id = Some("p1".to_string());
        state.settings.insert("theme".to_string(), json!("dark"));
        fallback.save_state(&state, false).await.unwrap();

        assert_eq!(fallback.load_state().await.unwrap(), Some(state));
        StateStore::clear(&fallback).await.unwrap();
        assert!(fallback.load_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_plugin_data_is_coerced_to_a_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = store(&dir);

        let payload = PluginDataValue::Binary {
            mime_type: "image/png".to_string(),
            bytes: vec![0x89, 0x50, 0x4E, 0x47],
        };
        fallback.set_plugin_data("imaging", "thumb", &payload).await.unwrap();

        let stored = fallback
            .get_plugin_data("imaging", "thumb")
            .await
            .unwrap()
            .expect("stored value must survive");
        match stored {
            PluginDataValue::Text { value } => {
                assert_eq!(value, "data:image/png;base64,iVBORw==");
            }
            other => panic!("expected text-coerced payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plugin_data_keyspaces_do_not_cross_talk() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = store(&dir);

        // 'p1:x' keyed under p1, not under a hostile plugin id 'p1:x'.
        fallback
            .set_plugin_data("p1", "x", &PluginDataValue::Json { value: json!(1) })
            .await
            .unwrap();
        fallback
            .set_plugin_data("p1:x", "y", &PluginDataValue::Json { value: json!(2) })
            .await
            .unwrap();
        fallback
            .set_plugin_data("p2", "x", &PluginDataValue::Json { value: json!(3) })
            .await
            .unwrap();

        let p1 = fallback.get_all_plugin_data("p1").await.unwrap();
        assert_eq!(p1.len(), 1);
        assert_eq!(fallback.get_plugin_data_keys("p1:x").await.unwrap(), ["y"]);

        fallback.clear_plugin_data("p1").await.unwrap();
        assert!(fallback.get_all_plugin_data("p1").await.unwrap().is_empty());
        assert_eq!(fallback.get_all_plugin_data("p2").await.unwrap().len(), 1);
        assert_eq!(fallback.get_all_plugin_data("p1:x").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_writes_fail_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = FallbackStore::new(dir.path().join("fallback.json"), 256);

        let mut state = ApplicationState::default();
        state
            .settings
            .insert("huge".to_string(), json!("x".repeat(4_096)));
        let error = fallback.save_state(&state, false).await.unwrap_err();
        assert!(matches!(
            error,
            crate::error::StorageError::FallbackCapacityExceeded { .. }
        ));
        // Nothing was persisted by the rejected write.
        assert!(fallback.load_state().await.unwrap().is_none());
    }
}
