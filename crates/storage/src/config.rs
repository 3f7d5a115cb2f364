use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fallback flat-file ceiling, mirroring the hard quota of the flat stores
/// this path substitutes for.
pub const DEFAULT_FALLBACK_CEILING_BYTES: usize = 5 * 1024 * 1024;

/// Engine-wide locations and tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sqlite database location; `:memory:` and `sqlite:` URLs pass through.
    pub database_path: String,
    /// Shadow backup record, kept in a separate file from the primary tables.
    pub shadow_path: PathBuf,
    /// Flat key-value file used when sqlite cannot be opened.
    pub fallback_path: PathBuf,
    pub fallback_ceiling_bytes: usize,
    pub shadow: ShadowConfig,
}

impl EngineConfig {
    pub fn at_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            database_path: data_dir.join("murmur.db").display().to_string(),
            shadow_path: data_dir.join("murmur-shadow.json"),
            fallback_path: data_dir.join("murmur-fallback.json"),
            fallback_ceiling_bytes: DEFAULT_FALLBACK_CEILING_BYTES,
            shadow: ShadowConfig::default(),
        }
    }
}

/// Shadow backup throttling and truncation caps.
///
/// The shadow record exists purely for "primary store wiped or corrupted"
/// recovery, so every cap trades completeness for boundedness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Deferred-flush delay after a schedule request.
    #[serde(with = "duration_millis")]
    pub schedule_delay: Duration,
    /// Minimum interval between two flushes, enforced at flush time.
    #[serde(with = "duration_millis")]
    pub min_write_interval: Duration,
    /// Message tail length kept for the active conversation.
    pub message_tail: usize,
    /// Per-message character cap on content and reasoning text.
    pub text_cap: usize,
    /// Per-message attachment cap; attachments are stripped to metadata.
    pub attachment_cap: usize,
    /// Per-message tool-call cap; tool calls are summarized.
    pub tool_call_cap: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            schedule_delay: Duration::from_secs(3),
            min_write_interval: Duration::from_secs(60),
            message_tail: 80,
            text_cap: 12_000,
            attachment_cap: 12,
            tool_call_cap: 10,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
