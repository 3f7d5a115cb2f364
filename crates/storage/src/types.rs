use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default title given to untitled conversations reconstructed from a
/// legacy snapshot. Titles in the normalized tables round-trip verbatim.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Log entries kept in the bounded application log ring.
pub const LOG_RETENTION: usize = 200;

/// Storage-local message role, intentionally decoupled from UI-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// The root aggregate handed to `save_state` and rebuilt by `load_state`.
///
/// The engine never retains references into a caller's state: `save_state`
/// borrows it for the duration of the call and the shadow writer clones what
/// it queues.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationState {
    #[serde(default)]
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub active_persona_id: Option<String>,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub active_conversation_id: Option<String>,
    /// Persona id -> last active conversation id.
    #[serde(default)]
    pub persona_last_conversation: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub plugin_states: BTreeMap<String, Value>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    /// Bounded at [`LOG_RETENTION`] entries at write time.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// One conversation. Position within `ApplicationState::conversations` is the
/// explicit ordering; it is persisted as a `sort_order` column and never
/// surfaces as an in-memory field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default)]
    pub selected_channel_id: Option<String>,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub stream_override: Option<bool>,
    #[serde(default)]
    pub reasoning_override: Option<String>,
    /// Message id -> chosen child id, for edit/retry branch trees.
    #[serde(default)]
    pub active_branches: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One message. The composite key (conversation id, message id) is immutable
/// once created; only `updated_at`-bearing fields mutate in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Provider-specific payload of structurally unbounded depth.
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub source: Option<String>,
    /// Possibly-large inline payload (data URI or base64 text).
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
}

/// Registry entry for an installed extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub manifest: Value,
    pub updated_at: i64,
}

/// Per-extension key/value payload, independent of the main aggregate.
///
/// The sqlite backend stores `Binary` natively; the fallback facade transcodes
/// it to a `data:` URI `Text` at the write boundary and hands back whatever
/// representation was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginDataValue {
    Json { value: Value },
    Text { value: String },
    Binary { mime_type: String, bytes: Vec<u8> },
}

/// Row-write counts for one `save_state` call.
///
/// Exists so callers and tests can observe that an unchanged aggregate costs
/// zero conversation/message row writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveReport {
    pub meta_written: usize,
    pub conversations_written: usize,
    pub conversations_deleted: usize,
    pub messages_written: usize,
    pub messages_deleted: usize,
}

impl SaveReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}
