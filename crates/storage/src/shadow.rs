use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tracing::{debug, warn};

use super::config::ShadowConfig;
use super::error::{
    CreateShadowDirectorySnafu, RemoveShadowBackupSnafu, SerializeSnafu, StorageResult,
    WriteShadowBackupSnafu,
};
use super::types::{ApplicationState, Channel, Conversation, Message, Persona};

/// Magic marker distinguishing a valid shadow record from unrelated data.
pub const SHADOW_MARKER: &str = "murmur-shadow";
pub const SHADOW_VERSION: u32 = 1;

/// Reduced, lossy projection of the aggregate, rebuilt from scratch on every
/// flush and written as a single record to its own storage location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSnapshot {
    pub marker: String,
    pub version: u32,
    pub saved_at: i64,
    pub personas: Vec<Persona>,
    pub channels: Vec<Channel>,
    pub settings: BTreeMap<String, Value>,
    pub plugin_states: BTreeMap<String, Value>,
    pub active_conversation: Option<ShadowConversation>,
}

impl ShadowSnapshot {
    pub fn is_recognized(&self) -> bool {
        self.marker == SHADOW_MARKER && self.version == SHADOW_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowConversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub persona_id: Option<String>,
    pub selected_channel_id: Option<String>,
    pub selected_model: Option<String>,
    /// Only the last `message_tail` messages survive the projection.
    pub messages: Vec<ShadowMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowMessage {
    pub id: String,
    pub role: super::types::MessageRole,
    pub content: String,
    pub reasoning: Option<String>,
    pub attachments: Vec<ShadowAttachment>,
    pub tool_calls: Vec<ShadowToolCall>,
    pub created_at: i64,
    pub parent_id: Option<String>,
}

/// Attachment metadata only; binary payloads never reach the shadow record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowAttachment {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowToolCall {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
}

/// Build the bounded projection of `state`. Pure; all caps come from `config`.
pub fn build_snapshot(
    state: &ApplicationState,
    config: &ShadowConfig,
    saved_at: i64,
) -> ShadowSnapshot {
    let active_conversation = state.active_conversation_id.as_deref().and_then(|active| {
        state
            .conversations
            .iter()
            .find(|conversation| conversation.id == active)
            .map(|conversation| project_conversation(conversation, config))
    });

    ShadowSnapshot {
        marker: SHADOW_MARKER.to_string(),
        version: SHADOW_VERSION,
        saved_at,
        personas: state.personas.clone(),
        channels: state.channels.clone(),
        settings: state.settings.clone(),
        plugin_states: state.plugin_states.clone(),
        active_conversation,
    }
}

fn project_conversation(conversation: &Conversation, config: &ShadowConfig) -> ShadowConversation {
    let tail_start = conversation.messages.len().saturating_sub(config.message_tail);
    ShadowConversation {
        id: conversation.id.clone(),
        title: conversation.title.clone(),
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
        persona_id: conversation.persona_id.clone(),
        selected_channel_id: conversation.selected_channel_id.clone(),
        selected_model: conversation.selected_model.clone(),
        messages: conversation.messages[tail_start..]
            .iter()
            .map(|message| project_message(message, config))
            .collect(),
    }
}

fn project_message(message: &Message, config: &ShadowConfig) -> ShadowMessage {
    ShadowMessage {
        id: message.id.clone(),
        role: message.role,
        content: truncate_chars(&message.content, config.text_cap),
        reasoning: message
            .reasoning
            .as_deref()
            .map(|text| truncate_chars(text, config.text_cap)),
        attachments: message
            .attachments
            .iter()
            .take(config.attachment_cap)
            .map(|attachment| ShadowAttachment {
                name: attachment.name.clone(),
                mime_type: attachment.mime_type.clone(),
                size_bytes: attachment.size_bytes,
                source: attachment.source.clone(),
            })
            .collect(),
        tool_calls: message
            .tool_calls
            .iter()
            .take(config.tool_call_cap)
            .map(|tool_call| ShadowToolCall {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                status: tool_call.status.clone(),
            })
            .collect(),
        created_at: message.created_at,
        parent_id: message.parent_id.clone(),
    }
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    text.chars().take(cap).collect()
}

#[derive(Debug, Default)]
struct WriterInner {
    pending: Option<ApplicationState>,
    armed: bool,
    /// Bumped by `clear` so an in-flight scheduled flush lands in the void
    /// instead of resurrecting just-deleted data.
    generation: u64,
    last_flush: Option<Instant>,
}

/// Throttled, coalescing writer of the shadow record.
///
/// `schedule` never writes synchronously: it queues the latest state
/// (last-write-wins) and arms at most one deferred flush task, which
/// additionally enforces a minimum inter-write interval at flush time. The
/// flush runs on a spawned low-priority task so its I/O never sits on the
/// primary save path.
#[derive(Debug, Clone)]
pub struct ShadowWriter {
    path: PathBuf,
    config: ShadowConfig,
    inner: Arc<Mutex<WriterInner>>,
}

impl ShadowWriter {
    pub fn new(path: PathBuf, config: ShadowConfig) -> Self {
        Self {
            path,
            config,
            inner: Arc::new(Mutex::new(WriterInner::default())),
        }
    }

    pub fn schedule(&self, state: &ApplicationState) {
        let generation = {
            let mut inner = self.inner.lock().expect("shadow writer mutex poisoned");
            inner.pending = Some(state.clone());
            if inner.armed {
                return;
            }
            inner.armed = true;
            inner.generation
        };

        let writer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(writer.config.schedule_delay).await;
            writer.flush_if_eligible(generation);
        });
    }

    /// Cancel any pending scheduled write and delete the shadow record.
    pub fn clear(&self) -> StorageResult<()> {
        {
            let mut inner = self.inner.lock().expect("shadow writer mutex poisoned");
            inner.generation += 1;
            inner.pending = None;
            inner.armed = false;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveShadowBackupSnafu {
                stage: "shadow-clear-remove",
                path: self.path.display().to_string(),
            }),
        }
    }

    /// Read back the stored record, if any; unrecognized or unparseable
    /// content is treated as absent.
    pub fn read(&self) -> Option<ShadowSnapshot> {
        read_snapshot(&self.path)
    }

    fn flush_if_eligible(&self, scheduled_generation: u64) {
        let queued = {
            let mut inner = self.inner.lock().expect("shadow writer mutex poisoned");
            if inner.generation != scheduled_generation {
                // Cleared while we slept.
                return;
            }
            inner.armed = false;
            let too_soon = inner
                .last_flush
                .is_some_and(|at| at.elapsed() < self.config.min_write_interval);
            if too_soon {
                // Leave the pending state queued for the next eligible window.
                return;
            }
            let Some(state) = inner.pending.take() else {
                return;
            };
            inner.last_flush = Some(Instant::now());
            state
        };

        let snapshot = build_snapshot(&queued, &self.config, crate::time::unix_timestamp_millis());
        if let Err(error) = write_snapshot(&self.path, &snapshot) {
            // Recovery copies are best-effort; the next eligible flush heals this.
            warn!(%error, "shadow backup flush failed");
        } else {
            debug!(path = %self.path.display(), "shadow backup flushed");
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &ShadowSnapshot) -> StorageResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateShadowDirectorySnafu {
            stage: "shadow-write-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    let serialized = serde_json::to_string(snapshot).context(SerializeSnafu {
        stage: "shadow-write-serialize",
        what: "shadow snapshot",
    })?;
    std::fs::write(path, serialized).context(WriteShadowBackupSnafu {
        stage: "shadow-write-store",
        path: path.display().to_string(),
    })
}

fn read_snapshot(path: &Path) -> Option<ShadowSnapshot> {
    let raw = std::fs::read_to_string(path).ok()?;
    let snapshot: ShadowSnapshot = serde_json::from_str(&raw).ok()?;
    snapshot.is_recognized().then_some(snapshot)
}
