use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use snafu::ResultExt;
use tracing::warn;

use super::error::{SerializeSnafu, StorageResult};
use super::fingerprint;
use super::types::{ApplicationState, Conversation, LOG_RETENTION, Message, SaveReport};

/// Schema version gating destructive upgrades of the normalized layout.
pub const SCHEMA_VERSION: i64 = 1;

/// Fixed logical record names of the meta table.
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_APP: &str = "app";
pub const META_PERSONAS: &str = "personas";
pub const META_CHANNELS: &str = "channels";
pub const META_PLUGIN_STATES: &str = "plugin_states";
pub const META_SETTINGS: &str = "settings";
pub const META_LOGS: &str = "logs";

/// Last-persisted picture of one conversation.
#[derive(Debug, Clone, Default)]
struct ConversationEntry {
    fingerprint: String,
    order: i64,
    /// Message id -> last-persisted message fingerprint.
    messages: HashMap<String, String>,
}

/// In-memory map from logical record key to last-persisted fingerprint,
/// plus the set of live message ids per conversation.
///
/// Owned exclusively by one engine instance. Mutated only after a
/// transaction's commit confirmation ([`DiffCache::commit_plan`]) or a full
/// reload ([`DiffCache::rebuild`]); a failed transaction leaves the cache
/// untouched so the next save retries the same diff decisions.
#[derive(Debug, Default)]
pub struct DiffCache {
    conversations: HashMap<String, ConversationEntry>,
    /// Meta values are small, so a plain last-serialization string cache is
    /// cheaper than structural fingerprints here.
    meta: HashMap<&'static str, String>,
}

#[derive(Debug, Clone)]
pub struct MetaWrite {
    pub name: &'static str,
    pub serialized: String,
}

#[derive(Debug, Clone)]
pub struct ConversationWrite {
    pub id: String,
    pub sort_order: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub payload: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct MessageWrite {
    pub conversation_id: String,
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub payload: String,
    pub fingerprint: String,
}

/// Everything one transaction will write or delete, plus the fingerprints
/// needed to update the cache once that transaction is confirmed committed.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub meta_writes: Vec<MetaWrite>,
    pub conversation_writes: Vec<ConversationWrite>,
    pub conversation_deletes: Vec<String>,
    pub message_writes: Vec<MessageWrite>,
    /// (conversation id, message id) pairs of rows to remove.
    pub message_deletes: Vec<(String, String)>,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.meta_writes.is_empty()
            && self.conversation_writes.is_empty()
            && self.conversation_deletes.is_empty()
            && self.message_writes.is_empty()
            && self.message_deletes.is_empty()
    }

    pub fn report(&self) -> SaveReport {
        SaveReport {
            meta_written: self.meta_writes.len(),
            conversations_written: self.conversation_writes.len(),
            conversations_deleted: self.conversation_deletes.len(),
            messages_written: self.message_writes.len(),
            messages_deleted: self.message_deletes.len(),
        }
    }
}

impl DiffCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the minimal transaction for `state`.
    ///
    /// `force_full` bypasses every diff check; used right after migration,
    /// when no cached fingerprint can be trusted.
    pub fn plan(&self, state: &ApplicationState, force_full: bool) -> StorageResult<WritePlan> {
        let mut plan = WritePlan::default();

        for (name, value) in meta_entries(state) {
            let value = match value {
                Ok(value) => value,
                Err(error) => {
                    // A single unserializable meta field never aborts the
                    // whole transaction; the stale row stays behind.
                    warn!(meta = name, %error, "skipping unserializable meta field");
                    continue;
                }
            };
            let serialized = value.to_string();
            if force_full || self.meta.get(name) != Some(&serialized) {
                plan.meta_writes.push(MetaWrite { name, serialized });
            }
        }

        let mut live_conversations = HashSet::with_capacity(state.conversations.len());
        for (index, conversation) in state.conversations.iter().enumerate() {
            live_conversations.insert(conversation.id.as_str());
            let order = index as i64;
            let payload = conversation_payload(conversation)?;
            let row_fingerprint = fingerprint::fingerprint(&payload);
            let cached = self.conversations.get(&conversation.id);

            let conversation_changed = force_full
                || cached.is_none_or(|entry| {
                    entry.fingerprint != row_fingerprint || entry.order != order
                });
            if conversation_changed {
                plan.conversation_writes.push(ConversationWrite {
                    id: conversation.id.clone(),
                    sort_order: order,
                    created_at: conversation.created_at,
                    updated_at: conversation.updated_at,
                    payload: payload.to_string(),
                    fingerprint: row_fingerprint,
                });
            }

            let mut live_messages = HashSet::with_capacity(conversation.messages.len());
            for message in &conversation.messages {
                live_messages.insert(message.id.as_str());
                let message_payload = message_payload(message)?;
                let message_fingerprint = fingerprint::fingerprint(&message_payload);
                let message_changed = force_full
                    || cached.is_none_or(|entry| {
                        entry.messages.get(&message.id) != Some(&message_fingerprint)
                    });
                if message_changed {
                    plan.message_writes.push(MessageWrite {
                        conversation_id: conversation.id.clone(),
                        id: message.id.clone(),
                        created_at: message.created_at,
                        updated_at: message.updated_at,
                        payload: message_payload.to_string(),
                        fingerprint: message_fingerprint,
                    });
                }
            }

            if let Some(entry) = cached {
                for known_id in entry.messages.keys() {
                    if !live_messages.contains(known_id.as_str()) {
                        plan.message_deletes
                            .push((conversation.id.clone(), known_id.clone()));
                    }
                }
            }
        }

        // Conversation rows disappearing from the aggregate cascade to all
        // of their message rows inside the same transaction.
        for known_id in self.conversations.keys() {
            if !live_conversations.contains(known_id.as_str()) {
                plan.conversation_deletes.push(known_id.clone());
            }
        }

        Ok(plan)
    }

    /// Fold a confirmed-committed plan back into the cache. Never call this
    /// speculatively: a failed transaction must leave the cache as-is.
    pub fn commit_plan(&mut self, plan: &WritePlan) {
        for meta_write in &plan.meta_writes {
            self.meta
                .insert(meta_write.name, meta_write.serialized.clone());
        }
        for conversation_write in &plan.conversation_writes {
            let entry = self
                .conversations
                .entry(conversation_write.id.clone())
                .or_default();
            entry.fingerprint = conversation_write.fingerprint.clone();
            entry.order = conversation_write.sort_order;
        }
        for message_write in &plan.message_writes {
            self.conversations
                .entry(message_write.conversation_id.clone())
                .or_default()
                .messages
                .insert(message_write.id.clone(), message_write.fingerprint.clone());
        }
        for (conversation_id, message_id) in &plan.message_deletes {
            if let Some(entry) = self.conversations.get_mut(conversation_id) {
                entry.messages.remove(message_id);
            }
        }
        for conversation_id in &plan.conversation_deletes {
            self.conversations.remove(conversation_id);
        }
    }

    /// Drop every cached fingerprint and repopulate from a freshly loaded
    /// aggregate, so the cache never disagrees with durable state after a
    /// load or migration.
    pub fn rebuild(&mut self, state: &ApplicationState) {
        self.clear();
        for (name, value) in meta_entries(state) {
            if let Ok(value) = value {
                self.meta.insert(name, value.to_string());
            }
        }
        for (index, conversation) in state.conversations.iter().enumerate() {
            let fingerprint = match conversation_payload(conversation) {
                Ok(payload) => fingerprint::fingerprint(&payload),
                Err(_) => fingerprint::UNAVAILABLE_SENTINEL.to_string(),
            };
            let mut entry = ConversationEntry {
                fingerprint,
                order: index as i64,
                messages: HashMap::with_capacity(conversation.messages.len()),
            };
            for message in &conversation.messages {
                entry.messages.insert(
                    message.id.clone(),
                    fingerprint::fingerprint_serializable(message),
                );
            }
            self.conversations.insert(conversation.id.clone(), entry);
        }
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.meta.clear();
    }
}

/// The fixed set of meta records projected from the aggregate.
fn meta_entries(
    state: &ApplicationState,
) -> Vec<(&'static str, Result<Value, serde_json::Error>)> {
    let log_tail_start = state.logs.len().saturating_sub(LOG_RETENTION);
    vec![
        (META_SCHEMA_VERSION, Ok(json!(SCHEMA_VERSION))),
        (
            META_APP,
            Ok(json!({
                "active_persona_id": state.active_persona_id,
                "active_conversation_id": state.active_conversation_id,
                "persona_last_conversation": state.persona_last_conversation,
            })),
        ),
        (META_PERSONAS, serde_json::to_value(&state.personas)),
        (META_CHANNELS, serde_json::to_value(&state.channels)),
        (META_PLUGIN_STATES, serde_json::to_value(&state.plugin_states)),
        (META_SETTINGS, serde_json::to_value(&state.settings)),
        (META_LOGS, serde_json::to_value(&state.logs[log_tail_start..])),
    ]
}

/// Conversation row payload: every scalar/metadata field, never the messages.
fn conversation_payload(conversation: &Conversation) -> StorageResult<Value> {
    let mut payload = serde_json::to_value(conversation).context(SerializeSnafu {
        stage: "plan-conversation-payload",
        what: "conversation",
    })?;
    if let Value::Object(fields) = &mut payload {
        fields.remove("messages");
    }
    Ok(payload)
}

fn message_payload(message: &Message) -> StorageResult<Value> {
    serde_json::to_value(message).context(SerializeSnafu {
        stage: "plan-message-payload",
        what: "message",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    fn message(id: &str, content: &str) -> Message {
        Message {
            id: id.to_string(),
            role: MessageRole::Assistant,
            content: content.to_string(),
            reasoning: None,
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            created_at: 1_000,
            updated_at: 1_000,
            parent_id: None,
            status: None,
            finish_reason: None,
            metadata: Value::Null,
        }
    }

    fn conversation(id: &str, messages: Vec<Message>) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: format!("conversation {id}"),
            created_at: 1_000,
            updated_at: 2_000,
            persona_id: None,
            selected_channel_id: None,
            selected_model: None,
            stream_override: None,
            reasoning_override: None,
            active_branches: Default::default(),
            metadata: Value::Null,
            messages,
        }
    }

    fn state(conversations: Vec<Conversation>) -> ApplicationState {
        ApplicationState {
            conversations,
            ..ApplicationState::default()
        }
    }

    #[test]
    fn first_plan_writes_everything_and_second_is_noop() {
        let mut cache = DiffCache::new();
        let fixture = state(vec![conversation("c1", vec![message("m1", "hello")])]);

        let first = cache.plan(&fixture, false).unwrap();
        assert_eq!(first.conversation_writes.len(), 1);
        assert_eq!(first.message_writes.len(), 1);
        assert!(first.meta_writes.len() >= 6);
        cache.commit_plan(&first);

        let second = cache.plan(&fixture, false).unwrap();
        assert!(second.is_empty(), "unchanged state must plan zero writes");
    }

    #[test]
    fn uncommitted_plan_leaves_diff_decisions_intact() {
        let mut cache = DiffCache::new();
        let fixture = state(vec![conversation("c1", vec![message("m1", "hello")])]);

        let first = cache.plan(&fixture, false).unwrap();
        // Simulated transaction failure: no commit_plan call.
        let retry = cache.plan(&fixture, false).unwrap();
        assert_eq!(retry.conversation_writes.len(), 1);
        assert_eq!(retry.message_writes.len(), first.message_writes.len());
        cache.commit_plan(&retry);
        assert!(cache.plan(&fixture, false).unwrap().is_empty());
    }

    #[test]
    fn mutating_one_message_plans_exactly_one_message_write() {
        let mut cache = DiffCache::new();
        let mut fixture = state(vec![
            conversation("a", vec![message("a1", "first")]),
            conversation("b", vec![message("b1", "second"), message("b2", "third")]),
            conversation("c", vec![message("c1", "fourth")]),
        ]);
        cache.commit_plan(&cache.plan(&fixture, false).unwrap());

        fixture.conversations[1].messages[1].content.push_str(" +token");
        let plan = cache.plan(&fixture, false).unwrap();
        assert_eq!(plan.message_writes.len(), 1);
        assert_eq!(plan.message_writes[0].conversation_id, "b");
        assert_eq!(plan.message_writes[0].id, "b2");
        assert!(plan.conversation_writes.is_empty());
        assert!(plan.message_deletes.is_empty());

        // Touching updated_at additionally rewrites exactly that one row.
        cache.commit_plan(&plan);
        fixture.conversations[1].updated_at += 1;
        let plan = cache.plan(&fixture, false).unwrap();
        assert_eq!(plan.conversation_writes.len(), 1);
        assert_eq!(plan.conversation_writes[0].id, "b");
        assert!(plan.message_writes.is_empty());
    }

    #[test]
    fn reordering_conversations_rewrites_moved_rows() {
        let mut cache = DiffCache::new();
        let mut fixture = state(vec![
            conversation("a", Vec::new()),
            conversation("b", Vec::new()),
        ]);
        cache.commit_plan(&cache.plan(&fixture, false).unwrap());

        fixture.conversations.swap(0, 1);
        let plan = cache.plan(&fixture, false).unwrap();
        assert_eq!(plan.conversation_writes.len(), 2);
        assert!(plan.message_writes.is_empty());
    }

    #[test]
    fn removed_records_are_planned_for_deletion() {
        let mut cache = DiffCache::new();
        let mut fixture = state(vec![
            conversation("a", vec![message("a1", "x")]),
            conversation("b", vec![message("b1", "y"), message("b2", "z")]),
        ]);
        cache.commit_plan(&cache.plan(&fixture, false).unwrap());

        fixture.conversations[1].messages.remove(0);
        fixture.conversations.remove(0);
        let plan = cache.plan(&fixture, false).unwrap();
        assert_eq!(plan.conversation_deletes, vec!["a".to_string()]);
        assert_eq!(
            plan.message_deletes,
            vec![("b".to_string(), "b1".to_string())]
        );
    }

    #[test]
    fn force_full_bypasses_every_diff_check() {
        let mut cache = DiffCache::new();
        let fixture = state(vec![conversation("c1", vec![message("m1", "hello")])]);
        cache.commit_plan(&cache.plan(&fixture, false).unwrap());

        let forced = cache.plan(&fixture, true).unwrap();
        assert_eq!(forced.conversation_writes.len(), 1);
        assert_eq!(forced.message_writes.len(), 1);
        assert!(forced.meta_writes.len() >= 6);
    }

    #[test]
    fn rebuild_matches_a_committed_plan() {
        let mut committed = DiffCache::new();
        let fixture = state(vec![conversation("c1", vec![message("m1", "hello")])]);
        committed.commit_plan(&committed.plan(&fixture, false).unwrap());

        let mut rebuilt = DiffCache::new();
        rebuilt.rebuild(&fixture);
        assert!(rebuilt.plan(&fixture, false).unwrap().is_empty());
    }

    #[test]
    fn logs_are_bounded_in_the_meta_projection() {
        let mut fixture = state(Vec::new());
        fixture.logs = (0..500)
            .map(|index| crate::types::LogEntry {
                timestamp: index,
                level: "info".to_string(),
                message: format!("entry {index}"),
            })
            .collect();

        let logs_value = meta_entries(&fixture)
            .into_iter()
            .find(|(name, _)| *name == META_LOGS)
            .unwrap()
            .1
            .unwrap();
        let retained = logs_value.as_array().unwrap();
        assert_eq!(retained.len(), LOG_RETENTION);
        assert_eq!(retained[0]["timestamp"], json!(300));
    }
}
