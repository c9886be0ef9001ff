use chrono::{DateTime, Utc};
use livecast_sfu::{ConnectionId, StreamId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// `<unix-millis>-<sequence>-<random>`: ordered within a process, unique across processes
#[must_use]
pub fn next_message_id() -> String {
    let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{seq}-{}",
        Utc::now().timestamp_millis(),
        nanoid::nanoid!(6)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParticipant {
    pub connection_id: ConnectionId,
    pub username: String,
    pub user_id: Option<String>,
    /// True iff the participant owns the stream
    pub is_moderator: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Message,
    System,
    Moderator,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub stream_id: StreamId,
    pub sender_id: ConnectionId,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Raw input before filtering; kept server side only
    #[serde(skip_serializing)]
    pub original_content: Option<String>,
    pub is_filtered: bool,
}

impl ChatMessage {
    pub fn new(
        stream_id: StreamId,
        sender_id: ConnectionId,
        username: String,
        content: String,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: next_message_id(),
            stream_id,
            sender_id,
            username,
            content,
            timestamp: Utc::now(),
            message_type,
            original_content: None,
            is_filtered: false,
        }
    }

    /// Replace the visible content with its filtered form, remembering the original
    #[must_use]
    pub fn filtered(mut self, cleaned: String) -> Self {
        self.original_content = Some(std::mem::replace(&mut self.content, cleaned));
        self.is_filtered = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChatResponse {
    pub participant: ChatParticipant,
    pub recent_messages: Vec<ChatMessage>,
    pub participants: Vec<ChatParticipant>,
}

/// Outgoing chat message. `username`/`user_id` are accepted for compatibility
/// but the participant record decides who is speaking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningStatus {
    pub warnings: u32,
    pub is_timed_out: bool,
    pub remaining_seconds: u64,
}
