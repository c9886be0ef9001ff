//! Server-pushed events and the publishing seam
//!
//! Services never talk to sockets. They publish [`ServerEvent`]s to a
//! [`Topic`] through an [`EventPublisher`]; the connection layer decides how
//! the events reach clients.

use crate::models::{ChatMessage, ChatParticipant, StreamSummary};
use livecast_sfu::{ConnectionId, StreamId};
use serde::Serialize;
use std::fmt;

/// Audience of a published event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every connected client
    Global,
    /// Viewers and owner of one stream
    Stream(StreamId),
    /// Chat participants of one stream
    Chat(StreamId),
    /// A single connection
    Connection(ConnectionId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Stream(id) => write!(f, "stream:{id}"),
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Connection(id) => write!(f, "connection:{id}"),
        }
    }
}

/// Events pushed to clients without an expected reply
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    StreamStarted(StreamSummary),
    StreamEnded {
        stream_id: StreamId,
    },
    StreamViewerCount {
        stream_id: StreamId,
        viewer_count: usize,
    },
    AvailableStreams(Vec<StreamSummary>),
    NewChatMessage(ChatMessage),
    UserJoinedChat {
        stream_id: StreamId,
        participant: ChatParticipant,
        participant_count: usize,
    },
    UserLeftChat {
        stream_id: StreamId,
        connection_id: ConnectionId,
        username: String,
        participant_count: usize,
    },
    ProfanityWarning {
        stream_id: StreamId,
        warnings: u32,
        threshold: u32,
        message: String,
    },
    UserBlocked {
        stream_id: StreamId,
        remaining_seconds: u64,
        message: String,
    },
    ChatCleared {
        stream_id: StreamId,
        cleared_by: String,
    },
    UserTyping {
        stream_id: StreamId,
        connection_id: ConnectionId,
        username: String,
        is_typing: bool,
    },
}

impl ServerEvent {
    /// Wire name of the event
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StreamStarted(_) => "streamStarted",
            Self::StreamEnded { .. } => "streamEnded",
            Self::StreamViewerCount { .. } => "streamViewerCount",
            Self::AvailableStreams(_) => "availableStreams",
            Self::NewChatMessage(_) => "newChatMessage",
            Self::UserJoinedChat { .. } => "userJoinedChat",
            Self::UserLeftChat { .. } => "userLeftChat",
            Self::ProfanityWarning { .. } => "profanityWarning",
            Self::UserBlocked { .. } => "userBlocked",
            Self::ChatCleared { .. } => "chatCleared",
            Self::UserTyping { .. } => "userTyping",
        }
    }
}

/// Fan-out of server events to topic subscribers
pub trait EventPublisher: Send + Sync {
    /// Deliver `event` to every subscriber of `topic`, returning how many received it
    fn publish(&self, topic: &Topic, event: ServerEvent) -> usize;

    fn subscribe(&self, topic: Topic, connection_id: &ConnectionId);

    fn unsubscribe(&self, topic: &Topic, connection_id: &ConnectionId);

    /// Drop every subscription to `topic`
    fn close_topic(&self, topic: &Topic);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = ServerEvent::StreamViewerCount {
            stream_id: StreamId::from("s1"),
            viewer_count: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "streamViewerCount");
        assert_eq!(json["data"]["streamId"], "s1");
        assert_eq!(json["data"]["viewerCount"], 3);
        assert_eq!(json["event"], event.name());
    }

    #[test]
    fn test_listing_is_a_plain_array() {
        let json = serde_json::to_value(ServerEvent::AvailableStreams(Vec::new())).unwrap();
        assert_eq!(json["event"], "availableStreams");
        assert!(json["data"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_topic_display() {
        assert_eq!(Topic::Chat(StreamId::from("s1")).to_string(), "chat:s1");
        assert_eq!(Topic::Global.to_string(), "global");
    }
}
