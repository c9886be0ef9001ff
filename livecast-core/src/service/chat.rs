use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::events::{EventPublisher, ServerEvent, Topic};
use crate::models::{
    ChatMessage, ChatParticipant, JoinChatResponse, MessageType, SendMessageRequest, WarningStatus,
};
use crate::service::content_filter::ContentFilter;
use crate::service::moderation::{ModerationTracker, Violation};
use crate::service::rate_limit::MessageRateLimiter;
use crate::service::stream::StreamRegistry;
use chrono::Utc;
use dashmap::DashMap;
use livecast_sfu::{ConnectionId, StreamId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Chat state of one stream
#[derive(Debug, Default)]
struct ChatRoom {
    participants: HashMap<ConnectionId, ChatParticipant>,
    messages: VecDeque<ChatMessage>,
}

impl ChatRoom {
    fn push(&mut self, message: ChatMessage, capacity: usize) {
        while self.messages.len() >= capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    fn participant_list(&self) -> Vec<ChatParticipant> {
        let mut participants: Vec<ChatParticipant> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        participants
    }
}

/// Per-stream moderated chat
pub struct ChatService {
    config: ChatConfig,
    streams: Arc<StreamRegistry>,
    publisher: Arc<dyn EventPublisher>,
    filter: ContentFilter,
    rate_limiter: MessageRateLimiter,
    moderation: ModerationTracker,
    rooms: DashMap<StreamId, ChatRoom>,
}

impl ChatService {
    pub fn new(
        config: ChatConfig,
        streams: Arc<StreamRegistry>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let filter = ContentFilter::new(config.max_message_length, &config.extra_blocked_words)?;
        let rate_limiter =
            MessageRateLimiter::new(config.rate_limit_messages, config.rate_limit_window());
        let moderation = ModerationTracker::new(
            config.warning_threshold,
            config.warning_window(),
            config.timeout(),
        );

        Ok(Self {
            config,
            streams,
            publisher,
            filter,
            rate_limiter,
            moderation,
            rooms: DashMap::new(),
        })
    }

    fn validate_username(&self, username: &str) -> Result<String> {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("username", "must not be empty"));
        }
        if trimmed.chars().count() > self.config.max_username_length {
            return Err(Error::validation(
                "username",
                format!("must be at most {} characters", self.config.max_username_length),
            ));
        }
        Ok(trimmed.to_string())
    }

    fn system_message(stream_id: &StreamId, about: &ChatParticipant, content: String) -> ChatMessage {
        ChatMessage::new(
            stream_id.clone(),
            about.connection_id.clone(),
            "System".to_string(),
            content,
            MessageType::System,
        )
    }

    pub fn join_chat(
        &self,
        connection_id: &ConnectionId,
        stream_id: &StreamId,
        username: &str,
        user_id: Option<String>,
    ) -> Result<JoinChatResponse> {
        let username = self.validate_username(username)?;
        let owner = self
            .streams
            .owner_of(stream_id)
            .ok_or(Error::NotFoundOrUnauthorized)?;

        let participant = ChatParticipant {
            connection_id: connection_id.clone(),
            username,
            user_id,
            is_moderator: &owner == connection_id,
            joined_at: Utc::now(),
        };
        let joined = Self::system_message(
            stream_id,
            &participant,
            format!("{} joined the chat", participant.username),
        );

        let (recent_messages, participants) = {
            let mut room = self.rooms.entry(stream_id.clone()).or_default();
            if room.participants.contains_key(connection_id) {
                return Err(Error::AlreadyInChat);
            }
            room.participants
                .insert(connection_id.clone(), participant.clone());
            room.push(joined.clone(), self.config.history_capacity);
            (
                room.recent(self.config.join_history),
                room.participant_list(),
            )
        };

        // the stream may have ended while the room was being created
        if !self.streams.exists(stream_id) {
            self.rooms.remove(stream_id);
            return Err(Error::NotFoundOrUnauthorized);
        }

        let topic = Topic::Chat(stream_id.clone());
        self.publisher.publish(
            &topic,
            ServerEvent::UserJoinedChat {
                stream_id: stream_id.clone(),
                participant: participant.clone(),
                participant_count: participants.len(),
            },
        );
        self.publisher.publish(&topic, ServerEvent::NewChatMessage(joined));
        self.publisher.subscribe(topic, connection_id);

        info!(
            stream_id = %stream_id,
            connection_id = %connection_id,
            moderator = participant.is_moderator,
            participants = participants.len(),
            "Joined chat"
        );

        Ok(JoinChatResponse {
            participant,
            recent_messages,
            participants,
        })
    }

    /// Leave a chat; returns false when the connection was not in it
    pub fn leave_chat(&self, connection_id: &ConnectionId, stream_id: &StreamId) -> bool {
        let left = {
            let Some(mut room) = self.rooms.get_mut(stream_id) else {
                return false;
            };
            let Some(participant) = room.participants.remove(connection_id) else {
                return false;
            };
            let message = Self::system_message(
                stream_id,
                &participant,
                format!("{} left the chat", participant.username),
            );
            room.push(message.clone(), self.config.history_capacity);
            (participant, message, room.participants.len())
        };
        let (participant, message, participant_count) = left;

        let topic = Topic::Chat(stream_id.clone());
        self.publisher.unsubscribe(&topic, connection_id);
        self.publisher.publish(
            &topic,
            ServerEvent::UserLeftChat {
                stream_id: stream_id.clone(),
                connection_id: connection_id.clone(),
                username: participant.username,
                participant_count,
            },
        );
        self.publisher.publish(&topic, ServerEvent::NewChatMessage(message));

        debug!(stream_id = %stream_id, connection_id = %connection_id, "Left chat");
        true
    }

    fn participant(&self, connection_id: &ConnectionId, stream_id: &StreamId) -> Result<ChatParticipant> {
        if !self.streams.exists(stream_id) {
            return Err(Error::NotFoundOrUnauthorized);
        }
        self.rooms
            .get(stream_id)
            .and_then(|room| room.participants.get(connection_id).cloned())
            .ok_or(Error::NotInChat)
    }

    /// Send a chat message.
    ///
    /// Moderators skip every check below. For everyone else, in order: a
    /// timed out sender is rejected, the rate limit is charged, the content
    /// is validated, and blocked words are censored (which counts as a
    /// violation). Only then is the message stored and broadcast.
    pub fn send_message(
        &self,
        connection_id: &ConnectionId,
        stream_id: &StreamId,
        request: &SendMessageRequest,
    ) -> Result<ChatMessage> {
        let participant = self.participant(connection_id, stream_id)?;

        if !participant.is_moderator {
            self.moderation
                .check_timeout(connection_id)
                .map_err(|remaining_seconds| Error::TimedOut { remaining_seconds })?;
            self.rate_limiter
                .check(connection_id)
                .map_err(|retry_after_seconds| {
                    warn!(connection_id = %connection_id, retry_after_seconds, "Chat rate limit exceeded");
                    Error::RateLimited {
                        retry_after_seconds,
                    }
                })?;
        }

        let content = self.filter.validate(&request.content)?;
        let message_type = if participant.is_moderator {
            MessageType::Moderator
        } else {
            MessageType::Message
        };
        let mut message = ChatMessage::new(
            stream_id.clone(),
            connection_id.clone(),
            participant.username.clone(),
            content.to_string(),
            message_type,
        );

        let mut violation = None;
        if !participant.is_moderator {
            if let Some(cleaned) = self.filter.censor(content) {
                message = message.filtered(cleaned);
                violation = Some(self.moderation.record_violation(connection_id));
            }
        }

        if let Some(violation) = violation {
            self.notify_violation(&participant, stream_id, violation);
        }

        self.append(stream_id, message.clone())?;
        self.publisher.publish(
            &Topic::Chat(stream_id.clone()),
            ServerEvent::NewChatMessage(message.clone()),
        );

        if let Some(Violation {
            timed_out_for: Some(duration),
            ..
        }) = violation
        {
            let notice = ChatMessage::new(
                stream_id.clone(),
                connection_id.clone(),
                "System".to_string(),
                format!(
                    "{} has been timed out for {} minutes",
                    participant.username,
                    duration.as_secs().div_ceil(60)
                ),
                MessageType::Warning,
            );
            self.append(stream_id, notice.clone())?;
            self.publisher.publish(
                &Topic::Chat(stream_id.clone()),
                ServerEvent::NewChatMessage(notice),
            );
        }

        debug!(
            stream_id = %stream_id,
            connection_id = %connection_id,
            message_id = %message.id,
            filtered = message.is_filtered,
            "Chat message sent"
        );
        Ok(message)
    }

    fn notify_violation(&self, participant: &ChatParticipant, stream_id: &StreamId, violation: Violation) {
        let private = Topic::Connection(participant.connection_id.clone());
        let threshold = self.moderation.threshold();

        self.publisher.publish(
            &private,
            ServerEvent::ProfanityWarning {
                stream_id: stream_id.clone(),
                warnings: violation.warnings,
                threshold,
                message: format!(
                    "Your message contained inappropriate language and was filtered. Warning {} of {threshold}.",
                    violation.warnings
                ),
            },
        );

        if let Some(duration) = violation.timed_out_for {
            warn!(
                stream_id = %stream_id,
                connection_id = %participant.connection_id,
                timeout_secs = duration.as_secs(),
                "Chat participant timed out"
            );
            self.publisher.publish(
                &private,
                ServerEvent::UserBlocked {
                    stream_id: stream_id.clone(),
                    remaining_seconds: duration.as_secs(),
                    message: format!(
                        "You have been timed out for {} minutes for repeated inappropriate language.",
                        duration.as_secs().div_ceil(60)
                    ),
                },
            );
        }
    }

    fn append(&self, stream_id: &StreamId, message: ChatMessage) -> Result<()> {
        let mut room = self
            .rooms
            .get_mut(stream_id)
            .ok_or(Error::NotFoundOrUnauthorized)?;
        room.push(message, self.config.history_capacity);
        Ok(())
    }

    /// Last `limit` messages (default: the join history size), oldest first
    pub fn get_history(&self, stream_id: &StreamId, limit: Option<usize>) -> Result<Vec<ChatMessage>> {
        if !self.streams.exists(stream_id) {
            return Err(Error::NotFoundOrUnauthorized);
        }
        let limit = limit
            .unwrap_or(self.config.join_history)
            .min(self.config.history_capacity);
        Ok(self
            .rooms
            .get(stream_id)
            .map(|room| room.recent(limit))
            .unwrap_or_default())
    }

    pub fn get_participants(&self, stream_id: &StreamId) -> Result<Vec<ChatParticipant>> {
        if !self.streams.exists(stream_id) {
            return Err(Error::NotFoundOrUnauthorized);
        }
        Ok(self
            .rooms
            .get(stream_id)
            .map(|room| room.participant_list())
            .unwrap_or_default())
    }

    /// Moderator only. Returns how many messages were removed.
    pub fn clear_history(&self, connection_id: &ConnectionId, stream_id: &StreamId) -> Result<usize> {
        self.streams.require_owner(stream_id, connection_id)?;

        let (cleared, cleared_by) = match self.rooms.get_mut(stream_id) {
            Some(mut room) => {
                let cleared = room.messages.len();
                room.messages.clear();
                let cleared_by = room
                    .participants
                    .get(connection_id)
                    .map_or_else(|| "Moderator".to_string(), |p| p.username.clone());
                (cleared, cleared_by)
            }
            None => (0, "Moderator".to_string()),
        };

        self.publisher.publish(
            &Topic::Chat(stream_id.clone()),
            ServerEvent::ChatCleared {
                stream_id: stream_id.clone(),
                cleared_by,
            },
        );
        info!(stream_id = %stream_id, cleared, "Chat history cleared");
        Ok(cleared)
    }

    /// Relay a typing indicator to the rest of the chat
    pub fn typing(&self, connection_id: &ConnectionId, stream_id: &StreamId, is_typing: bool) -> Result<()> {
        let participant = self.participant(connection_id, stream_id)?;
        self.publisher.publish(
            &Topic::Chat(stream_id.clone()),
            ServerEvent::UserTyping {
                stream_id: stream_id.clone(),
                connection_id: connection_id.clone(),
                username: participant.username,
                is_typing,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn warning_status(&self, connection_id: &ConnectionId) -> WarningStatus {
        self.moderation.status(connection_id)
    }

    /// Leave every chat the connection is in and forget its rate-limit and warning records
    pub fn remove_connection_from_all_chats(&self, connection_id: &ConnectionId) -> Vec<StreamId> {
        let joined: Vec<StreamId> = self
            .rooms
            .iter()
            .filter(|room| room.participants.contains_key(connection_id))
            .map(|room| room.key().clone())
            .collect();

        let left: Vec<StreamId> = joined
            .into_iter()
            .filter(|stream_id| self.leave_chat(connection_id, stream_id))
            .collect();

        self.rate_limiter.clear(connection_id);
        self.moderation.clear(connection_id);
        left
    }

    /// Drop a stream's chat room and its subscriptions. Idempotent.
    pub fn close_room(&self, stream_id: &StreamId) {
        if let Some((_, room)) = self.rooms.remove(stream_id) {
            debug!(
                stream_id = %stream_id,
                participants = room.participants.len(),
                messages = room.messages.len(),
                "Chat room closed"
            );
        }
        self.publisher.close_topic(&Topic::Chat(stream_id.clone()));
    }

    #[must_use]
    pub fn participant_count(&self, stream_id: &StreamId) -> usize {
        self.rooms.get(stream_id).map_or(0, |room| room.participants.len())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Reclaim lapsed rate-limit and warning records
    pub fn purge_expired(&self) -> usize {
        self.rate_limiter.purge_expired() + self.moderation.purge_expired()
    }

    /// Run `purge_expired` periodically; `None` when the janitor is disabled
    pub fn spawn_janitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.janitor_interval()?;
        let service = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = service.purge_expired();
                if purged > 0 {
                    debug!(purged, "Expired chat records purged");
                }
            }
        }))
    }
}
