//! Business logic services
//!
//! Registries are plain objects built once at startup and shared by `Arc`.
//! No service talks to sockets; every client-visible effect goes through
//! the [`EventPublisher`](crate::events::EventPublisher) seam.

pub mod chat;
pub mod content_filter;
pub mod lifecycle;
pub mod moderation;
pub mod rate_limit;
pub mod signaling;
pub mod stream;

pub use chat::ChatService;
pub use content_filter::{ContentFilter, ContentFilterError};
pub use lifecycle::{ConnectionLifecycle, DisconnectSummary};
pub use moderation::{ModerationState, ModerationTracker, Violation};
pub use rate_limit::MessageRateLimiter;
pub use signaling::SignalingService;
pub use stream::{EndedStream, StreamRegistry};

use crate::events::{EventPublisher, ServerEvent, Topic};

/// Push the refreshed public listing to every client
pub(crate) fn publish_listing(streams: &StreamRegistry, publisher: &dyn EventPublisher) {
    publisher.publish(&Topic::Global, ServerEvent::AvailableStreams(streams.list_active()));
}

/// Tell everyone a stream is gone and drop its audience topic
pub(crate) fn publish_stream_ended(
    streams: &StreamRegistry,
    publisher: &dyn EventPublisher,
    stream_id: &livecast_sfu::StreamId,
) {
    publisher.publish(
        &Topic::Global,
        ServerEvent::StreamEnded {
            stream_id: stream_id.clone(),
        },
    );
    publish_listing(streams, publisher);
    publisher.close_topic(&Topic::Stream(stream_id.clone()));
}
