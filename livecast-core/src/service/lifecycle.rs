//! Connect and disconnect handling
//!
//! Disconnect teardown runs in a fixed order:
//!
//! 1. a stream the connection owns is force-stopped and its transports closed
//! 2. the connection leaves every viewer set
//! 3. the connection leaves every chat
//! 4. every transport the connection created is closed
//!
//! Chat rooms of streams ended in step 1 are closed only after step 3, so the
//! owner's "left" message still reaches the room. Every step tolerates running
//! twice.

use crate::events::{EventPublisher, ServerEvent, Topic};
use crate::service::chat::ChatService;
use crate::service::stream::StreamRegistry;
use crate::service::{publish_listing, publish_stream_ended};
use livecast_sfu::{ClosedTransport, ConnectionId, EngineEvent, StreamId, TransportRegistry, TransportRole};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a disconnect cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectSummary {
    pub ended_stream: Option<StreamId>,
    pub watched_streams: Vec<StreamId>,
    pub left_chats: Vec<StreamId>,
    pub closed_transports: usize,
}

pub struct ConnectionLifecycle {
    streams: Arc<StreamRegistry>,
    transports: Arc<TransportRegistry>,
    chat: Arc<ChatService>,
    publisher: Arc<dyn EventPublisher>,
}

impl ConnectionLifecycle {
    pub fn new(
        streams: Arc<StreamRegistry>,
        transports: Arc<TransportRegistry>,
        chat: Arc<ChatService>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            streams,
            transports,
            chat,
            publisher,
        }
    }

    /// Register a new connection and send it the current listing
    pub fn on_connect(&self, connection_id: &ConnectionId) {
        self.transports.open_connection(connection_id);
        self.publisher.publish(
            &Topic::Connection(connection_id.clone()),
            ServerEvent::AvailableStreams(self.streams.list_active()),
        );
        debug!(connection_id = %connection_id, "Connection opened");
    }

    pub async fn on_disconnect(&self, connection_id: &ConnectionId) -> DisconnectSummary {
        let mut summary = DisconnectSummary::default();

        if let Some(ended) = self.streams.handle_owner_disconnect(connection_id) {
            let closed = self.transports.close_stream_transports(&ended.id).await;
            debug!(stream_id = %ended.id, transports = closed.len(), "Stream transports closed");
            publish_stream_ended(&self.streams, self.publisher.as_ref(), &ended.id);
            summary.ended_stream = Some(ended.id);
        }

        let watched = self.streams.handle_viewer_disconnect(connection_id);
        for (stream_id, viewer_count) in &watched {
            self.publisher
                .unsubscribe(&Topic::Stream(stream_id.clone()), connection_id);
            self.publisher.publish(
                &Topic::Stream(stream_id.clone()),
                ServerEvent::StreamViewerCount {
                    stream_id: stream_id.clone(),
                    viewer_count: *viewer_count,
                },
            );
        }
        if !watched.is_empty() {
            publish_listing(&self.streams, self.publisher.as_ref());
        }
        summary.watched_streams = watched.into_iter().map(|(id, _)| id).collect();

        summary.left_chats = self.chat.remove_connection_from_all_chats(connection_id);
        if let Some(ended) = &summary.ended_stream {
            self.chat.close_room(ended);
        }

        let closed = self.transports.close_connection_transports(connection_id).await;
        summary.closed_transports = closed.len();
        for transport in &closed {
            self.detach_transport(transport);
        }

        info!(
            connection_id = %connection_id,
            ended_stream = ?summary.ended_stream,
            watched = summary.watched_streams.len(),
            chats = summary.left_chats.len(),
            transports = summary.closed_transports,
            "Connection cleaned up"
        );
        summary
    }

    /// Forget the producers of a closed producer transport
    fn detach_transport(&self, transport: &ClosedTransport) {
        if transport.role != TransportRole::Producer {
            return;
        }
        self.streams
            .clear_producer_transport(&transport.stream_id, &transport.id);
        if self
            .streams
            .remove_producers(&transport.stream_id, &transport.producers)
        {
            info!(
                stream_id = %transport.stream_id,
                transport_id = %transport.id,
                "Stream hidden after losing its producer transport"
            );
            publish_listing(&self.streams, self.publisher.as_ref());
        }
    }

    /// Apply a transport state report from the media engine
    pub async fn on_engine_event(&self, event: &EngineEvent) {
        if let Some(closed) = self.transports.handle_engine_event(event).await {
            self.detach_transport(&closed);
        }
    }

    /// Feed engine state reports into [`Self::on_engine_event`] until the engine goes away
    pub fn spawn_engine_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        let mut events = self.transports.engine().subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => lifecycle.on_engine_event(&event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Engine event pump lagged by {} events", n);
                    }
                    Err(RecvError::Closed) => {
                        info!("Engine event channel closed, stopping pump");
                        break;
                    }
                }
            }
        })
    }
}
