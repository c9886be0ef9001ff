use dashmap::DashMap;
use livecast_sfu::ConnectionId;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{EventPublisher, ServerEvent, Topic};

/// Outbound queue of one client connection
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// In-memory hub routing events to connected clients by topic
#[derive(Default)]
pub struct ConnectionHub {
    /// connection -> outbound queue
    connections: DashMap<ConnectionId, EventSender>,

    /// topic -> subscribed connections
    topics: DashMap<Topic, HashSet<ConnectionId>>,

    /// connection -> topics it subscribed to, for cleanup
    memberships: DashMap<ConnectionId, HashSet<Topic>>,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; events for it arrive on the returned receiver
    pub fn register(&self, connection_id: &ConnectionId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.connections.insert(connection_id.clone(), tx).is_some() {
            warn!(connection_id = %connection_id, "Connection registered twice, replacing queue");
        }
        info!(
            connection_id = %connection_id,
            connections = self.connections.len(),
            "Connection registered"
        );
        rx
    }

    /// Forget a connection and every subscription it holds
    pub fn unregister(&self, connection_id: &ConnectionId) {
        self.connections.remove(connection_id);
        let topics = self
            .memberships
            .remove(connection_id)
            .map(|(_, topics)| topics)
            .unwrap_or_default();
        for topic in &topics {
            self.remove_subscriber(topic, connection_id);
        }
        debug!(
            connection_id = %connection_id,
            topics = topics.len(),
            "Connection unregistered"
        );
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        match topic {
            Topic::Global => self.connections.len(),
            Topic::Connection(id) => usize::from(self.connections.contains_key(id)),
            _ => self.topics.get(topic).map_or(0, |s| s.len()),
        }
    }

    fn remove_subscriber(&self, topic: &Topic, connection_id: &ConnectionId) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                drop(subscribers); // release the shard before removing
                self.topics.remove_if(topic, |_, s| s.is_empty());
            }
        }
    }

    /// Senders of everyone on `topic`, collected before any send so no guard
    /// is held while delivering
    fn recipients(&self, topic: &Topic) -> Vec<(ConnectionId, EventSender)> {
        match topic {
            Topic::Global => self
                .connections
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            Topic::Connection(id) => self
                .connections
                .get(id)
                .map(|tx| vec![(id.clone(), tx.clone())])
                .unwrap_or_default(),
            _ => {
                let ids: Vec<ConnectionId> = self
                    .topics
                    .get(topic)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                ids.into_iter()
                    .filter_map(|id| {
                        let tx = self.connections.get(&id)?.clone();
                        Some((id, tx))
                    })
                    .collect()
            }
        }
    }
}

impl EventPublisher for ConnectionHub {
    fn publish(&self, topic: &Topic, event: ServerEvent) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        for (connection_id, tx) in self.recipients(topic) {
            match tx.send(event.clone()) {
                Ok(()) => sent_count += 1,
                Err(err) => {
                    warn!(
                        connection_id = %connection_id,
                        topic = %topic,
                        error = %err,
                        "Failed to send event to client, marking for cleanup"
                    );
                    failed_connections.push(connection_id);
                }
            }
        }

        for connection_id in failed_connections {
            self.unregister(&connection_id);
        }

        debug!(
            topic = %topic,
            event_type = event.name(),
            sent_count,
            "Event published"
        );
        sent_count
    }

    fn subscribe(&self, topic: Topic, connection_id: &ConnectionId) {
        if matches!(topic, Topic::Global | Topic::Connection(_)) {
            return;
        }
        if !self.connections.contains_key(connection_id) {
            debug!(connection_id = %connection_id, topic = %topic, "Ignoring subscribe of unknown connection");
            return;
        }
        self.topics
            .entry(topic.clone())
            .or_default()
            .insert(connection_id.clone());
        self.memberships
            .entry(connection_id.clone())
            .or_default()
            .insert(topic);
    }

    fn unsubscribe(&self, topic: &Topic, connection_id: &ConnectionId) {
        self.remove_subscriber(topic, connection_id);
        if let Some(mut topics) = self.memberships.get_mut(connection_id) {
            topics.remove(topic);
        }
    }

    fn close_topic(&self, topic: &Topic) {
        let Some((_, subscribers)) = self.topics.remove(topic) else {
            return;
        };
        for connection_id in &subscribers {
            if let Some(mut topics) = self.memberships.get_mut(connection_id) {
                topics.remove(topic);
            }
        }
        debug!(topic = %topic, subscribers = subscribers.len(), "Topic closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_sfu::StreamId;

    fn ended(id: &str) -> ServerEvent {
        ServerEvent::StreamEnded {
            stream_id: StreamId::from(id),
        }
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let hub = ConnectionHub::new();
        let (a, b) = (ConnectionId::from("a"), ConnectionId::from("b"));
        let mut rx_a = hub.register(&a);
        let mut rx_b = hub.register(&b);
        let topic = Topic::Stream(StreamId::from("s1"));

        hub.subscribe(topic.clone(), &a);
        assert_eq!(hub.publish(&topic, ended("s1")), 1);
        assert_eq!(hub.publish(&Topic::Global, ended("s2")), 2);
        assert_eq!(hub.publish(&Topic::Connection(b.clone()), ended("s3")), 1);

        assert_eq!(rx_a.recv().await.unwrap().name(), "streamEnded");
        assert!(rx_a.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());

        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::StreamEnded { stream_id } if stream_id.as_str() == "s2"
        ));
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close_topic() {
        let hub = ConnectionHub::new();
        let a = ConnectionId::from("a");
        let _rx = hub.register(&a);
        let topic = Topic::Chat(StreamId::from("s1"));

        hub.subscribe(topic.clone(), &a);
        assert_eq!(hub.subscriber_count(&topic), 1);
        hub.unsubscribe(&topic, &a);
        assert_eq!(hub.subscriber_count(&topic), 0);

        hub.subscribe(topic.clone(), &a);
        hub.close_topic(&topic);
        assert_eq!(hub.publish(&topic, ended("s1")), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cleaned_up() {
        let hub = ConnectionHub::new();
        let a = ConnectionId::from("a");
        let rx = hub.register(&a);
        hub.subscribe(Topic::Stream(StreamId::from("s1")), &a);
        drop(rx);

        assert_eq!(hub.publish(&Topic::Global, ended("s1")), 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(&Topic::Stream(StreamId::from("s1"))), 0);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let hub = ConnectionHub::new();
        hub.unregister(&ConnectionId::from("ghost"));
        assert_eq!(hub.connection_count(), 0);
    }
}
