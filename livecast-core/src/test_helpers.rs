//! Shared fixtures for unit tests

use crate::events::{EventPublisher, ServerEvent, Topic};
use livecast_sfu::ConnectionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Publisher that records every event instead of delivering it
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(Topic, ServerEvent)>>,
    subscriptions: Mutex<HashMap<Topic, HashSet<ConnectionId>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Topic, ServerEvent)> {
        self.published.lock().clone()
    }

    /// Names of events published to `topic`, in order
    pub fn names_on(&self, topic: &Topic) -> Vec<&'static str> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.name())
            .collect()
    }

    /// Every event with the given name, whatever the topic
    pub fn named(&self, name: &str) -> Vec<(Topic, ServerEvent)> {
        self.published
            .lock()
            .iter()
            .filter(|(_, e)| e.name() == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.named(name).len()
    }

    pub fn is_subscribed(&self, topic: &Topic, connection_id: &ConnectionId) -> bool {
        self.subscriptions
            .lock()
            .get(topic)
            .is_some_and(|s| s.contains(connection_id))
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, topic: &Topic, event: ServerEvent) -> usize {
        self.published.lock().push((topic.clone(), event));
        self.subscriptions.lock().get(topic).map_or(1, HashSet::len)
    }

    fn subscribe(&self, topic: Topic, connection_id: &ConnectionId) {
        self.subscriptions
            .lock()
            .entry(topic)
            .or_default()
            .insert(connection_id.clone());
    }

    fn unsubscribe(&self, topic: &Topic, connection_id: &ConnectionId) {
        if let Some(subscribers) = self.subscriptions.lock().get_mut(topic) {
            subscribers.remove(connection_id);
        }
    }

    fn close_topic(&self, topic: &Topic) {
        self.subscriptions.lock().remove(topic);
    }
}
