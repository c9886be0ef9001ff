use crate::error::{Error, Result};
use crate::models::{StreamSession, StreamState, StreamSummary};
use livecast_sfu::{ConnectionId, MediaKind, ProducerId, StreamId, TransportId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

pub const MAX_TITLE_LENGTH: usize = 100;
pub const MAX_BROADCASTER_NAME_LENGTH: usize = 50;

/// What was left of a stream when it ended
#[derive(Debug, Clone)]
pub struct EndedStream {
    pub id: StreamId,
    pub owner: ConnectionId,
    pub viewers: Vec<ConnectionId>,
    pub producers: Vec<ProducerId>,
    pub producer_transport_id: Option<TransportId>,
}

impl From<StreamSession> for EndedStream {
    fn from(session: StreamSession) -> Self {
        Self {
            id: session.id,
            owner: session.owner,
            viewers: session.viewers.into_iter().collect(),
            producers: session.producers.into_keys().collect(),
            producer_transport_id: session.producer_transport_id,
        }
    }
}

#[derive(Default)]
struct Streams {
    sessions: HashMap<StreamId, StreamSession>,
    /// owner connection -> its single stream
    owners: HashMap<ConnectionId, StreamId>,
}

impl Streams {
    fn owned_mut(&mut self, id: &StreamId, owner: &ConnectionId) -> Result<&mut StreamSession> {
        self.sessions
            .get_mut(id)
            .filter(|s| &s.owner == owner)
            .ok_or(Error::NotFoundOrUnauthorized)
    }

    fn remove(&mut self, id: &StreamId) -> Option<StreamSession> {
        let mut session = self.sessions.remove(id)?;
        self.owners.remove(&session.owner);
        session.state = StreamState::Ended;
        Some(session)
    }
}

/// Stream sessions keyed by id and by owner.
///
/// One lock guards both maps; it is never held across an await.
pub struct StreamRegistry {
    max_streams: usize,
    inner: RwLock<Streams>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new(max_streams: usize) -> Self {
        Self {
            max_streams,
            inner: RwLock::new(Streams::default()),
        }
    }

    fn validate_text(field: &'static str, value: &str, max: usize) -> Result<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::validation(field, "must not be empty"));
        }
        if trimmed.chars().count() > max {
            return Err(Error::validation(field, format!("must be at most {max} characters")));
        }
        Ok(trimmed.to_string())
    }

    pub fn create_stream(
        &self,
        owner: &ConnectionId,
        title: &str,
        broadcaster_name: &str,
    ) -> Result<StreamId> {
        let title = Self::validate_text("title", title, MAX_TITLE_LENGTH)?;
        let broadcaster_name =
            Self::validate_text("broadcasterName", broadcaster_name, MAX_BROADCASTER_NAME_LENGTH)?;

        let mut streams = self.inner.write();
        if streams.owners.contains_key(owner) {
            return Err(Error::AlreadyStreaming);
        }
        if self.max_streams > 0 && streams.sessions.len() >= self.max_streams {
            return Err(Error::CapacityExceeded(format!(
                "at most {} concurrent streams",
                self.max_streams
            )));
        }

        let id = StreamId::generate();
        streams.owners.insert(owner.clone(), id.clone());
        streams.sessions.insert(
            id.clone(),
            StreamSession::new(id.clone(), owner.clone(), title, broadcaster_name),
        );

        info!(stream_id = %id, owner = %owner, "Stream created");
        Ok(id)
    }

    /// Created → Active. Returns true when the stream became publicly listed.
    pub fn start_stream(&self, id: &StreamId, owner: &ConnectionId) -> Result<bool> {
        let mut streams = self.inner.write();
        let session = streams.owned_mut(id, owner)?;
        match session.state {
            StreamState::Active => Ok(false),
            StreamState::Created => {
                session.state = StreamState::Active;
                session.started_at = Some(chrono::Utc::now());
                info!(stream_id = %id, producers = session.producers.len(), "Stream started");
                Ok(session.is_announced())
            }
            StreamState::Ended => Err(Error::NotFoundOrUnauthorized),
        }
    }

    /// Remove the session; the caller tears down its producers and transports
    pub fn stop_stream(&self, id: &StreamId, owner: &ConnectionId) -> Result<EndedStream> {
        let mut streams = self.inner.write();
        streams.owned_mut(id, owner)?;
        let session = streams.remove(id).ok_or(Error::NotFoundOrUnauthorized)?;
        info!(stream_id = %id, viewers = session.viewers.len(), "Stream stopped");
        Ok(session.into())
    }

    /// Add a viewer, returning the viewer count. Joining twice counts once.
    pub fn join_as_viewer(&self, id: &StreamId, viewer: &ConnectionId) -> Result<usize> {
        let mut streams = self.inner.write();
        let session = streams
            .sessions
            .get_mut(id)
            .ok_or(Error::NotFoundOrUnauthorized)?;
        if &session.owner == viewer {
            return Err(Error::validation(
                "streamId",
                "broadcasters cannot watch their own stream",
            ));
        }
        if session.state != StreamState::Active {
            return Err(Error::StreamNotActive);
        }
        session.viewers.insert(viewer.clone());
        Ok(session.viewers.len())
    }

    /// Remove a viewer; `None` if it was not watching
    pub fn leave_as_viewer(&self, id: &StreamId, viewer: &ConnectionId) -> Option<usize> {
        let mut streams = self.inner.write();
        let session = streams.sessions.get_mut(id)?;
        session
            .viewers
            .remove(viewer)
            .then(|| session.viewers.len())
    }

    /// Force-stop the stream a disconnecting connection owns
    pub fn handle_owner_disconnect(&self, connection_id: &ConnectionId) -> Option<EndedStream> {
        let mut streams = self.inner.write();
        let id = streams.owners.get(connection_id)?.clone();
        let session = streams.remove(&id)?;
        info!(stream_id = %id, owner = %connection_id, "Stream ended by owner disconnect");
        Some(session.into())
    }

    /// Remove a disconnecting connection from every viewer set
    pub fn handle_viewer_disconnect(&self, connection_id: &ConnectionId) -> Vec<(StreamId, usize)> {
        let mut streams = self.inner.write();
        streams
            .sessions
            .values_mut()
            .filter_map(|session| {
                session
                    .viewers
                    .remove(connection_id)
                    .then(|| (session.id.clone(), session.viewers.len()))
            })
            .collect()
    }

    /// Publicly listed streams, newest first
    #[must_use]
    pub fn list_active(&self) -> Vec<StreamSummary> {
        let streams = self.inner.read();
        let mut listed: Vec<StreamSummary> = streams
            .sessions
            .values()
            .filter(|s| s.is_announced())
            .map(StreamSession::summary)
            .collect();
        listed.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
        listed
    }

    /// Record a producer. Returns true exactly when this is the first
    /// producer of an active stream, i.e. the stream just became listed.
    pub fn add_producer(
        &self,
        id: &StreamId,
        owner: &ConnectionId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<bool> {
        let mut streams = self.inner.write();
        let session = streams.owned_mut(id, owner)?;
        let was_announced = session.is_announced();
        session.producers.insert(producer_id, kind);
        debug!(stream_id = %id, %kind, producers = session.producers.len(), "Producer added");
        Ok(!was_announced && session.is_announced())
    }

    /// Forget producers. Returns true when the stream dropped out of the listing.
    pub fn remove_producers(&self, id: &StreamId, producers: &[ProducerId]) -> bool {
        let mut streams = self.inner.write();
        let Some(session) = streams.sessions.get_mut(id) else {
            return false;
        };
        let was_announced = session.is_announced();
        for producer_id in producers {
            session.producers.remove(producer_id);
        }
        was_announced && !session.is_announced()
    }

    pub fn set_producer_transport(
        &self,
        id: &StreamId,
        owner: &ConnectionId,
        transport_id: TransportId,
    ) -> Result<()> {
        let mut streams = self.inner.write();
        streams.owned_mut(id, owner)?.producer_transport_id = Some(transport_id);
        Ok(())
    }

    /// Clear the producer transport if it is still `transport_id`
    pub fn clear_producer_transport(&self, id: &StreamId, transport_id: &TransportId) {
        let mut streams = self.inner.write();
        if let Some(session) = streams.sessions.get_mut(id) {
            if session.producer_transport_id.as_ref() == Some(transport_id) {
                session.producer_transport_id = None;
            }
        }
    }

    /// Fail with the uniform not-found error unless `caller` owns the stream
    pub fn require_owner(&self, id: &StreamId, caller: &ConnectionId) -> Result<()> {
        if self.owner_of(id).as_ref() == Some(caller) {
            Ok(())
        } else {
            Err(Error::NotFoundOrUnauthorized)
        }
    }

    #[must_use]
    pub fn get(&self, id: &StreamId) -> Option<StreamSession> {
        self.inner.read().sessions.get(id).cloned()
    }

    #[must_use]
    pub fn exists(&self, id: &StreamId) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    #[must_use]
    pub fn owner_of(&self, id: &StreamId) -> Option<ConnectionId> {
        self.inner.read().sessions.get(id).map(|s| s.owner.clone())
    }

    #[must_use]
    pub fn stream_owned_by(&self, connection_id: &ConnectionId) -> Option<StreamId> {
        self.inner.read().owners.get(connection_id).cloned()
    }

    #[must_use]
    pub fn state_of(&self, id: &StreamId) -> Option<StreamState> {
        self.inner.read().sessions.get(id).map(|s| s.state)
    }

    #[must_use]
    pub fn producers_of(&self, id: &StreamId) -> Vec<ProducerId> {
        self.inner
            .read()
            .sessions
            .get(id)
            .map(|s| s.producers.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn viewer_count(&self, id: &StreamId) -> Option<usize> {
        self.inner.read().sessions.get(id).map(|s| s.viewers.len())
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.read().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    fn live_stream(registry: &StreamRegistry, owner: &ConnectionId) -> StreamId {
        let id = registry.create_stream(owner, "Title", "Alice").unwrap();
        registry.start_stream(&id, owner).unwrap();
        registry
            .add_producer(&id, owner, ProducerId::from(format!("{id}-video")), MediaKind::Video)
            .unwrap();
        id
    }

    #[test]
    fn test_create_validates_input() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");

        let err = registry.create_stream(&owner, "   ", "Alice").unwrap_err();
        assert!(matches!(err, Error::Validation { field: "title", .. }));

        let long_name = "n".repeat(51);
        let err = registry.create_stream(&owner, "Title", &long_name).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "broadcasterName", .. }));

        let id = registry.create_stream(&owner, "  Title  ", "Alice").unwrap();
        assert_eq!(registry.get(&id).unwrap().title, "Title");
    }

    #[test]
    fn test_one_stream_per_owner() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = registry.create_stream(&owner, "Title", "Alice").unwrap();
        assert_eq!(
            registry.create_stream(&owner, "Other", "Alice").unwrap_err(),
            Error::AlreadyStreaming
        );

        registry.stop_stream(&id, &owner).unwrap();
        assert!(registry.create_stream(&owner, "Again", "Alice").is_ok());
    }

    #[test]
    fn test_owner_disconnect_frees_owner() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = live_stream(&registry, &owner);
        registry.join_as_viewer(&id, &conn("v")).unwrap();

        let ended = registry.handle_owner_disconnect(&owner).unwrap();
        assert_eq!(ended.id, id);
        assert_eq!(ended.producers.len(), 1);
        assert_eq!(ended.viewers, vec![conn("v")]);
        assert!(registry.list_active().is_empty());
        assert!(registry.handle_owner_disconnect(&owner).is_none());
        assert!(registry.create_stream(&owner, "Again", "Alice").is_ok());
    }

    #[test]
    fn test_capacity() {
        let registry = StreamRegistry::new(1);
        registry.create_stream(&conn("a"), "Title", "Alice").unwrap();
        assert!(matches!(
            registry.create_stream(&conn("b"), "Title", "Bob"),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_start_requires_owner_and_is_idempotent() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = registry.create_stream(&owner, "Title", "Alice").unwrap();

        assert_eq!(
            registry.start_stream(&id, &conn("b")).unwrap_err(),
            Error::NotFoundOrUnauthorized
        );
        assert_eq!(
            registry.start_stream(&StreamId::from("nope"), &owner).unwrap_err(),
            Error::NotFoundOrUnauthorized
        );
        assert!(!registry.start_stream(&id, &owner).unwrap());
        assert!(!registry.start_stream(&id, &owner).unwrap());
        assert_eq!(registry.state_of(&id), Some(StreamState::Active));
    }

    #[test]
    fn test_listing_requires_active_and_producer() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = registry.create_stream(&owner, "Title", "Alice").unwrap();

        // producer before start: announced by start itself
        assert!(!registry
            .add_producer(&id, &owner, ProducerId::from("p1"), MediaKind::Audio)
            .unwrap());
        assert!(registry.list_active().is_empty());
        assert!(registry.start_stream(&id, &owner).unwrap());
        assert_eq!(registry.list_active().len(), 1);

        // second producer does not re-announce
        assert!(!registry
            .add_producer(&id, &owner, ProducerId::from("p2"), MediaKind::Video)
            .unwrap());

        assert!(!registry.remove_producers(&id, &[ProducerId::from("p1")]));
        assert!(registry.remove_producers(&id, &[ProducerId::from("p2")]));
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_first_producer_announces() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = registry.create_stream(&owner, "Title", "Alice").unwrap();
        registry.start_stream(&id, &owner).unwrap();
        assert!(registry.list_active().is_empty());

        assert!(registry
            .add_producer(&id, &owner, ProducerId::from("p1"), MediaKind::Video)
            .unwrap());
        let listed = registry.list_active();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].viewer_count, 0);
    }

    #[test]
    fn test_viewers_have_set_semantics() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = live_stream(&registry, &owner);

        assert_eq!(registry.join_as_viewer(&id, &conn("v")).unwrap(), 1);
        assert_eq!(registry.join_as_viewer(&id, &conn("v")).unwrap(), 1);
        assert_eq!(registry.join_as_viewer(&id, &conn("w")).unwrap(), 2);

        assert_eq!(registry.leave_as_viewer(&id, &conn("v")), Some(1));
        assert_eq!(registry.leave_as_viewer(&id, &conn("v")), None);
    }

    #[test]
    fn test_join_rules() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = registry.create_stream(&owner, "Title", "Alice").unwrap();

        assert_eq!(
            registry.join_as_viewer(&id, &conn("v")).unwrap_err(),
            Error::StreamNotActive
        );
        assert!(matches!(
            registry.join_as_viewer(&id, &owner),
            Err(Error::Validation { .. })
        ));
        assert_eq!(
            registry.join_as_viewer(&StreamId::from("nope"), &conn("v")).unwrap_err(),
            Error::NotFoundOrUnauthorized
        );
    }

    #[test]
    fn test_viewer_disconnect_touches_every_stream() {
        let registry = StreamRegistry::new(0);
        let s1 = live_stream(&registry, &conn("a"));
        let s2 = live_stream(&registry, &conn("b"));
        let viewer = conn("v");
        registry.join_as_viewer(&s1, &viewer).unwrap();
        registry.join_as_viewer(&s2, &viewer).unwrap();

        let mut affected = registry.handle_viewer_disconnect(&viewer);
        affected.sort();
        let mut expected = vec![(s1, 0), (s2, 0)];
        expected.sort();
        assert_eq!(affected, expected);
        assert!(registry.handle_viewer_disconnect(&viewer).is_empty());
    }

    #[test]
    fn test_producer_transport_binding() {
        let registry = StreamRegistry::new(0);
        let owner = conn("a");
        let id = registry.create_stream(&owner, "Title", "Alice").unwrap();
        let t1 = TransportId::from("t1");

        registry.set_producer_transport(&id, &owner, t1.clone()).unwrap();
        registry.clear_producer_transport(&id, &TransportId::from("other"));
        assert_eq!(registry.get(&id).unwrap().producer_transport_id, Some(t1.clone()));
        registry.clear_producer_transport(&id, &t1);
        assert_eq!(registry.get(&id).unwrap().producer_transport_id, None);
    }
}
