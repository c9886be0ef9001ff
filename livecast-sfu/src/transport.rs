//! Transport registry
//!
//! Owns every transport handed out to clients, the producers registered on
//! producer transports and the consumers attached to consumer transports.
//!
//! No map guard is ever held across an engine call. After each await the
//! registry re-checks that the transport (or its owning connection) still
//! exists; if a disconnect tore it down in the meantime, the engine object
//! that was just created is closed again and the call fails with
//! [`TransportError::NotFound`].

use crate::config::SfuConfig;
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, EngineError, EngineEvent, MediaEngine, RtpCapabilities,
    RtpParameters, TransportOptions, TransportRole,
};
use crate::error::{Result, TransportError};
use crate::track::MediaKind;
use crate::types::{ConnectionId, ConsumerId, ProducerId, StreamId, TransportId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::dtls_transport::dtls_transport_state::RTCDtlsTransportState;

/// Negotiation state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Created, DTLS parameters not yet supplied
    New,
    /// Remote DTLS parameters accepted by the engine
    Connected,
}

/// A consumer attached to a consumer transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerEntry {
    pub descriptor: ConsumerDescriptor,
    pub paused: bool,
}

/// Registry view of one transport
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub id: TransportId,
    pub owner: ConnectionId,
    pub stream_id: StreamId,
    pub role: TransportRole,
    pub state: TransportState,
    /// Producers registered on this transport (producer transports only)
    pub producers: Vec<ProducerId>,
    /// Consumers attached to this transport (consumer transports only)
    pub consumers: Vec<ConsumerEntry>,
    pub created_at: DateTime<Utc>,
}

impl TransportHandle {
    fn new(id: TransportId, owner: ConnectionId, stream_id: StreamId, role: TransportRole) -> Self {
        Self {
            id,
            owner,
            stream_id,
            role,
            state: TransportState::New,
            producers: Vec::new(),
            consumers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn consumer_for(&self, producer_id: &ProducerId) -> Option<&ConsumerEntry> {
        self.consumers
            .iter()
            .find(|c| &c.descriptor.producer_id == producer_id)
    }
}

/// What a close released, so callers can fix up stream state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedTransport {
    pub id: TransportId,
    pub owner: ConnectionId,
    pub stream_id: StreamId,
    pub role: TransportRole,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

impl From<TransportHandle> for ClosedTransport {
    fn from(handle: TransportHandle) -> Self {
        Self {
            id: handle.id,
            owner: handle.owner,
            stream_id: handle.stream_id,
            role: handle.role,
            producers: handle.producers,
            consumers: handle
                .consumers
                .into_iter()
                .map(|c| c.descriptor.consumer_id)
                .collect(),
        }
    }
}

/// Result of creating a producer transport
#[derive(Debug, Clone)]
pub struct CreatedTransport {
    pub options: TransportOptions,
    /// Previous producer transport of the same stream, closed by the replacement
    pub replaced: Option<ClosedTransport>,
}

/// Registry of transports, keyed by id, by stream and by owning connection
pub struct TransportRegistry {
    engine: Arc<dyn MediaEngine>,
    max_transports_per_connection: usize,
    transports: DashMap<TransportId, TransportHandle>,
    producer_transports: DashMap<StreamId, TransportId>,
    /// Open connections and the transports each one owns
    connections: DashMap<ConnectionId, HashSet<TransportId>>,
}

impl TransportRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, config: &SfuConfig) -> Self {
        Self {
            engine,
            max_transports_per_connection: config.max_transports_per_connection,
            transports: DashMap::new(),
            producer_transports: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Start tracking a connection. Transports can only be created for open connections.
    pub fn open_connection(&self, connection_id: &ConnectionId) {
        self.connections.entry(connection_id.clone()).or_default();
    }

    #[must_use]
    pub fn is_connection_open(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Create the producer transport of a stream, replacing any previous one.
    pub async fn create_producer_transport(
        &self,
        stream_id: &StreamId,
        owner: &ConnectionId,
    ) -> Result<CreatedTransport> {
        // the slot of the transport being replaced is reused, not added
        let replacing = self
            .producer_transports
            .get(stream_id)
            .map(|id| id.value().clone());
        let options = self
            .create_transport(stream_id, owner, TransportRole::Producer, replacing.as_ref())
            .await?;

        let previous = self
            .producer_transports
            .insert(stream_id.clone(), options.id.clone());

        // a disconnect may have swept the new transport before the binding landed
        if !self.transports.contains_key(&options.id) {
            self.producer_transports
                .remove_if(stream_id, |_, id| id == &options.id);
            return Err(TransportError::NotFound);
        }

        let replaced = match previous {
            Some(previous) if previous != options.id => self.close_transport(&previous).await,
            _ => None,
        };
        if let Some(replaced) = &replaced {
            info!(
                stream_id = %stream_id,
                old_transport_id = %replaced.id,
                new_transport_id = %options.id,
                "Replaced producer transport"
            );
        }

        Ok(CreatedTransport { options, replaced })
    }

    pub async fn create_consumer_transport(
        &self,
        stream_id: &StreamId,
        viewer: &ConnectionId,
    ) -> Result<TransportOptions> {
        self.create_transport(stream_id, viewer, TransportRole::Consumer, None)
            .await
    }

    async fn create_transport(
        &self,
        stream_id: &StreamId,
        owner: &ConnectionId,
        role: TransportRole,
        replacing: Option<&TransportId>,
    ) -> Result<TransportOptions> {
        self.check_capacity(owner, replacing)?;

        let options = self.engine.create_transport(role).await?;

        let registered = match self.connections.get_mut(owner) {
            Some(mut owned) => {
                owned.insert(options.id.clone());
                self.transports.insert(
                    options.id.clone(),
                    TransportHandle::new(options.id.clone(), owner.clone(), stream_id.clone(), role),
                );
                true
            }
            None => false,
        };

        if !registered {
            warn!(
                connection_id = %owner,
                transport_id = %options.id,
                "Connection closed while transport was being created"
            );
            self.engine.close_transport(&options.id).await;
            return Err(TransportError::NotFound);
        }

        debug!(
            connection_id = %owner,
            stream_id = %stream_id,
            transport_id = %options.id,
            ?role,
            "Transport created"
        );
        Ok(options)
    }

    fn check_capacity(&self, owner: &ConnectionId, replacing: Option<&TransportId>) -> Result<()> {
        let owned = self.connections.get(owner).ok_or(TransportError::NotFound)?;
        let limit = self.max_transports_per_connection;
        let in_use = owned.len() - usize::from(replacing.is_some_and(|id| owned.contains(id)));
        if limit > 0 && in_use >= limit {
            warn!(
                connection_id = %owner,
                transports = in_use,
                limit,
                "Transport limit reached"
            );
            return Err(TransportError::LimitReached { limit });
        }
        Ok(())
    }

    /// Copy of a transport the caller owns, optionally checking its role
    fn owned_by(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
        role: Option<TransportRole>,
    ) -> Result<TransportHandle> {
        let handle = self
            .transports
            .get(transport_id)
            .ok_or(TransportError::NotFound)?;
        if &handle.owner != caller || role.is_some_and(|r| r != handle.role) {
            return Err(TransportError::NotFound);
        }
        Ok(handle.clone())
    }

    /// Hand the remote DTLS parameters to the engine. Repeated calls are no-ops.
    pub async fn connect(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        let handle = self.owned_by(transport_id, caller, None)?;
        if handle.state == TransportState::Connected {
            debug!(transport_id = %transport_id, "Transport already connected");
            return Ok(());
        }

        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;

        let mut handle = self
            .transports
            .get_mut(transport_id)
            .ok_or(TransportError::NotFound)?;
        handle.state = TransportState::Connected;
        debug!(transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Register a producer on a producer transport
    pub async fn register_producer(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId> {
        self.owned_by(transport_id, caller, Some(TransportRole::Producer))?;

        let producer_id = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        let attached = self
            .transports
            .get_mut(transport_id)
            .map(|mut handle| handle.producers.push(producer_id.clone()))
            .is_some();
        if !attached {
            warn!(
                transport_id = %transport_id,
                producer_id = %producer_id,
                "Transport closed while producer was being created"
            );
            self.engine.close_producer(&producer_id).await;
            return Err(TransportError::NotFound);
        }

        info!(
            transport_id = %transport_id,
            producer_id = %producer_id,
            %kind,
            "Producer registered"
        );
        Ok(producer_id)
    }

    /// Create paused consumers for every producer the receiver can decode.
    ///
    /// Producers the receiver cannot decode are skipped; the batch only fails
    /// when nothing at all can be consumed. Producers already consumed on this
    /// transport yield their existing descriptor.
    pub async fn create_consumers(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
        producers: &[ProducerId],
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Vec<ConsumerDescriptor>> {
        let handle = self.owned_by(transport_id, caller, Some(TransportRole::Consumer))?;
        let mut descriptors: Vec<ConsumerDescriptor> = Vec::with_capacity(producers.len());

        for producer_id in producers {
            if descriptors.iter().any(|d| &d.producer_id == producer_id) {
                continue;
            }
            if let Some(existing) = handle.consumer_for(producer_id) {
                descriptors.push(existing.descriptor.clone());
                continue;
            }
            if !self.engine.can_consume(producer_id, rtp_capabilities) {
                debug!(
                    transport_id = %transport_id,
                    producer_id = %producer_id,
                    "Skipping producer the receiver cannot decode"
                );
                continue;
            }

            let descriptor = match self
                .engine
                .consume(transport_id, producer_id, rtp_capabilities)
                .await
            {
                Ok(descriptor) => descriptor,
                Err(EngineError::Incompatible(_)) => {
                    debug!(producer_id = %producer_id, "Engine refused incompatible producer");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let attached = self
                .transports
                .get_mut(transport_id)
                .map(|mut handle| {
                    handle.consumers.push(ConsumerEntry {
                        descriptor: descriptor.clone(),
                        paused: true,
                    });
                })
                .is_some();
            if !attached {
                warn!(
                    transport_id = %transport_id,
                    consumer_id = %descriptor.consumer_id,
                    "Transport closed while consumer was being created"
                );
                self.engine.close_transport(transport_id).await;
                return Err(TransportError::NotFound);
            }
            descriptors.push(descriptor);
        }

        if descriptors.is_empty() {
            return Err(TransportError::NoCompatibleProducers);
        }

        debug!(
            transport_id = %transport_id,
            consumers = descriptors.len(),
            requested = producers.len(),
            "Consumers ready"
        );
        Ok(descriptors)
    }

    /// Resume every paused consumer on the transport, returning how many were resumed
    pub async fn resume_consumers(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
    ) -> Result<usize> {
        self.set_consumers_paused(transport_id, caller, false).await
    }

    /// Pause every running consumer on the transport
    pub async fn pause_consumers(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
    ) -> Result<usize> {
        self.set_consumers_paused(transport_id, caller, true).await
    }

    async fn set_consumers_paused(
        &self,
        transport_id: &TransportId,
        caller: &ConnectionId,
        paused: bool,
    ) -> Result<usize> {
        let handle = self.owned_by(transport_id, caller, Some(TransportRole::Consumer))?;
        let pending: Vec<ConsumerId> = handle
            .consumers
            .iter()
            .filter(|c| c.paused != paused)
            .map(|c| c.descriptor.consumer_id.clone())
            .collect();

        let mut changed = 0;
        for consumer_id in pending {
            let outcome = if paused {
                self.engine.pause_consumer(&consumer_id).await
            } else {
                self.engine.resume_consumer(&consumer_id).await
            };

            let mut handle = self
                .transports
                .get_mut(transport_id)
                .ok_or(TransportError::NotFound)?;
            match outcome {
                Ok(()) => {
                    if let Some(entry) = handle
                        .consumers
                        .iter_mut()
                        .find(|c| c.descriptor.consumer_id == consumer_id)
                    {
                        entry.paused = paused;
                        changed += 1;
                    }
                }
                // closed together with its producer
                Err(EngineError::UnknownConsumer(_)) => {
                    handle
                        .consumers
                        .retain(|c| c.descriptor.consumer_id != consumer_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(transport_id = %transport_id, paused, changed, "Consumers updated");
        Ok(changed)
    }

    /// Close a transport and everything attached to it. Unknown ids are a no-op.
    pub async fn close_transport(&self, transport_id: &TransportId) -> Option<ClosedTransport> {
        let (_, handle) = self.transports.remove(transport_id)?;

        if let Some(mut owned) = self.connections.get_mut(&handle.owner) {
            owned.remove(transport_id);
        }
        if handle.role == TransportRole::Producer {
            self.producer_transports
                .remove_if(&handle.stream_id, |_, id| id == transport_id);
            self.detach_producers(&handle.producers);
        }

        self.engine.close_transport(transport_id).await;

        info!(
            transport_id = %transport_id,
            connection_id = %handle.owner,
            stream_id = %handle.stream_id,
            role = ?handle.role,
            producers = handle.producers.len(),
            consumers = handle.consumers.len(),
            "Transport closed"
        );
        Some(handle.into())
    }

    /// Drop consumer entries whose producer no longer exists
    fn detach_producers(&self, producers: &[ProducerId]) {
        if producers.is_empty() {
            return;
        }
        for mut handle in self.transports.iter_mut() {
            handle
                .consumers
                .retain(|c| !producers.contains(&c.descriptor.producer_id));
        }
    }

    /// Close every transport a connection created and forget the connection
    pub async fn close_connection_transports(
        &self,
        connection_id: &ConnectionId,
    ) -> Vec<ClosedTransport> {
        let owned = self
            .connections
            .remove(connection_id)
            .map(|(_, owned)| owned)
            .unwrap_or_default();

        let mut closed = Vec::with_capacity(owned.len());
        for transport_id in owned {
            if let Some(transport) = self.close_transport(&transport_id).await {
                closed.push(transport);
            }
        }
        closed
    }

    /// Close every transport bound to a stream, producer and consumer side alike
    pub async fn close_stream_transports(&self, stream_id: &StreamId) -> Vec<ClosedTransport> {
        let ids: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|t| &t.stream_id == stream_id)
            .map(|t| t.id.clone())
            .collect();
        self.close_all(ids).await
    }

    /// Close the consumer transports one viewer holds for a stream
    pub async fn close_viewer_transports(
        &self,
        stream_id: &StreamId,
        viewer: &ConnectionId,
    ) -> Vec<ClosedTransport> {
        let ids: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|t| {
                &t.stream_id == stream_id
                    && &t.owner == viewer
                    && t.role == TransportRole::Consumer
            })
            .map(|t| t.id.clone())
            .collect();
        self.close_all(ids).await
    }

    async fn close_all(&self, ids: Vec<TransportId>) -> Vec<ClosedTransport> {
        let mut closed = Vec::with_capacity(ids.len());
        for transport_id in ids {
            if let Some(transport) = self.close_transport(&transport_id).await {
                closed.push(transport);
            }
        }
        closed
    }

    /// Apply an engine state report. Terminal states close the transport.
    pub async fn handle_engine_event(&self, event: &EngineEvent) -> Option<ClosedTransport> {
        let transport_id = event.transport_id();
        if event.is_terminal() {
            warn!(transport_id = %transport_id, ?event, "Transport reached terminal state");
            return self.close_transport(transport_id).await;
        }

        if let EngineEvent::DtlsStateChanged {
            state: RTCDtlsTransportState::Connected,
            ..
        } = event
        {
            if let Some(mut handle) = self.transports.get_mut(transport_id) {
                handle.state = TransportState::Connected;
            }
        }
        debug!(transport_id = %transport_id, ?event, "Transport state changed");
        None
    }

    #[must_use]
    pub fn get(&self, transport_id: &TransportId) -> Option<TransportHandle> {
        self.transports.get(transport_id).map(|t| t.clone())
    }

    #[must_use]
    pub fn producer_transport_of(&self, stream_id: &StreamId) -> Option<TransportId> {
        self.producer_transports.get(stream_id).map(|t| t.clone())
    }

    #[must_use]
    pub fn connection_transports(&self, connection_id: &ConnectionId) -> Vec<TransportId> {
        self.connections
            .get(connection_id)
            .map(|owned| owned.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.transports.iter().map(|t| t.consumers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockMediaEngine;
    use crate::local::LocalMediaEngine;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::{broadcast, Notify};
    use webrtc::ice_transport::ice_transport_state::RTCIceTransportState;

    fn dtls() -> Value {
        json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }] })
    }

    fn rtp(mime_type: &str) -> Value {
        json!({ "codecs": [{ "mimeType": mime_type, "clockRate": 90000 }] })
    }

    fn caps(mime_types: &[&str]) -> Value {
        let codecs: Vec<Value> = mime_types.iter().map(|m| json!({ "mimeType": m })).collect();
        json!({ "codecs": codecs })
    }

    fn setup() -> (Arc<LocalMediaEngine>, TransportRegistry) {
        let engine = Arc::new(LocalMediaEngine::new(Arc::new(SfuConfig::default())));
        let registry = TransportRegistry::new(engine.clone(), &SfuConfig::default());
        (engine, registry)
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    /// Broadcaster with an audio and a video producer on stream `s1`
    async fn broadcasting(registry: &TransportRegistry) -> (TransportId, ProducerId, ProducerId) {
        let owner = conn("owner");
        registry.open_connection(&owner);
        let created = registry
            .create_producer_transport(&StreamId::from("s1"), &owner)
            .await
            .unwrap();
        let id = created.options.id;
        registry.connect(&id, &owner, &dtls()).await.unwrap();
        let audio = registry
            .register_producer(&id, &owner, MediaKind::Audio, &rtp("audio/opus"))
            .await
            .unwrap();
        let video = registry
            .register_producer(&id, &owner, MediaKind::Video, &rtp("video/VP8"))
            .await
            .unwrap();
        (id, audio, video)
    }

    #[tokio::test]
    async fn test_requires_open_connection() {
        let (_, registry) = setup();
        let result = registry
            .create_consumer_transport(&StreamId::from("s1"), &conn("ghost"))
            .await;
        assert_eq!(result.unwrap_err(), TransportError::NotFound);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_owner_checked() {
        let (_, registry) = setup();
        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        let options = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();

        registry.connect(&options.id, &viewer, &dtls()).await.unwrap();
        registry.connect(&options.id, &viewer, &dtls()).await.unwrap();
        assert_eq!(
            registry.get(&options.id).unwrap().state,
            TransportState::Connected
        );

        let err = registry
            .connect(&options.id, &conn("intruder"), &dtls())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotFound);

        let err = registry
            .connect(&TransportId::from("missing"), &viewer, &dtls())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotFound);
    }

    #[tokio::test]
    async fn test_consume_skips_undecodable_producers() {
        let (engine, registry) = setup();
        let (_, audio, video) = broadcasting(&registry).await;

        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        let options = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();

        let consumers = registry
            .create_consumers(
                &options.id,
                &viewer,
                &[audio.clone(), video.clone()],
                &caps(&["video/VP8"]),
            )
            .await
            .unwrap();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].producer_id, video);
        assert_eq!(consumers[0].kind, MediaKind::Video);
        assert_eq!(
            engine.is_consumer_paused(&consumers[0].consumer_id),
            Some(true)
        );

        // asking again hands back the same consumer
        let again = registry
            .create_consumers(&options.id, &viewer, &[audio, video], &caps(&["video/VP8"]))
            .await
            .unwrap();
        assert_eq!(again, consumers);
        assert_eq!(registry.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_fails_only_when_nothing_matches() {
        let (_, registry) = setup();
        let (_, audio, video) = broadcasting(&registry).await;

        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        let options = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();

        let err = registry
            .create_consumers(&options.id, &viewer, &[audio, video], &caps(&["video/AV1"]))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoCompatibleProducers);
    }

    #[tokio::test]
    async fn test_resume_consumers() {
        let (engine, registry) = setup();
        let (_, audio, video) = broadcasting(&registry).await;

        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        let options = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();
        let consumers = registry
            .create_consumers(
                &options.id,
                &viewer,
                &[audio, video],
                &caps(&["audio/opus", "video/VP8"]),
            )
            .await
            .unwrap();
        assert_eq!(consumers.len(), 2);

        assert_eq!(registry.resume_consumers(&options.id, &viewer).await.unwrap(), 2);
        assert_eq!(registry.resume_consumers(&options.id, &viewer).await.unwrap(), 0);
        for consumer in &consumers {
            assert_eq!(engine.is_consumer_paused(&consumer.consumer_id), Some(false));
        }

        assert_eq!(registry.pause_consumers(&options.id, &viewer).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replacing_producer_transport_closes_previous() {
        let (engine, registry) = setup();
        let (first, audio, video) = broadcasting(&registry).await;

        let created = registry
            .create_producer_transport(&StreamId::from("s1"), &conn("owner"))
            .await
            .unwrap();
        let replaced = created.replaced.unwrap();
        assert_eq!(replaced.id, first);
        assert_eq!(replaced.producers, vec![audio, video]);
        assert!(registry.get(&first).is_none());
        assert_eq!(
            registry.producer_transport_of(&StreamId::from("s1")),
            Some(created.options.id)
        );
        assert_eq!(engine.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_closing_producer_transport_detaches_consumers() {
        let (_, registry) = setup();
        let (producer_transport, _, video) = broadcasting(&registry).await;

        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        let options = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();
        registry
            .create_consumers(&options.id, &viewer, &[video], &caps(&["video/VP8"]))
            .await
            .unwrap();

        let closed = registry.close_transport(&producer_transport).await.unwrap();
        assert_eq!(closed.producers.len(), 2);
        assert!(registry.close_transport(&producer_transport).await.is_none());
        assert!(registry.get(&options.id).unwrap().consumers.is_empty());
        assert!(registry.producer_transport_of(&StreamId::from("s1")).is_none());
    }

    #[tokio::test]
    async fn test_close_connection_transports_sweeps_all_roles() {
        let (engine, registry) = setup();
        let (_, _, video) = broadcasting(&registry).await;
        let owner = conn("owner");

        // the broadcaster also watches another stream
        let options = registry
            .create_consumer_transport(&StreamId::from("s2"), &owner)
            .await
            .unwrap();
        registry
            .create_consumers(&options.id, &owner, &[video], &caps(&["video/VP8"]))
            .await
            .unwrap();

        let closed = registry.close_connection_transports(&owner).await;
        assert_eq!(closed.len(), 2);
        assert_eq!(registry.transport_count(), 0);
        assert_eq!(engine.transport_count(), 0);
        assert!(!registry.is_connection_open(&owner));

        assert!(registry.close_connection_transports(&owner).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_viewer_transports_only_touches_that_viewer() {
        let (_, registry) = setup();
        broadcasting(&registry).await;
        let stream = StreamId::from("s1");
        let (a, b) = (conn("a"), conn("b"));
        registry.open_connection(&a);
        registry.open_connection(&b);
        registry.create_consumer_transport(&stream, &a).await.unwrap();
        let kept = registry.create_consumer_transport(&stream, &b).await.unwrap();

        let closed = registry.close_viewer_transports(&stream, &a).await;
        assert_eq!(closed.len(), 1);
        assert!(registry.get(&kept.id).is_some());
        assert!(registry.connection_transports(&a).is_empty());
    }

    #[tokio::test]
    async fn test_transport_limit() {
        let engine = Arc::new(LocalMediaEngine::new(Arc::new(SfuConfig::default())));
        let config = SfuConfig {
            max_transports_per_connection: 1,
            ..Default::default()
        };
        let registry = TransportRegistry::new(engine, &config);
        let viewer = conn("viewer");
        registry.open_connection(&viewer);

        registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();
        let err = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::LimitReached { limit: 1 });
    }

    #[tokio::test]
    async fn test_replacing_producer_transport_reuses_its_slot() {
        let engine = Arc::new(LocalMediaEngine::new(Arc::new(SfuConfig::default())));
        let config = SfuConfig {
            max_transports_per_connection: 1,
            ..Default::default()
        };
        let registry = TransportRegistry::new(engine.clone(), &config);
        let owner = conn("owner");
        registry.open_connection(&owner);
        let stream_id = StreamId::from("s1");

        let first = registry
            .create_producer_transport(&stream_id, &owner)
            .await
            .unwrap();
        let second = registry
            .create_producer_transport(&stream_id, &owner)
            .await
            .unwrap();
        assert_eq!(second.replaced.unwrap().id, first.options.id);
        assert_eq!(registry.transport_count(), 1);
        assert_eq!(engine.transport_count(), 1);

        let err = registry
            .create_consumer_transport(&stream_id, &owner)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::LimitReached { limit: 1 });
    }

    #[tokio::test]
    async fn test_terminal_engine_event_closes_transport() {
        let (_, registry) = setup();
        let (id, _, _) = broadcasting(&registry).await;

        let disconnected = EngineEvent::IceStateChanged {
            transport_id: id.clone(),
            state: RTCIceTransportState::Disconnected,
        };
        assert!(registry.handle_engine_event(&disconnected).await.is_none());
        assert!(registry.get(&id).is_some());

        let failed = EngineEvent::DtlsStateChanged {
            transport_id: id.clone(),
            state: RTCDtlsTransportState::Failed,
        };
        let closed = registry.handle_engine_event(&failed).await.unwrap();
        assert_eq!(closed.role, TransportRole::Producer);
        assert!(registry.get(&id).is_none());
        assert!(registry.handle_engine_event(&failed).await.is_none());
    }

    #[tokio::test]
    async fn test_engine_failure_is_surfaced() {
        let mut engine = MockMediaEngine::new();
        engine.expect_create_transport().returning(|_| {
            Ok(TransportOptions {
                id: TransportId::from("t1"),
                ice_parameters: json!({}),
                ice_candidates: vec![],
                dtls_parameters: json!({}),
            })
        });
        engine
            .expect_connect_transport()
            .returning(|_, _| Err(EngineError::Failure("dtls handshake setup failed".into())));

        let registry = TransportRegistry::new(Arc::new(engine), &SfuConfig::default());
        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        let options = registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();

        let err = registry.connect(&options.id, &viewer, &dtls()).await.unwrap_err();
        assert!(matches!(err, TransportError::Engine(EngineError::Failure(_))));
        assert_eq!(registry.get(&options.id).unwrap().state, TransportState::New);
    }

    #[tokio::test]
    async fn test_incompatible_consume_error_skips_producer() {
        let mut engine = MockMediaEngine::new();
        engine.expect_create_transport().returning(|_| {
            Ok(TransportOptions {
                id: TransportId::from("t1"),
                ice_parameters: json!({}),
                ice_candidates: vec![],
                dtls_parameters: json!({}),
            })
        });
        engine.expect_can_consume().returning(|_, _| true);
        engine.expect_consume().returning(|_, producer_id, _| {
            if producer_id.as_str() == "audio" {
                Err(EngineError::Incompatible(producer_id.clone()))
            } else {
                Ok(ConsumerDescriptor {
                    consumer_id: ConsumerId::from("c-video"),
                    producer_id: producer_id.clone(),
                    kind: MediaKind::Video,
                    rtp_parameters: json!({}),
                })
            }
        });

        let registry = TransportRegistry::new(Arc::new(engine), &SfuConfig::default());
        let viewer = conn("viewer");
        registry.open_connection(&viewer);
        registry
            .create_consumer_transport(&StreamId::from("s1"), &viewer)
            .await
            .unwrap();

        let consumers = registry
            .create_consumers(
                &TransportId::from("t1"),
                &viewer,
                &[ProducerId::from("audio"), ProducerId::from("video")],
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].consumer_id.as_str(), "c-video");
    }

    /// Engine whose transport creation blocks until released
    struct GatedEngine {
        inner: LocalMediaEngine,
        gate: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl MediaEngine for GatedEngine {
        fn router_capabilities(&self) -> RtpCapabilities {
            self.inner.router_capabilities()
        }

        async fn create_transport(
            &self,
            role: TransportRole,
        ) -> std::result::Result<TransportOptions, EngineError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.create_transport(role).await
        }

        async fn connect_transport(
            &self,
            transport_id: &TransportId,
            dtls_parameters: &DtlsParameters,
        ) -> std::result::Result<(), EngineError> {
            self.inner.connect_transport(transport_id, dtls_parameters).await
        }

        async fn produce(
            &self,
            transport_id: &TransportId,
            kind: MediaKind,
            rtp_parameters: &RtpParameters,
        ) -> std::result::Result<ProducerId, EngineError> {
            self.inner.produce(transport_id, kind, rtp_parameters).await
        }

        fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
            self.inner.can_consume(producer_id, rtp_capabilities)
        }

        async fn consume(
            &self,
            transport_id: &TransportId,
            producer_id: &ProducerId,
            rtp_capabilities: &RtpCapabilities,
        ) -> std::result::Result<ConsumerDescriptor, EngineError> {
            self.inner.consume(transport_id, producer_id, rtp_capabilities).await
        }

        async fn resume_consumer(&self, consumer_id: &ConsumerId) -> std::result::Result<(), EngineError> {
            self.inner.resume_consumer(consumer_id).await
        }

        async fn pause_consumer(&self, consumer_id: &ConsumerId) -> std::result::Result<(), EngineError> {
            self.inner.pause_consumer(consumer_id).await
        }

        async fn close_producer(&self, producer_id: &ProducerId) {
            self.inner.close_producer(producer_id).await;
        }

        async fn close_transport(&self, transport_id: &TransportId) {
            self.inner.close_transport(transport_id).await;
        }

        fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
            self.inner.subscribe_events()
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_creation_closes_engine_transport() {
        let engine = Arc::new(GatedEngine {
            inner: LocalMediaEngine::new(Arc::new(SfuConfig::default())),
            gate: Notify::new(),
            entered: Notify::new(),
        });
        let registry = Arc::new(TransportRegistry::new(engine.clone(), &SfuConfig::default()));
        let viewer = conn("viewer");
        registry.open_connection(&viewer);

        let pending = {
            let registry = registry.clone();
            let viewer = viewer.clone();
            tokio::spawn(async move {
                registry
                    .create_consumer_transport(&StreamId::from("s1"), &viewer)
                    .await
            })
        };

        engine.entered.notified().await;
        registry.close_connection_transports(&viewer).await;
        engine.gate.notify_one();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), TransportError::NotFound);
        assert_eq!(registry.transport_count(), 0);
        assert_eq!(engine.inner.transport_count(), 0);
    }
}
