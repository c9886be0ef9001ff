//! Request handlers for stream control and WebRTC negotiation
//!
//! Every handler checks that the caller owns the stream or transport it
//! names. Unknown ids and foreign ids fail with the same
//! [`Error::NotFoundOrUnauthorized`]. After each media-engine await the
//! stream is looked up again, because a disconnect may have torn it down in
//! the meantime.

use crate::error::{Error, Result};
use crate::events::{EventPublisher, ServerEvent, Topic};
use crate::models::{CreateStreamRequest, StreamCreated, StreamState, StreamSummary, ViewerCount};
use crate::service::{publish_listing, publish_stream_ended};
use crate::service::stream::{EndedStream, StreamRegistry};
use livecast_sfu::{
    ConnectionId, ConsumerDescriptor, DtlsParameters, MediaKind, ProducerId, RtpCapabilities,
    RtpParameters, StreamId, TransportId, TransportOptions, TransportRegistry, TransportRole,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SignalingService {
    streams: Arc<StreamRegistry>,
    transports: Arc<TransportRegistry>,
    publisher: Arc<dyn EventPublisher>,
}

impl SignalingService {
    pub fn new(
        streams: Arc<StreamRegistry>,
        transports: Arc<TransportRegistry>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            streams,
            transports,
            publisher,
        }
    }

    #[must_use]
    pub fn get_router_capabilities(&self) -> RtpCapabilities {
        self.transports.engine().router_capabilities()
    }

    #[must_use]
    pub fn get_streams(&self) -> Vec<StreamSummary> {
        self.streams.list_active()
    }

    pub fn create_stream(
        &self,
        caller: &ConnectionId,
        request: &CreateStreamRequest,
    ) -> Result<StreamCreated> {
        let stream_id = self
            .streams
            .create_stream(caller, &request.title, &request.broadcaster_name)?;
        self.publisher.subscribe(Topic::Stream(stream_id.clone()), caller);
        Ok(StreamCreated { stream_id })
    }

    pub fn start_stream(&self, caller: &ConnectionId, stream_id: &StreamId) -> Result<()> {
        if self.streams.start_stream(stream_id, caller)? {
            self.announce(stream_id);
        }
        Ok(())
    }

    /// Stop a stream and close every transport bound to it
    pub async fn stop_stream(&self, caller: &ConnectionId, stream_id: &StreamId) -> Result<EndedStream> {
        let ended = self.streams.stop_stream(stream_id, caller)?;
        let closed = self.transports.close_stream_transports(stream_id).await;
        debug!(stream_id = %stream_id, transports = closed.len(), "Stream transports closed");

        publish_stream_ended(&self.streams, self.publisher.as_ref(), stream_id);
        Ok(ended)
    }

    fn announce(&self, stream_id: &StreamId) {
        let Some(session) = self.streams.get(stream_id) else {
            return;
        };
        info!(stream_id = %stream_id, "Stream announced");
        self.publisher
            .publish(&Topic::Global, ServerEvent::StreamStarted(session.summary()));
        publish_listing(&self.streams, self.publisher.as_ref());
    }

    fn publish_viewer_count(&self, stream_id: &StreamId, viewer_count: usize) {
        self.publisher.publish(
            &Topic::Stream(stream_id.clone()),
            ServerEvent::StreamViewerCount {
                stream_id: stream_id.clone(),
                viewer_count,
            },
        );
        publish_listing(&self.streams, self.publisher.as_ref());
    }

    pub fn join_stream(&self, caller: &ConnectionId, stream_id: &StreamId) -> Result<ViewerCount> {
        let viewer_count = self.streams.join_as_viewer(stream_id, caller)?;
        self.publisher.subscribe(Topic::Stream(stream_id.clone()), caller);
        self.publish_viewer_count(stream_id, viewer_count);
        debug!(stream_id = %stream_id, viewer = %caller, viewer_count, "Viewer joined");
        Ok(ViewerCount { viewer_count })
    }

    /// Stop watching. Leaving a stream one is not watching is a no-op.
    pub async fn leave_stream(&self, caller: &ConnectionId, stream_id: &StreamId) -> Result<ViewerCount> {
        let left = self.streams.leave_as_viewer(stream_id, caller);
        self.publisher.unsubscribe(&Topic::Stream(stream_id.clone()), caller);
        self.transports.close_viewer_transports(stream_id, caller).await;

        let viewer_count = match left {
            Some(viewer_count) => {
                self.publish_viewer_count(stream_id, viewer_count);
                viewer_count
            }
            None => self
                .streams
                .viewer_count(stream_id)
                .ok_or(Error::NotFoundOrUnauthorized)?,
        };
        Ok(ViewerCount { viewer_count })
    }

    /// Create (or replace) the producer transport of the caller's stream
    pub async fn create_producer_transport(
        &self,
        caller: &ConnectionId,
        stream_id: &StreamId,
    ) -> Result<TransportOptions> {
        self.streams.require_owner(stream_id, caller)?;

        let created = self
            .transports
            .create_producer_transport(stream_id, caller)
            .await?;

        if let Err(e) = self
            .streams
            .set_producer_transport(stream_id, caller, created.options.id.clone())
        {
            warn!(
                stream_id = %stream_id,
                transport_id = %created.options.id,
                "Stream ended while producer transport was being created"
            );
            self.transports.close_transport(&created.options.id).await;
            return Err(e);
        }

        if let Some(replaced) = created.replaced {
            if self.streams.remove_producers(stream_id, &replaced.producers) {
                publish_listing(&self.streams, self.publisher.as_ref());
            }
        }

        Ok(created.options)
    }

    fn producer_transport(&self, caller: &ConnectionId, stream_id: &StreamId) -> Result<TransportId> {
        self.streams.require_owner(stream_id, caller)?;
        self.transports
            .producer_transport_of(stream_id)
            .ok_or(Error::NotFoundOrUnauthorized)
    }

    pub async fn connect_producer_transport(
        &self,
        caller: &ConnectionId,
        stream_id: &StreamId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        let transport_id = self.producer_transport(caller, stream_id)?;
        self.transports
            .connect(&transport_id, caller, dtls_parameters)
            .await?;
        Ok(())
    }

    /// Publish a track. The first track of an active stream announces it.
    pub async fn produce(
        &self,
        caller: &ConnectionId,
        stream_id: &StreamId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId> {
        let transport_id = self.producer_transport(caller, stream_id)?;
        let producer_id = self
            .transports
            .register_producer(&transport_id, caller, kind, rtp_parameters)
            .await?;

        let announce = match self
            .streams
            .add_producer(stream_id, caller, producer_id.clone(), kind)
        {
            Ok(announce) => announce,
            Err(e) => {
                warn!(
                    stream_id = %stream_id,
                    producer_id = %producer_id,
                    "Stream ended while producer was being created"
                );
                self.transports.close_transport(&transport_id).await;
                return Err(e);
            }
        };

        if announce {
            self.announce(stream_id);
        }
        Ok(producer_id)
    }

    fn require_active(&self, stream_id: &StreamId) -> Result<()> {
        match self.streams.state_of(stream_id) {
            Some(StreamState::Active) => Ok(()),
            Some(_) => Err(Error::StreamNotActive),
            None => Err(Error::NotFoundOrUnauthorized),
        }
    }

    pub async fn create_consumer_transport(
        &self,
        caller: &ConnectionId,
        stream_id: &StreamId,
    ) -> Result<TransportOptions> {
        self.require_active(stream_id)?;

        let options = self
            .transports
            .create_consumer_transport(stream_id, caller)
            .await?;

        if let Err(e) = self.require_active(stream_id) {
            warn!(
                stream_id = %stream_id,
                transport_id = %options.id,
                "Stream ended while consumer transport was being created"
            );
            self.transports.close_transport(&options.id).await;
            return Err(e);
        }
        Ok(options)
    }

    pub async fn connect_consumer_transport(
        &self,
        caller: &ConnectionId,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        self.require_consumer_transport(caller, transport_id, None)?;
        self.transports
            .connect(transport_id, caller, dtls_parameters)
            .await?;
        Ok(())
    }

    /// The transport must be a consumer transport of the caller, bound to
    /// `stream_id` when one is given
    fn require_consumer_transport(
        &self,
        caller: &ConnectionId,
        transport_id: &TransportId,
        stream_id: Option<&StreamId>,
    ) -> Result<()> {
        let bound = self.transports.get(transport_id).is_some_and(|t| {
            &t.owner == caller
                && t.role == TransportRole::Consumer
                && stream_id.map_or(true, |id| &t.stream_id == id)
        });
        if bound {
            Ok(())
        } else {
            Err(Error::NotFoundOrUnauthorized)
        }
    }

    /// Consume every producer of the stream the caller can decode.
    ///
    /// Undecodable producers are skipped; only an empty result is an error.
    pub async fn consume(
        &self,
        caller: &ConnectionId,
        stream_id: &StreamId,
        transport_id: &TransportId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Vec<ConsumerDescriptor>> {
        self.require_active(stream_id)?;
        self.require_consumer_transport(caller, transport_id, Some(stream_id))?;

        let producers = self.streams.producers_of(stream_id);
        if producers.is_empty() {
            return Err(Error::NoCompatibleProducers);
        }

        let consumers = self
            .transports
            .create_consumers(transport_id, caller, &producers, rtp_capabilities)
            .await?;

        if !self.streams.exists(stream_id) {
            self.transports.close_transport(transport_id).await;
            return Err(Error::NotFoundOrUnauthorized);
        }

        debug!(
            stream_id = %stream_id,
            transport_id = %transport_id,
            consumers = consumers.len(),
            producers = producers.len(),
            "Consumers created"
        );
        Ok(consumers)
    }

    /// Resume the paused consumers of a transport once the receiver is ready
    pub async fn resume(&self, caller: &ConnectionId, transport_id: &TransportId) -> Result<usize> {
        Ok(self.transports.resume_consumers(transport_id, caller).await?)
    }
}
