//! Media engine seam
//!
//! The SFU data plane (ICE/DTLS negotiation, RTP routing, codec handling) is
//! owned by a media engine. The signaling core only talks to it through
//! [`MediaEngine`]; RTP, DTLS and ICE parameter bodies stay opaque JSON.

use crate::track::MediaKind;
use crate::types::{ConsumerId, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::dtls_transport::dtls_transport_state::RTCDtlsTransportState;
use webrtc::ice_transport::ice_transport_state::RTCIceTransportState;

/// Router RTP capabilities or a receiver's decoding capabilities
pub type RtpCapabilities = Value;

/// RTP send/receive parameters of a producer or consumer
pub type RtpParameters = Value;

/// DTLS parameters supplied by the remote side on `connect`
pub type DtlsParameters = Value;

/// Which side of the broadcast a transport carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    /// Broadcaster to SFU
    Producer,
    /// SFU to viewer
    Consumer,
}

/// Parameters the client needs to build its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: DtlsParameters,
}

/// Everything a viewer needs to receive one forwarded track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Asynchronous state reports emitted by the media engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IceStateChanged {
        transport_id: TransportId,
        state: RTCIceTransportState,
    },
    DtlsStateChanged {
        transport_id: TransportId,
        state: RTCDtlsTransportState,
    },
}

impl EngineEvent {
    #[must_use]
    pub const fn transport_id(&self) -> &TransportId {
        match self {
            Self::IceStateChanged { transport_id, .. } | Self::DtlsStateChanged { transport_id, .. } => {
                transport_id
            }
        }
    }

    /// Failed or closed transports never recover; ICE `Disconnected` may.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::IceStateChanged { state, .. } => {
                matches!(state, RTCIceTransportState::Failed | RTCIceTransportState::Closed)
            }
            Self::DtlsStateChanged { state, .. } => {
                matches!(state, RTCDtlsTransportState::Failed | RTCDtlsTransportState::Closed)
            }
        }
    }
}

/// Media engine failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("transport {0} is unknown to the media engine")]
    UnknownTransport(TransportId),

    #[error("producer {0} is unknown to the media engine")]
    UnknownProducer(ProducerId),

    #[error("consumer {0} is unknown to the media engine")]
    UnknownConsumer(ConsumerId),

    #[error("producer {0} cannot be consumed with the given capabilities")]
    Incompatible(ProducerId),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("media engine failure: {0}")]
    Failure(String),
}

/// Opaque SFU capability.
///
/// Consumers are always created paused and must be resumed explicitly.
/// `close_*` calls are idempotent and never fail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs and header extensions supported by the router
    fn router_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self, role: TransportRole) -> Result<TransportOptions, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Whether a receiver with `rtp_capabilities` can decode the producer
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &ProducerId);

    /// Closes the transport together with everything produced or consumed on it
    async fn close_transport(&self, transport_id: &TransportId);

    /// Subscribe to transport state reports
    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let id = TransportId::from("t1");
        let failed = EngineEvent::IceStateChanged {
            transport_id: id.clone(),
            state: RTCIceTransportState::Failed,
        };
        let disconnected = EngineEvent::IceStateChanged {
            transport_id: id.clone(),
            state: RTCIceTransportState::Disconnected,
        };
        let dtls_closed = EngineEvent::DtlsStateChanged {
            transport_id: id.clone(),
            state: RTCDtlsTransportState::Closed,
        };
        let dtls_connected = EngineEvent::DtlsStateChanged {
            transport_id: id.clone(),
            state: RTCDtlsTransportState::Connected,
        };

        assert!(failed.is_terminal());
        assert!(!disconnected.is_terminal());
        assert!(dtls_closed.is_terminal());
        assert!(!dtls_connected.is_terminal());
        assert_eq!(failed.transport_id(), &id);
    }

    #[test]
    fn test_consumer_descriptor_wire_format() {
        let descriptor = ConsumerDescriptor {
            consumer_id: ConsumerId::from("c1"),
            producer_id: ProducerId::from("p1"),
            kind: MediaKind::Video,
            rtp_parameters: serde_json::json!({ "codecs": [] }),
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["consumerId"], "c1");
        assert_eq!(json["producerId"], "p1");
        assert_eq!(json["kind"], "video");
    }
}
