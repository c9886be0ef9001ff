//! In-process media engine
//!
//! `LocalMediaEngine` performs the negotiation bookkeeping of an SFU router
//! (transport allocation, DTLS connect, producer registration, capability
//! matching, paused consumers) without touching RTP. It backs the default
//! server build and every test in the workspace; a real SFU is plugged in by
//! implementing [`MediaEngine`] instead.

use crate::config::{CodecConfig, SfuConfig};
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, EngineError, EngineEvent, MediaEngine, RtpCapabilities,
    RtpParameters, TransportOptions, TransportRole,
};
use crate::track::MediaKind;
use crate::types::{ConsumerId, ProducerId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use webrtc::dtls_transport::dtls_transport_state::RTCDtlsTransportState;
use webrtc::ice_transport::ice_transport_state::RTCIceTransportState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct LocalTransport {
    role: TransportRole,
    connected: bool,
}

#[derive(Debug, Clone)]
struct LocalProducer {
    transport_id: TransportId,
    codec: CodecConfig,
}

#[derive(Debug, Clone)]
struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

/// Bookkeeping media engine that never forwards packets
pub struct LocalMediaEngine {
    config: Arc<SfuConfig>,
    transports: DashMap<TransportId, LocalTransport>,
    producers: DashMap<ProducerId, LocalProducer>,
    consumers: DashMap<ConsumerId, LocalConsumer>,
    next_port: AtomicU32,
    next_mid: AtomicU32,
    events: broadcast::Sender<EngineEvent>,
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new(config: Arc<SfuConfig>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            listen_ip = %config.listen_ip,
            advertised_ip = %config.advertised_ip(),
            codecs = config.media_codecs.len(),
            "Local media engine initialized"
        );
        Self {
            next_port: AtomicU32::new(u32::from(config.rtc_min_port)),
            config,
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            next_mid: AtomicU32::new(0),
            events,
        }
    }

    /// Report an ICE state change, as a real engine would from its transport callbacks
    pub fn report_ice_state(&self, transport_id: &TransportId, state: RTCIceTransportState) {
        let _ = self.events.send(EngineEvent::IceStateChanged {
            transport_id: transport_id.clone(),
            state,
        });
    }

    /// Report a DTLS state change
    pub fn report_dtls_state(&self, transport_id: &TransportId, state: RTCDtlsTransportState) {
        let _ = self.events.send(EngineEvent::DtlsStateChanged {
            transport_id: transport_id.clone(),
            state,
        });
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Whether the consumer exists and is currently paused
    #[must_use]
    pub fn is_consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.consumers.get(consumer_id).map(|c| c.paused)
    }

    fn allocate_port(&self) -> u16 {
        let min = u32::from(self.config.rtc_min_port);
        let span = u32::from(self.config.rtc_max_port).saturating_sub(min) + 1;
        let raw = self.next_port.fetch_add(1, Ordering::Relaxed);
        let port = min + raw.saturating_sub(min) % span;
        u16::try_from(port).unwrap_or(self.config.rtc_min_port)
    }

    fn router_codec(&self, mime_type: &str) -> Option<&CodecConfig> {
        self.config
            .media_codecs
            .iter()
            .find(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }

    fn codec_json(codec: &CodecConfig, payload_type: usize) -> Value {
        let mut value = json!({
            "kind": codec.kind,
            "mimeType": codec.mime_type,
            "clockRate": codec.clock_rate,
            "preferredPayloadType": 100 + payload_type,
        });
        if let Some(channels) = codec.channels {
            value["channels"] = json!(channels);
        }
        value
    }

    fn fingerprint() -> String {
        uuid::Uuid::new_v4()
            .as_bytes()
            .iter()
            .chain(uuid::Uuid::new_v4().as_bytes())
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn capabilities_support(rtp_capabilities: &RtpCapabilities, codec: &CodecConfig) -> bool {
        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs.iter().any(|c| {
                    c.get("mimeType")
                        .and_then(Value::as_str)
                        .is_some_and(|m| m.eq_ignore_ascii_case(&codec.mime_type))
                })
            })
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    fn router_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<Value> = self
            .config
            .media_codecs
            .iter()
            .enumerate()
            .map(|(i, c)| Self::codec_json(c, i))
            .collect();
        json!({ "codecs": codecs, "headerExtensions": [] })
    }

    async fn create_transport(&self, role: TransportRole) -> Result<TransportOptions, EngineError> {
        let id = TransportId::new(uuid::Uuid::new_v4().to_string());
        let port = self.allocate_port();
        self.transports.insert(
            id.clone(),
            LocalTransport {
                role,
                connected: false,
            },
        );

        debug!(transport_id = %id, ?role, port, "Local transport created");

        Ok(TransportOptions {
            id,
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true,
            }),
            ice_candidates: vec![json!({
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "ip": self.config.advertised_ip(),
                "port": port,
                "protocol": "udp",
                "type": "host",
            })],
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": Self::fingerprint() }],
            }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        let has_fingerprint = dtls_parameters
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if !has_fingerprint {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters.fingerprints must not be empty".to_string(),
            ));
        }

        let mut transport = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.clone()))?;
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        match self.transports.get(transport_id) {
            Some(t) if t.role == TransportRole::Producer => {}
            Some(_) => {
                return Err(EngineError::InvalidParameters(
                    "cannot produce on a consumer transport".to_string(),
                ))
            }
            None => return Err(EngineError::UnknownTransport(transport_id.clone())),
        }

        let mime_type = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .and_then(|c| c.get("mimeType"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::InvalidParameters("rtpParameters.codecs[0].mimeType is required".to_string())
            })?;

        let codec = self
            .router_codec(mime_type)
            .filter(|c| c.kind == kind)
            .cloned()
            .ok_or_else(|| {
                EngineError::InvalidParameters(format!("codec {mime_type} is not supported for {kind}"))
            })?;

        let producer_id = ProducerId::new(uuid::Uuid::new_v4().to_string());
        self.producers.insert(
            producer_id.clone(),
            LocalProducer {
                transport_id: transport_id.clone(),
                codec,
            },
        );
        debug!(transport_id = %transport_id, producer_id = %producer_id, %kind, "Local producer created");
        Ok(producer_id)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.producers
            .get(producer_id)
            .is_some_and(|p| Self::capabilities_support(rtp_capabilities, &p.codec))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError> {
        match self.transports.get(transport_id) {
            Some(t) if t.role == TransportRole::Consumer => {}
            Some(_) => {
                return Err(EngineError::InvalidParameters(
                    "cannot consume on a producer transport".to_string(),
                ))
            }
            None => return Err(EngineError::UnknownTransport(transport_id.clone())),
        }

        let codec = self
            .producers
            .get(producer_id)
            .map(|p| p.codec.clone())
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;
        if !Self::capabilities_support(rtp_capabilities, &codec) {
            return Err(EngineError::Incompatible(producer_id.clone()));
        }

        let consumer_id = ConsumerId::new(uuid::Uuid::new_v4().to_string());
        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let ssrc = u32::from_be_bytes(
            uuid::Uuid::new_v4().as_bytes()[..4]
                .try_into()
                .unwrap_or([0, 0, 0, 1]),
        );
        self.consumers.insert(
            consumer_id.clone(),
            LocalConsumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused: true,
            },
        );

        Ok(ConsumerDescriptor {
            consumer_id,
            producer_id: producer_id.clone(),
            kind: codec.kind,
            rtp_parameters: json!({
                "mid": mid.to_string(),
                "codecs": [Self::codec_json(&codec, 0)],
                "encodings": [{ "ssrc": ssrc }],
            }),
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::UnknownConsumer(consumer_id.clone()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::UnknownConsumer(consumer_id.clone()))?;
        consumer.paused = true;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        if self.producers.remove(producer_id).is_some() {
            self.consumers.retain(|_, c| &c.producer_id != producer_id);
        }
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }
        let closed_producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|p| &p.transport_id == transport_id)
            .map(|p| p.key().clone())
            .collect();
        for producer_id in &closed_producers {
            self.producers.remove(producer_id);
        }
        self.consumers.retain(|_, c| {
            &c.transport_id != transport_id && !closed_producers.contains(&c.producer_id)
        });
        debug!(transport_id = %transport_id, "Local transport closed");
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
