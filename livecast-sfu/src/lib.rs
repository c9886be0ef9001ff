//! `LiveCast` SFU layer
//!
//! The signaling core never touches RTP. Everything media related goes
//! through the [`MediaEngine`] seam, and the [`TransportRegistry`] keeps track
//! of which connection owns which transport, producer and consumer.
//!
//! ## Architecture
//!
//! - **`MediaEngine`**: opaque SFU capability (transports, producers, consumers)
//! - **`LocalMediaEngine`**: in-process engine doing negotiation bookkeeping only
//! - **`TransportRegistry`**: ownership, lifecycle and disconnect sweeps of transports
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livecast_sfu::{LocalMediaEngine, SfuConfig, TransportRegistry};
//!
//! let config = Arc::new(SfuConfig::default());
//! let engine = Arc::new(LocalMediaEngine::new(config.clone()));
//! let transports = TransportRegistry::new(engine, &config);
//!
//! transports.open_connection(&connection_id);
//! let created = transports.create_producer_transport(&stream_id, &connection_id).await?;
//! ```

mod config;
mod engine;
mod error;
mod local;
mod track;
mod transport;
mod types;

pub use config::{CodecConfig, SfuConfig};
pub use engine::{
    ConsumerDescriptor, DtlsParameters, EngineError, EngineEvent, MediaEngine, RtpCapabilities,
    RtpParameters, TransportOptions, TransportRole,
};
pub use error::{Result, TransportError};
pub use local::LocalMediaEngine;
pub use track::MediaKind;
pub use transport::{
    ClosedTransport, ConsumerEntry, CreatedTransport, TransportHandle, TransportRegistry,
    TransportState,
};
pub use types::{ConnectionId, ConsumerId, ProducerId, StreamId, TransportId};

pub use webrtc::dtls_transport::dtls_transport_state::RTCDtlsTransportState;
pub use webrtc::ice_transport::ice_transport_state::RTCIceTransportState;
