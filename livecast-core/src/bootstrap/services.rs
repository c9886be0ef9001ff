//! Service initialization and dependency injection

use std::sync::Arc;

use livecast_sfu::{MediaEngine, TransportRegistry};
use tracing::info;

use crate::dispatch::RequestDispatcher;
use crate::events::EventPublisher;
use crate::hub::ConnectionHub;
use crate::service::{ChatService, ConnectionLifecycle, SignalingService, StreamRegistry};
use crate::{Config, Result};

/// Container for all initialized services
#[derive(Clone)]
pub struct Services {
    /// Delivers published events to connected sockets
    pub hub: Arc<ConnectionHub>,
    pub streams: Arc<StreamRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub chat: Arc<ChatService>,
    pub signaling: Arc<SignalingService>,
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub dispatcher: Arc<RequestDispatcher>,
}

/// Build every registry and service around one media engine
pub fn init_services(config: &Config, engine: Arc<dyn MediaEngine>) -> Result<Services> {
    info!("Initializing services...");

    let hub = Arc::new(ConnectionHub::new());
    let publisher: Arc<dyn EventPublisher> = hub.clone();

    let streams = Arc::new(StreamRegistry::new(config.media.max_streams));
    let transports = Arc::new(TransportRegistry::new(engine, &config.media));
    let chat = Arc::new(ChatService::new(
        config.chat.clone(),
        streams.clone(),
        publisher.clone(),
    )?);
    let signaling = Arc::new(SignalingService::new(
        streams.clone(),
        transports.clone(),
        publisher.clone(),
    ));
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        streams.clone(),
        transports.clone(),
        chat.clone(),
        publisher,
    ));
    let dispatcher = Arc::new(RequestDispatcher::new(signaling.clone(), chat.clone()));

    info!(
        max_streams = config.media.max_streams,
        max_transports_per_connection = config.media.max_transports_per_connection,
        "Services initialized"
    );

    Ok(Services {
        hub,
        streams,
        transports,
        chat,
        signaling,
        lifecycle,
        dispatcher,
    })
}
