//! Named client requests and their acknowledgements
//!
//! Client frame: `{"event": "<name>", "ack": <n>?, "data": {...}}`.
//! A frame carrying `ack` is answered with `{"ack": n, "ok": true, "data": ...}`
//! or `{"ack": n, "ok": false, "error": {...}}`. Frames without `ack` are
//! fire-and-forget.

use crate::error::{Error, ErrorPayload, Result};
use crate::models::{CreateStreamRequest, SendMessageRequest};
use crate::service::{ChatService, SignalingService};
use livecast_sfu::{
    ConnectionId, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, StreamId, TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Who is calling, fixed for the lifetime of a socket
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    /// Display name from the upgrade request, used when `joinChat` names nobody
    pub display_name: Option<String>,
    pub user_id: Option<String>,
}

impl ConnectionContext {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            display_name: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    GetRouterRtpCapabilities {},
    CreateStream {
        title: String,
        broadcaster_name: String,
    },
    StartStream {
        stream_id: StreamId,
    },
    StopStream {
        stream_id: StreamId,
    },
    JoinStream {
        stream_id: StreamId,
    },
    LeaveStream {
        stream_id: StreamId,
    },
    GetStreams {},
    CreateProducerTransport {
        stream_id: StreamId,
    },
    ConnectProducerTransport {
        stream_id: StreamId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        stream_id: StreamId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    CreateConsumerTransport {
        stream_id: StreamId,
    },
    ConnectConsumerTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Consume {
        stream_id: StreamId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    },
    Resume {
        transport_id: TransportId,
    },
    JoinChat {
        stream_id: StreamId,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    LeaveChat {
        stream_id: StreamId,
    },
    SendChatMessage {
        stream_id: StreamId,
        content: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    GetChatHistory {
        stream_id: StreamId,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetChatUsers {
        stream_id: StreamId,
    },
    ChatTyping {
        stream_id: StreamId,
        #[serde(default = "default_typing")]
        is_typing: bool,
    },
    ClearChat {
        stream_id: StreamId,
    },
    GetUserWarningStatus {},
}

const fn default_typing() -> bool {
    true
}

impl ClientRequest {
    /// Wire name, for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities {} => "getRouterRtpCapabilities",
            Self::CreateStream { .. } => "createStream",
            Self::StartStream { .. } => "startStream",
            Self::StopStream { .. } => "stopStream",
            Self::JoinStream { .. } => "joinStream",
            Self::LeaveStream { .. } => "leaveStream",
            Self::GetStreams {} => "getStreams",
            Self::CreateProducerTransport { .. } => "createProducerTransport",
            Self::ConnectProducerTransport { .. } => "connectProducerTransport",
            Self::Produce { .. } => "produce",
            Self::CreateConsumerTransport { .. } => "createConsumerTransport",
            Self::ConnectConsumerTransport { .. } => "connectConsumerTransport",
            Self::Consume { .. } => "consume",
            Self::Resume { .. } => "resume",
            Self::JoinChat { .. } => "joinChat",
            Self::LeaveChat { .. } => "leaveChat",
            Self::SendChatMessage { .. } => "sendChatMessage",
            Self::GetChatHistory { .. } => "getChatHistory",
            Self::GetChatUsers { .. } => "getChatUsers",
            Self::ChatTyping { .. } => "chatTyping",
            Self::ClearChat { .. } => "clearChat",
            Self::GetUserWarningStatus {} => "getUserWarningStatus",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    ack: Option<u64>,
    #[serde(default)]
    data: Value,
}

/// A decoded client frame. `request` is an error when the event name or its
/// payload did not parse; the ack id is still available to answer it.
#[derive(Debug)]
pub struct ClientFrame {
    pub ack: Option<u64>,
    pub request: Result<ClientRequest>,
}

impl ClientFrame {
    /// Decode a text frame. `None` when it is not even a JSON object with an event name.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let raw: RawFrame = serde_json::from_str(text).ok()?;
        let data = match raw.data {
            Value::Null => json!({}),
            data => data,
        };
        let request = serde_json::from_value(json!({ "event": raw.event, "data": data }))
            .map_err(|e| Error::validation("data", format!("invalid {} request: {e}", raw.event)));
        Some(Self {
            ack: raw.ack,
            request,
        })
    }
}

/// Acknowledgement frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub ack: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Ack {
    #[must_use]
    pub fn new(ack: u64, result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self {
                ack,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::failure(ack, &e),
        }
    }

    #[must_use]
    pub fn failure(ack: u64, error: &Error) -> Self {
        Self {
            ack,
            ok: false,
            data: None,
            error: Some(error.to_payload()),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(format!("serialize response: {e}")))
}

/// Routes client requests onto the services
pub struct RequestDispatcher {
    signaling: Arc<SignalingService>,
    chat: Arc<ChatService>,
}

impl RequestDispatcher {
    pub fn new(signaling: Arc<SignalingService>, chat: Arc<ChatService>) -> Self {
        Self { signaling, chat }
    }

    /// Decode, run and acknowledge one text frame
    pub async fn handle_text(&self, ctx: &ConnectionContext, text: &str) -> Option<Ack> {
        let Some(frame) = ClientFrame::parse(text) else {
            warn!(connection_id = %ctx.connection_id, "Dropping malformed frame");
            return None;
        };
        let result = match frame.request {
            Ok(request) => self.dispatch(ctx, request).await,
            Err(e) => Err(e),
        };
        match frame.ack {
            Some(ack) => Some(Ack::new(ack, result)),
            None => {
                if let Err(e) = result {
                    debug!(connection_id = %ctx.connection_id, error = %e, "Unacknowledged request failed");
                }
                None
            }
        }
    }

    pub async fn dispatch(&self, ctx: &ConnectionContext, request: ClientRequest) -> Result<Value> {
        let caller = &ctx.connection_id;
        let name = request.name();
        debug!(connection_id = %caller, request = name, "Handling request");

        let result = match request {
            ClientRequest::GetRouterRtpCapabilities {} => Ok(self.signaling.get_router_capabilities()),
            ClientRequest::CreateStream {
                title,
                broadcaster_name,
            } => to_value(self.signaling.create_stream(
                caller,
                &CreateStreamRequest {
                    title,
                    broadcaster_name,
                },
            )?),
            ClientRequest::StartStream { stream_id } => {
                self.signaling.start_stream(caller, &stream_id)?;
                Ok(json!({ "streamId": stream_id }))
            }
            ClientRequest::StopStream { stream_id } => {
                self.signaling.stop_stream(caller, &stream_id).await?;
                // same order as a disconnect: the owner's leave notice, then the room goes
                self.chat.leave_chat(caller, &stream_id);
                self.chat.close_room(&stream_id);
                Ok(json!({ "streamId": stream_id }))
            }
            ClientRequest::JoinStream { stream_id } => {
                to_value(self.signaling.join_stream(caller, &stream_id)?)
            }
            ClientRequest::LeaveStream { stream_id } => {
                to_value(self.signaling.leave_stream(caller, &stream_id).await?)
            }
            ClientRequest::GetStreams {} => to_value(self.signaling.get_streams()),
            ClientRequest::CreateProducerTransport { stream_id } => to_value(
                self.signaling
                    .create_producer_transport(caller, &stream_id)
                    .await?,
            ),
            ClientRequest::ConnectProducerTransport {
                stream_id,
                dtls_parameters,
            } => {
                self.signaling
                    .connect_producer_transport(caller, &stream_id, &dtls_parameters)
                    .await?;
                Ok(json!({ "connected": true }))
            }
            ClientRequest::Produce {
                stream_id,
                kind,
                rtp_parameters,
            } => {
                let id = self
                    .signaling
                    .produce(caller, &stream_id, kind, &rtp_parameters)
                    .await?;
                Ok(json!({ "id": id }))
            }
            ClientRequest::CreateConsumerTransport { stream_id } => to_value(
                self.signaling
                    .create_consumer_transport(caller, &stream_id)
                    .await?,
            ),
            ClientRequest::ConnectConsumerTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.signaling
                    .connect_consumer_transport(caller, &transport_id, &dtls_parameters)
                    .await?;
                Ok(json!({ "connected": true }))
            }
            ClientRequest::Consume {
                stream_id,
                transport_id,
                rtp_capabilities,
            } => to_value(
                self.signaling
                    .consume(caller, &stream_id, &transport_id, &rtp_capabilities)
                    .await?,
            ),
            ClientRequest::Resume { transport_id } => {
                let resumed = self.signaling.resume(caller, &transport_id).await?;
                Ok(json!({ "resumed": resumed }))
            }
            ClientRequest::JoinChat {
                stream_id,
                username,
                user_id,
            } => {
                let username = username
                    .or_else(|| ctx.display_name.clone())
                    .unwrap_or_default();
                to_value(self.chat.join_chat(
                    caller,
                    &stream_id,
                    &username,
                    user_id.or_else(|| ctx.user_id.clone()),
                )?)
            }
            ClientRequest::LeaveChat { stream_id } => {
                let left = self.chat.leave_chat(caller, &stream_id);
                Ok(json!({ "left": left }))
            }
            ClientRequest::SendChatMessage {
                stream_id,
                content,
                username,
                user_id,
            } => to_value(self.chat.send_message(
                caller,
                &stream_id,
                &SendMessageRequest {
                    content,
                    username,
                    user_id,
                },
            )?),
            ClientRequest::GetChatHistory { stream_id, limit } => {
                to_value(self.chat.get_history(&stream_id, limit)?)
            }
            ClientRequest::GetChatUsers { stream_id } => {
                to_value(self.chat.get_participants(&stream_id)?)
            }
            ClientRequest::ChatTyping {
                stream_id,
                is_typing,
            } => {
                self.chat.typing(caller, &stream_id, is_typing)?;
                Ok(json!({}))
            }
            ClientRequest::ClearChat { stream_id } => {
                let cleared = self.chat.clear_history(caller, &stream_id)?;
                Ok(json!({ "cleared": cleared }))
            }
            ClientRequest::GetUserWarningStatus {} => to_value(self.chat.warning_status(caller)),
        };

        if let Err(e) = &result {
            debug!(connection_id = %caller, request = name, error = %e, "Request rejected");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::events::ServerEvent;
    use crate::service::StreamRegistry;
    use crate::test_helpers::RecordingPublisher;
    use livecast_sfu::{LocalMediaEngine, SfuConfig, TransportRegistry};

    fn dispatcher() -> (RequestDispatcher, Arc<TransportRegistry>, Arc<RecordingPublisher>) {
        let config = Arc::new(SfuConfig::default());
        let engine = Arc::new(LocalMediaEngine::new(config.clone()));
        let streams = Arc::new(StreamRegistry::new(0));
        let transports = Arc::new(TransportRegistry::new(engine, &config));
        let publisher = Arc::new(RecordingPublisher::new());
        let chat = Arc::new(
            ChatService::new(ChatConfig::default(), streams.clone(), publisher.clone()).unwrap(),
        );
        let signaling = Arc::new(SignalingService::new(
            streams,
            transports.clone(),
            publisher.clone(),
        ));
        (RequestDispatcher::new(signaling, chat), transports, publisher)
    }

    fn ctx(id: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: ConnectionId::from(id),
            display_name: Some("Bob".to_string()),
            user_id: None,
        }
    }

    #[test]
    fn test_parse_frames() {
        let frame = ClientFrame::parse(
            r#"{"event":"createStream","ack":7,"data":{"title":"T","broadcasterName":"A"}}"#,
        )
        .unwrap();
        assert_eq!(frame.ack, Some(7));
        assert_eq!(
            frame.request.unwrap(),
            ClientRequest::CreateStream {
                title: "T".to_string(),
                broadcaster_name: "A".to_string()
            }
        );

        let frame = ClientFrame::parse(r#"{"event":"getStreams"}"#).unwrap();
        assert_eq!(frame.request.unwrap(), ClientRequest::GetStreams {});

        let frame = ClientFrame::parse(r#"{"event":"getStreams","data":{}}"#).unwrap();
        assert_eq!(frame.request.unwrap(), ClientRequest::GetStreams {});

        let frame = ClientFrame::parse(r#"{"event":"produce","data":{"streamId":"s","kind":"video","rtpParameters":{}}}"#)
            .unwrap();
        assert!(matches!(
            frame.request.unwrap(),
            ClientRequest::Produce { kind: MediaKind::Video, .. }
        ));
    }

    #[test]
    fn test_parse_errors_keep_ack() {
        let frame = ClientFrame::parse(r#"{"event":"selfDestruct","ack":3}"#).unwrap();
        assert_eq!(frame.ack, Some(3));
        assert!(matches!(frame.request, Err(Error::Validation { field: "data", .. })));

        let frame = ClientFrame::parse(r#"{"event":"joinStream","ack":4,"data":{}}"#).unwrap();
        assert!(frame.request.is_err());

        assert!(ClientFrame::parse("not json").is_none());
        assert!(ClientFrame::parse(r#"{"ack":1}"#).is_none());
    }

    #[test]
    fn test_ack_wire_format() {
        let ok = serde_json::to_value(Ack::new(1, Ok(json!({ "id": "p1" })))).unwrap();
        assert_eq!(ok, json!({ "ack": 1, "ok": true, "data": { "id": "p1" } }));

        let err = Ack::new(
            2,
            Err(Error::RateLimited {
                retry_after_seconds: 4,
            }),
        );
        let err = serde_json::to_value(err).unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "RATE_LIMITED");
        assert_eq!(err["error"]["retryAfter"], 4);
        assert!(err.get("data").is_none());
    }

    #[tokio::test]
    async fn test_chat_join_defaults_to_display_name() {
        let (dispatcher, transports, _) = dispatcher();
        let owner = ctx("owner");
        transports.open_connection(&owner.connection_id);

        let created = dispatcher
            .handle_text(
                &owner,
                r#"{"event":"createStream","ack":1,"data":{"title":"T","broadcasterName":"A"}}"#,
            )
            .await
            .unwrap();
        assert!(created.ok);
        let stream_id = created.data.unwrap()["streamId"].as_str().unwrap().to_string();

        let joined = dispatcher
            .handle_text(
                &owner,
                &format!(r#"{{"event":"joinChat","ack":2,"data":{{"streamId":"{stream_id}"}}}}"#),
            )
            .await
            .unwrap();
        let data = joined.data.unwrap();
        assert_eq!(data["participant"]["username"], "Bob");
        assert_eq!(data["participant"]["isModerator"], true);
    }

    #[tokio::test]
    async fn test_errors_are_acknowledged() {
        let (dispatcher, _, _) = dispatcher();
        let ack = dispatcher
            .handle_text(&ctx("c1"), r#"{"event":"startStream","ack":9,"data":{"streamId":"nope"}}"#)
            .await
            .unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.error.unwrap().code, "NOT_FOUND_OR_UNAUTHORIZED");

        let silent = dispatcher
            .handle_text(&ctx("c1"), r#"{"event":"startStream","data":{"streamId":"nope"}}"#)
            .await;
        assert!(silent.is_none());
    }

    #[tokio::test]
    async fn test_stop_stream_announces_owner_leaving_chat() {
        let (dispatcher, transports, publisher) = dispatcher();
        let owner = ctx("owner");
        let viewer = ctx("viewer");
        transports.open_connection(&owner.connection_id);

        let created = dispatcher
            .handle_text(
                &owner,
                r#"{"event":"createStream","ack":1,"data":{"title":"T","broadcasterName":"A"}}"#,
            )
            .await
            .unwrap();
        let stream_id = created.data.unwrap()["streamId"].as_str().unwrap().to_string();
        for (who, ack) in [(&owner, 2), (&viewer, 3)] {
            let joined = dispatcher
                .handle_text(
                    who,
                    &format!(r#"{{"event":"joinChat","ack":{ack},"data":{{"streamId":"{stream_id}"}}}}"#),
                )
                .await
                .unwrap();
            assert!(joined.ok);
        }

        let stopped = dispatcher
            .handle_text(
                &owner,
                &format!(r#"{{"event":"stopStream","ack":4,"data":{{"streamId":"{stream_id}"}}}}"#),
            )
            .await
            .unwrap();
        assert!(stopped.ok);

        let left = publisher.named("userLeftChat");
        assert_eq!(left.len(), 1);
        assert!(matches!(
            &left[0].1,
            ServerEvent::UserLeftChat { connection_id, participant_count: 1, .. }
                if connection_id == &owner.connection_id
        ));
        assert_eq!(dispatcher.chat.room_count(), 0);
    }
}
