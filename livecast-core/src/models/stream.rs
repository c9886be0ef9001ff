use chrono::{DateTime, Utc};
use livecast_sfu::{ConnectionId, MediaKind, ProducerId, StreamId, TransportId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Created,
    Active,
    Ended,
}

/// One broadcast: a single owner, its producers, and the viewers watching it
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: StreamId,
    pub title: String,
    pub broadcaster_name: String,
    pub owner: ConnectionId,
    pub state: StreamState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub viewers: HashSet<ConnectionId>,
    pub producers: HashMap<ProducerId, MediaKind>,
    pub producer_transport_id: Option<TransportId>,
}

impl StreamSession {
    pub fn new(id: StreamId, owner: ConnectionId, title: String, broadcaster_name: String) -> Self {
        Self {
            id,
            title,
            broadcaster_name,
            owner,
            state: StreamState::Created,
            created_at: Utc::now(),
            started_at: None,
            viewers: HashSet::new(),
            producers: HashMap::new(),
            producer_transport_id: None,
        }
    }

    /// Listed for discovery: active with at least one track
    #[must_use]
    pub fn is_announced(&self) -> bool {
        self.state == StreamState::Active && !self.producers.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            broadcaster_name: self.broadcaster_name.clone(),
            start_time: self.started_at.unwrap_or(self.created_at),
            viewer_count: self.viewers.len(),
        }
    }
}

/// Public listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub id: StreamId,
    pub title: String,
    pub broadcaster_name: String,
    pub start_time: DateTime<Utc>,
    pub viewer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStreamRequest {
    pub title: String,
    pub broadcaster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCreated {
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerCount {
    pub viewer_count: usize,
}
