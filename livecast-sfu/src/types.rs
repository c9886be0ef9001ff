//! Common identifier types shared by the SFU and the signaling core

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of one persistent client connection (one socket)
    ConnectionId
);

string_id!(
    /// Identifier of a broadcast stream session
    StreamId
);

string_id!(
    /// Identifier of a WebRTC transport, assigned by the media engine
    TransportId
);

string_id!(
    /// Identifier of a published media track, assigned by the media engine
    ProducerId
);

string_id!(
    /// Identifier of a forwarded copy of a producer, assigned by the media engine
    ConsumerId
);

impl ConnectionId {
    /// Generate a fresh connection id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(16))
    }
}

impl StreamId {
    /// Generate a fresh stream id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}
