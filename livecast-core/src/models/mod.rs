pub mod chat;
pub mod stream;

pub use chat::{
    next_message_id, ChatMessage, ChatParticipant, JoinChatResponse,
    MessageType, SendMessageRequest, WarningStatus,
};
pub use stream::{
    CreateStreamRequest, StreamCreated, StreamSession, StreamState, StreamSummary, ViewerCount,
};
