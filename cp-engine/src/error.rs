use cp_channels::{ChannelError, ConversationId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conversation is not being listened to: {0}")]
    UnknownConversation(ConversationId),

    #[error("conversation unavailable and deregistered: {0}")]
    ConversationUnavailable(ConversationId),

    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
