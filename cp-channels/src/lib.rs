//! Collaborator boundary for ChatPilot.
//!
//! The desktop chat client is driven by an out-of-process UI-automation
//! bridge. This crate only describes what the engine needs from it: full
//! message snapshots, classification, enrichment and sends.

mod error;
mod http_bridge;
mod traits;
mod types;

pub use error::{ChannelError, Result};
pub use http_bridge::HttpBridgeSurface;
pub use traits::ChatSurface;
pub use types::{
    CaptureFlags, ConversationId, MediaKind, MessageId, MessageKind, MessageRecord,
    RawMessageItem,
};
