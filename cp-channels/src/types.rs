use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Classification of one observed message item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    Time,
    Recall,
    #[serde(rename = "self")]
    SelfSent,
    Friend,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Time => "time",
            Self::Recall => "recall",
            Self::SelfSent => "self",
            Self::Friend => "friend",
        }
    }
}

/// Payload a message carries beyond plain text. Enrichment can replace the
/// placeholder content with something the reply pipeline can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Picture,
    File,
    Voice,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub media: Option<MediaKind>,
}

/// One entry of a full message-list snapshot. `control` is opaque to the
/// engine and only handed back to the surface that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageItem {
    pub raw_id: MessageId,
    #[serde(default)]
    pub control: serde_json::Value,
}

/// Per-conversation enrichment switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureFlags {
    pub save_picture: bool,
    pub save_file: bool,
    pub save_voice: bool,
    pub parse_links: bool,
}

impl CaptureFlags {
    pub fn allows(&self, media: MediaKind) -> bool {
        match media {
            MediaKind::Picture => self.save_picture,
            MediaKind::File => self.save_file,
            MediaKind::Voice => self.save_voice,
            MediaKind::Link => self.parse_links,
        }
    }
}
