use crate::error::{EngineError, Result};
use crate::reply::ReplyFailureKind;
use crate::sender::TypingCadence;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the polling, debounce and dispatch workers.
///
/// Defaults mirror the observed behavior of the desktop bot: one poll per
/// second, five pending utterances per conversation, a hundred remembered
/// message ids and five remembered exchanges.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// How long a conversation must stay silent before its queue is flushed.
    pub quiet_period: Duration,
    /// Cadence of the idle scan; kept at or below one second.
    pub scan_interval: Duration,
    pub queue_capacity: usize,
    pub dedup_capacity: usize,
    pub history_exchanges: usize,
    pub reply_timeout: Duration,
    pub send_timeout: Duration,
    pub segment_delimiter: String,
    pub typing: TypingCadence,
    pub shutdown_grace: Duration,
    pub fallback_replies: FallbackReplies,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            quiet_period: Duration::from_secs(3),
            scan_interval: Duration::from_millis(500),
            queue_capacity: 5,
            dedup_capacity: 100,
            history_exchanges: 5,
            reply_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            segment_delimiter: "||".to_string(),
            typing: TypingCadence::default(),
            shutdown_grace: Duration::from_secs(30),
            fallback_replies: FallbackReplies::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval must be > 0"));
        }
        if self.scan_interval.is_zero() || self.scan_interval > Duration::from_secs(1) {
            return Err(invalid("scan_interval must be within (0, 1s]"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be > 0"));
        }
        if self.dedup_capacity == 0 {
            return Err(invalid("dedup_capacity must be > 0"));
        }
        if self.reply_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(invalid("reply_timeout and send_timeout must be > 0"));
        }
        if self.segment_delimiter.is_empty() {
            return Err(invalid("segment_delimiter must not be empty"));
        }
        if self.typing.floor > self.typing.cap {
            return Err(invalid("typing delay floor must not exceed its cap"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> EngineError {
    EngineError::InvalidConfig(msg.to_string())
}

/// Canned replies sent when reply generation fails, one per failure kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackReplies {
    pub auth: String,
    pub quota: String,
    pub rate_limit: String,
    pub content_policy: String,
    pub timeout: String,
    pub network: String,
    pub unknown: String,
}

impl Default for FallbackReplies {
    fn default() -> Self {
        Self {
            auth: "Sorry, I can't reply right now. Please try again later.".to_string(),
            quota: "Sorry, I've run out of steam for today. Talk tomorrow?".to_string(),
            rate_limit: "Sorry, too many messages at once. Give me a moment.".to_string(),
            content_policy: "Sorry, I'd rather not answer that one.".to_string(),
            timeout: "Sorry, that took me too long. Could you say it again?".to_string(),
            network: "Sorry, my connection dropped. Try me again in a bit.".to_string(),
            unknown: "Sorry, something went wrong on my side.".to_string(),
        }
    }
}

impl FallbackReplies {
    pub fn for_kind(&self, kind: ReplyFailureKind) -> &str {
        match kind {
            ReplyFailureKind::Auth => &self.auth,
            ReplyFailureKind::Quota => &self.quota,
            ReplyFailureKind::RateLimit => &self.rate_limit,
            ReplyFailureKind::ContentPolicy => &self.content_policy,
            ReplyFailureKind::Timeout => &self.timeout,
            ReplyFailureKind::Network => &self.network,
            ReplyFailureKind::Unknown => &self.unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn validate_rejects_degenerate_knobs() {
        let cfg = EngineConfig {
            queue_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidConfig(_))));

        let cfg = EngineConfig {
            scan_interval: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            segment_delimiter: String::new(),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            typing: TypingCadence {
                per_char: Duration::from_millis(10),
                floor: Duration::from_secs(5),
                cap: Duration::from_secs(1),
            },
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn every_failure_kind_has_its_own_fallback() {
        let replies = FallbackReplies::default();
        let kinds = [
            ReplyFailureKind::Auth,
            ReplyFailureKind::Quota,
            ReplyFailureKind::RateLimit,
            ReplyFailureKind::ContentPolicy,
            ReplyFailureKind::Timeout,
            ReplyFailureKind::Network,
            ReplyFailureKind::Unknown,
        ];
        let mut texts: Vec<&str> = kinds.iter().map(|k| replies.for_kind(*k)).collect();
        texts.sort_unstable();
        texts.dedup();
        assert_eq!(texts.len(), kinds.len());
    }
}
