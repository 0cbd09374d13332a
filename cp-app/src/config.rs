//! ChatPilot configuration loader.
//!
//! One TOML file, read once at startup. Any error here is fatal.

use cp_channels::{CaptureFlags, ConversationId};
use cp_engine::{EngineConfig, FallbackReplies, TypingCadence};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatPilotConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub fallback: FallbackReplies,
    #[serde(default)]
    pub listen: Vec<ListenConfig>,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_system_prompt() -> String {
    "You are a friendly chat companion. Keep replies short and casual. \
     Split a longer reply into a few messages separated by ||."
        .to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint override (a local gateway, another vendor).
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_bridge_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_bridge_timeout_ms() -> u64 {
    10_000
}

/// `[engine]` knobs in wire units (milliseconds and counts).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    pub poll_interval_ms: u64,
    pub quiet_period_ms: u64,
    pub scan_interval_ms: u64,
    pub queue_capacity: usize,
    pub dedup_capacity: usize,
    pub history_exchanges: usize,
    pub reply_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub segment_delimiter: String,
    pub typing_delay_per_char_ms: u64,
    pub typing_delay_floor_ms: u64,
    pub typing_delay_cap_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        let d = EngineConfig::default();
        let ms = |v: Duration| v.as_millis() as u64;
        Self {
            poll_interval_ms: ms(d.poll_interval),
            quiet_period_ms: ms(d.quiet_period),
            scan_interval_ms: ms(d.scan_interval),
            queue_capacity: d.queue_capacity,
            dedup_capacity: d.dedup_capacity,
            history_exchanges: d.history_exchanges,
            reply_timeout_ms: ms(d.reply_timeout),
            send_timeout_ms: ms(d.send_timeout),
            segment_delimiter: d.segment_delimiter,
            typing_delay_per_char_ms: ms(d.typing.per_char),
            typing_delay_floor_ms: ms(d.typing.floor),
            typing_delay_cap_ms: ms(d.typing.cap),
            shutdown_grace_ms: ms(d.shutdown_grace),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    pub conversation_id: String,
    #[serde(flatten)]
    pub capture: CaptureFlags,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "127.0.0.1:7878".to_string(),
            http_timeout_seconds: 30,
            http_max_in_flight: 64,
        }
    }
}

impl ChatPilotConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("CHATPILOT_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = var("CHATPILOT_BRIDGE_URL") {
            self.bridge.base_url = v;
        }
        if let Some(v) = var("CHATPILOT_BRIDGE_TOKEN") {
            self.bridge.auth_token = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.api_key_for_model().is_none() {
            let which = if is_anthropic_model(&self.general.model) {
                "keys.anthropic_api_key (or ANTHROPIC_API_KEY)"
            } else {
                "keys.openai_api_key (or OPENAI_API_KEY)"
            };
            return Err(anyhow::anyhow!(
                "{which} is required for model {}",
                self.general.model
            ));
        }
        if self.bridge.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("bridge.base_url is required"));
        }
        if self.bridge.request_timeout_ms == 0 || self.llm.timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "bridge.request_timeout_ms and llm.timeout_ms must be > 0"
            ));
        }
        self.engine_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("engine: {e}"))?;

        let mut seen = HashSet::new();
        for target in &self.listen {
            let id = target.conversation_id.trim();
            if id.is_empty() {
                return Err(anyhow::anyhow!("listen.conversation_id must not be empty"));
            }
            if !seen.insert(id) {
                return Err(anyhow::anyhow!("duplicate listen target: {id}"));
            }
        }

        if self.control.enabled {
            self.control_addr()?;
            if self.control.http_timeout_seconds == 0 || self.control.http_max_in_flight == 0 {
                return Err(anyhow::anyhow!(
                    "control.http_timeout_seconds and control.http_max_in_flight must be > 0"
                ));
            }
        }
        Ok(())
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        let key = if is_anthropic_model(&self.general.model) {
            self.keys.anthropic_api_key.as_ref()
        } else {
            self.keys.openai_api_key.as_ref()
        };
        key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;
        let ms = Duration::from_millis;
        EngineConfig {
            poll_interval: ms(e.poll_interval_ms),
            quiet_period: ms(e.quiet_period_ms),
            scan_interval: ms(e.scan_interval_ms),
            queue_capacity: e.queue_capacity,
            dedup_capacity: e.dedup_capacity,
            history_exchanges: e.history_exchanges,
            reply_timeout: ms(e.reply_timeout_ms),
            send_timeout: ms(e.send_timeout_ms),
            segment_delimiter: e.segment_delimiter.clone(),
            typing: TypingCadence {
                per_char: ms(e.typing_delay_per_char_ms),
                floor: ms(e.typing_delay_floor_ms),
                cap: ms(e.typing_delay_cap_ms),
            },
            shutdown_grace: ms(e.shutdown_grace_ms),
            fallback_replies: self.fallback.clone(),
        }
    }

    pub fn listen_targets(&self) -> Vec<(ConversationId, CaptureFlags)> {
        self.listen
            .iter()
            .map(|t| (ConversationId::from(t.conversation_id.trim()), t.capture))
            .collect()
    }

    pub fn control_addr(&self) -> anyhow::Result<SocketAddr> {
        self.control
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid control.bind_addr {:?}: {e}", self.control.bind_addr))
    }
}

fn is_anthropic_model(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("claude-")
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chatpilot").join("config.toml")
}
