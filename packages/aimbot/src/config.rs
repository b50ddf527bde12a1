use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use convo_bridge::{BridgeConfig, ClearInFlight, ReconnectPolicy};

use crate::dify::DifyConfig;
use crate::relay::RelayConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / aimbot.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   aimbot.toml:     [backend]
//                    api_key = "app-..."
//
//   env var:         AIMBOT_BACKEND__API_KEY=app-...   (double underscore = nesting)
//
//   (single underscore stays within field names: AIMBOT_BRIDGE__DEBOUNCE_MS)

pub const DEFAULT_CONFIG_FILE: &str = "aimbot.toml";

const REDACTED: &str = "<redacted>";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub logging: LoggingFileConfig,
}

/// Messaging relay connection (lives under `[transport]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_screen_name")]
    pub screen_name: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Inbound events buffered between the relay and the bridge.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            screen_name: default_screen_name(),
            password: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Dify chat application (lives under `[backend]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Conversation pacing (lives under `[bridge]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_short_message_threshold")]
    pub short_message_threshold: usize,
    #[serde(default = "default_typing_interval_secs")]
    pub typing_interval_secs: u64,
    #[serde(default = "default_typing_delay_min_ms")]
    pub typing_delay_min_ms: u64,
    /// 0 disables the pause before typing starts.
    #[serde(default = "default_typing_delay_max_ms")]
    pub typing_delay_max_ms: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default)]
    pub clear_in_flight: ClearInFlight,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            short_message_threshold: default_short_message_threshold(),
            typing_interval_secs: default_typing_interval_secs(),
            typing_delay_min_ms: default_typing_delay_min_ms(),
            typing_delay_max_ms: default_typing_delay_max_ms(),
            max_message_len: default_max_message_len(),
            chunk_delay_ms: default_chunk_delay_ms(),
            clear_in_flight: ClearInFlight::default(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoggingFileConfig {
    /// Also append logs (without colours) to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:5190/relay".to_string()
}
fn default_screen_name() -> String {
    "AIGURU9000".to_string()
}
fn default_event_capacity() -> usize {
    256
}
fn default_api_url() -> String {
    "http://localhost/v1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_debounce_ms() -> u64 {
    1500
}
fn default_short_message_threshold() -> usize {
    10
}
fn default_typing_interval_secs() -> u64 {
    5
}
fn default_typing_delay_min_ms() -> u64 {
    1000
}
fn default_typing_delay_max_ms() -> u64 {
    3000
}
fn default_max_message_len() -> usize {
    2000
}
fn default_chunk_delay_ms() -> u64 {
    500
}
fn default_mailbox_capacity() -> usize {
    64
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_secs() -> u64 {
    5
}

/// Build a figment that layers: defaults → config file → AIMBOT_* env vars.
///
/// A missing config file is not an error.
///
/// Env vars use double-underscore for nesting into sections:
///   `AIMBOT_BACKEND__API_KEY=app-x`  →  `backend.api_key = "app-x"`
///   `AIMBOT_BRIDGE__CLEAR_IN_FLIGHT=cancel`  →  `bridge.clear_in_flight = "cancel"`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("AIMBOT_").split("__"))
}

impl FileConfig {
    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut fc = self.clone();
        if fc.transport.password.is_some() {
            fc.transport.password = Some(REDACTED.to_string());
        }
        if !fc.backend.api_key.is_empty() {
            fc.backend.api_key = REDACTED.to_string();
        }
        fc
    }

    /// Reject settings the bot cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.backend.api_key.trim().is_empty() {
            bail!("backend.api_key is not set (use AIMBOT_BACKEND__API_KEY or [backend] api_key)");
        }
        if self.transport.screen_name.trim().is_empty() {
            bail!("transport.screen_name must not be empty");
        }
        if self.bridge.max_message_len == 0 {
            bail!("bridge.max_message_len must be positive");
        }
        if self.bridge.typing_interval_secs == 0 {
            bail!("bridge.typing_interval_secs must be positive");
        }
        if self.bridge.typing_delay_max_ms != 0
            && self.bridge.typing_delay_min_ms > self.bridge.typing_delay_max_ms
        {
            bail!("bridge.typing_delay_min_ms exceeds bridge.typing_delay_max_ms");
        }
        Ok(())
    }
}

/// Engine view of `[bridge]` and `[reconnect]`.
pub fn bridge_config_from_file(bc: &BridgeFileConfig, rc: &ReconnectFileConfig) -> BridgeConfig {
    let pre_typing_delay = (bc.typing_delay_max_ms > 0).then(|| {
        Duration::from_millis(bc.typing_delay_min_ms)..=Duration::from_millis(bc.typing_delay_max_ms)
    });

    BridgeConfig {
        debounce_delay: Duration::from_millis(bc.debounce_ms),
        short_message_threshold: bc.short_message_threshold,
        typing_interval: Duration::from_secs(bc.typing_interval_secs),
        pre_typing_delay,
        max_message_len: bc.max_message_len,
        chunk_delay: Duration::from_millis(bc.chunk_delay_ms),
        clear_in_flight: bc.clear_in_flight,
        mailbox_capacity: bc.mailbox_capacity,
        reconnect: ReconnectPolicy {
            max_attempts: rc.max_attempts,
            base_delay: Duration::from_secs(rc.base_delay_secs),
        },
    }
}

impl RelayConfig {
    pub fn from_file(fc: &TransportFileConfig) -> Self {
        Self {
            url: fc.url.clone(),
            screen_name: fc.screen_name.clone(),
            password: fc.password.clone(),
        }
    }
}

impl DifyConfig {
    pub fn from_file(fc: &BackendFileConfig) -> Self {
        Self {
            api_url: fc.api_url.clone(),
            api_key: fc.api_key.clone(),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}
