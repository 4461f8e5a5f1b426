//! Configuration types for the RTC bridge

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, RtcError};

/// Environment variable overriding [`BridgeConfig::log_filter`]
pub const ENV_LOG: &str = "RTC_BRIDGE_LOG";
/// Environment variable overriding [`BridgeConfig::thread_name_prefix`]
pub const ENV_THREAD_PREFIX: &str = "RTC_BRIDGE_THREAD_PREFIX";
/// Environment variable overriding [`BridgeConfig::max_message_size`]
pub const ENV_MAX_MESSAGE_SIZE: &str = "RTC_BRIDGE_MAX_MESSAGE_SIZE";

/// Bridge-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Engine threads are named `{prefix}-network`, `{prefix}-worker`,
    /// `{prefix}-signaling` (default: "rtc")
    pub thread_name_prefix: String,

    /// tracing filter directive used when `RUST_LOG` is unset (default: "info")
    pub log_filter: String,

    /// Largest data channel payload accepted by `send_async`, in bytes
    /// (default: 256 KiB)
    pub max_message_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "rtc".to_string(),
            log_filter: "info".to_string(),
            max_message_size: 256 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `RTC_BRIDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(filter) = std::env::var(ENV_LOG) {
            self.log_filter = filter;
        }
        if let Ok(prefix) = std::env::var(ENV_THREAD_PREFIX) {
            self.thread_name_prefix = prefix;
        }
        if let Ok(size) = std::env::var(ENV_MAX_MESSAGE_SIZE) {
            self.max_message_size = size.parse().map_err(|_| {
                Error::config(format!("{ENV_MAX_MESSAGE_SIZE} must be an integer, got {size}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.thread_name_prefix.is_empty() {
            return Err(Error::config("thread_name_prefix must not be empty"));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(Error::config("thread_name_prefix must not contain NUL"));
        }
        if self.max_message_size == 0 {
            return Err(Error::config("max_message_size must be greater than 0"));
        }
        Ok(())
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceTransportsType {
    None,
    Relay,
    NoHost,
    #[default]
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinualGatheringPolicy {
    #[default]
    GatherOnce,
    GatherContinually,
}

/// Peer connection configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_type: IceTransportsType,
    pub continual_gathering_policy: ContinualGatheringPolicy,
}

impl RtcConfiguration {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject server URLs the engine would refuse
    pub fn validate(&self) -> std::result::Result<(), RtcError> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(RtcError::invalid_parameter("ICE server without urls"));
            }
            for url in &server.urls {
                let scheme = url.split(':').next().unwrap_or_default();
                match scheme {
                    "stun" | "stuns" => {}
                    "turn" | "turns" => {
                        if server.username.is_empty() || server.password.is_empty() {
                            return Err(RtcError::invalid_parameter(format!(
                                "TURN server {url} requires username and password"
                            )));
                        }
                    }
                    _ => {
                        return Err(RtcError::new(
                            crate::error::RtcErrorKind::SyntaxError,
                            format!("invalid ICE server url: {url}"),
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

/// Options for `create_offer` / `create_answer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferAnswerOptions {
    pub ice_restart: bool,
    pub use_rtp_mux: bool,
    /// `None` leaves the engine default
    pub offer_to_receive_audio: Option<bool>,
    pub offer_to_receive_video: Option<bool>,
    pub voice_activity_detection: bool,
}

impl Default for OfferAnswerOptions {
    fn default() -> Self {
        Self {
            ice_restart: false,
            use_rtp_mux: true,
            offer_to_receive_audio: None,
            offer_to_receive_video: None,
            voice_activity_detection: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    VeryLow,
    Low,
    Medium,
    High,
}

/// Data channel creation parameters.
///
/// Optional fields stay `None` unless set, so "unset" never turns into zero
/// on the way to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelInit {
    /// Stream id; `None` lets the engine pick one (required when `negotiated`)
    pub id: Option<u16>,
    pub negotiated: bool,
    pub ordered: bool,
    pub protocol: String,
    pub reliable: bool,
    /// Milliseconds
    pub max_retransmit_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub priority: Option<Priority>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            id: None,
            negotiated: false,
            ordered: true,
            protocol: String::new(),
            reliable: true,
            max_retransmit_time: None,
            max_retransmits: None,
            priority: None,
        }
    }
}

impl DataChannelInit {
    pub fn validate(&self) -> std::result::Result<(), RtcError> {
        if self.max_retransmit_time.is_some() && self.max_retransmits.is_some() {
            return Err(RtcError::invalid_parameter(
                "max_retransmit_time and max_retransmits are mutually exclusive",
            ));
        }
        if self.reliable && (self.max_retransmit_time.is_some() || self.max_retransmits.is_some())
        {
            return Err(RtcError::invalid_parameter(
                "reliable channels cannot limit retransmissions",
            ));
        }
        if self.negotiated && self.id.is_none() {
            return Err(RtcError::invalid_parameter(
                "negotiated channels require an explicit id",
            ));
        }
        if self.id == Some(u16::MAX) {
            return Err(RtcError::new(
                crate::error::RtcErrorKind::InvalidRange,
                "data channel id 65535 is reserved",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransceiverDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
    Stopped,
}

impl TransceiverDirection {
    pub fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }

    /// Direction seen from the other end of the link
    pub fn reversed(self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => other,
        }
    }

    pub fn as_sdp(self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive | Self::Stopped => "inactive",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpTransceiverInit {
    pub direction: TransceiverDirection,
    pub stream_ids: Vec<String>,
}
