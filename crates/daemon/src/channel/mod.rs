//! Live channels.
//!
//! A channel is a persistent broadcast endpoint that relays a catalog
//! object through an external encoder process. The record itself lives in
//! the [`crate::store::ChannelStore`]; [`ChannelSupervisor`] owns the
//! process side.

pub mod probe;
pub mod relay;
pub mod supervisor;

pub use relay::{Listener, ListenerStream};
pub use supervisor::{ChannelSupervisor, SupervisorSettings};

use crate::catalog::CatalogError;
use crate::object::ObjectRef;
use crate::store::StoreError;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Port used by channels that never had one assigned.
pub const DEFAULT_PORT: u16 = 8200;

/// Delivery modes a channel advertises to players. Transcoding is the only
/// mode that stays consistent while the relay loops or shuffles sources.
pub const STREAM_TYPES: &[&str] = &["transcode"];

/// Why an encoder could not be brought up.
#[derive(Debug, Error)]
pub enum ChannelStartFailure {
    #[error("port already in use: {addr}")]
    PortInUse { addr: String },

    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encoder produced no output within {0:?}")]
    StartupTimeout(Duration),

    #[error("encoder exited during startup (code {0:?})")]
    EncoderExited(Option<i32>),

    #[error("no playable media behind {0}")]
    NoMedia(ObjectRef),
}

/// Error type for channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not found: {0}")]
    NotFound(i64),

    #[error("Invalid channel: {0}")]
    Invalid(String),

    #[error("Channel {0} is not running")]
    NotRunning(i64),

    #[error("Channel {0} is full")]
    Full(i64),

    #[error("Channel start failed: {0}")]
    Start(#[from] ChannelStartFailure),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Codec/container the relay emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Mp3,
    Ogg,
    Opus,
    Aac,
    Flac,
}

impl Default for StreamType {
    fn default() -> Self {
        Self::Mp3
    }
}

impl StreamType {
    pub const ALL: [StreamType; 5] = [
        StreamType::Mp3,
        StreamType::Ogg,
        StreamType::Opus,
        StreamType::Aac,
        StreamType::Flac,
    ];

    /// File extension used in stream URLs.
    pub fn extension(self) -> &'static str {
        match self {
            StreamType::Mp3 => "mp3",
            StreamType::Ogg => "ogg",
            StreamType::Opus => "opus",
            StreamType::Aac => "aac",
            StreamType::Flac => "flac",
        }
    }

    /// Encoder audio codec.
    pub fn codec(self) -> &'static str {
        match self {
            StreamType::Mp3 => "libmp3lame",
            StreamType::Ogg => "libvorbis",
            StreamType::Opus => "libopus",
            StreamType::Aac => "aac",
            StreamType::Flac => "flac",
        }
    }

    /// Encoder output container.
    pub fn container(self) -> &'static str {
        match self {
            StreamType::Mp3 => "mp3",
            StreamType::Ogg | StreamType::Opus => "ogg",
            StreamType::Aac => "adts",
            StreamType::Flac => "flac",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            StreamType::Mp3 => "audio/mpeg",
            StreamType::Ogg | StreamType::Opus => "audio/ogg",
            StreamType::Aac => "audio/aac",
            StreamType::Flac => "audio/flac",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stream type: {0}")]
pub struct UnknownStreamType(pub String);

impl FromStr for StreamType {
    type Err = UnknownStreamType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamType::ALL
            .into_iter()
            .find(|t| t.extension() == s)
            .ok_or_else(|| UnknownStreamType(s.to_string()))
    }
}

/// Supervisor-owned runtime fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelRuntime {
    /// Encoder pid; 0 when no process is believed to be running.
    pub pid: u32,
    pub listeners: u32,
    pub peak_listeners: u32,
    /// Unix seconds of the last successful start; 0 when stopped.
    pub start_date: i64,
}

/// Listener counters after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerCount {
    pub listeners: u32,
    pub peak_listeners: u32,
}

/// Persisted channel record.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub url: String,
    pub target: ObjectRef,
    pub interface: String,
    pub port: u16,
    pub admin_password: String,
    pub is_private: bool,
    pub max_listeners: u32,
    pub random: bool,
    pub looping: bool,
    pub stream_type: StreamType,
    pub bitrate: u32,
    pub runtime: ChannelRuntime,
    /// Computed by the store from the admin-supplied endpoint.
    pub(crate) fixed_endpoint: bool,
}

impl Channel {
    /// Whether the administrator configured both interface and port.
    pub fn fixed_endpoint(&self) -> bool {
        self.fixed_endpoint
    }

    pub fn stream_types(&self) -> &'static [&'static str] {
        STREAM_TYPES
    }

    /// Whether another listener may connect.
    pub fn has_capacity(&self) -> bool {
        self.max_listeners == 0 || self.runtime.listeners < self.max_listeners
    }

    /// Direct address of the channel endpoint, as reachable from this host.
    pub fn stream_url(&self) -> String {
        format!(
            "http://{}/stream.{}",
            probe::connect_addr(&self.interface, self.port),
            self.stream_type.extension()
        )
    }

    /// Stable external address of the relay.
    pub fn proxy_url(&self, web_path: &str) -> String {
        format!(
            "{}/channel/{}/stream.{}",
            web_path.trim_end_matches('/'),
            self.id,
            self.stream_type.extension()
        )
    }

    /// Player-facing URL; `rt` only defeats caches.
    pub fn play_url(&self, web_path: &str, now: i64) -> String {
        let filename = format!(
            "{}.{}",
            utf8_percent_encode(&self.name, NON_ALPHANUMERIC),
            self.stream_type.extension()
        );
        format!(
            "{}?rt={}&filename={}",
            self.proxy_url(web_path),
            now,
            filename
        )
    }

    pub fn status_url(&self, web_path: &str) -> String {
        format!(
            "{}/channel/{}/status.xsl",
            web_path.trim_end_matches('/'),
            self.id
        )
    }
}

fn default_bitrate() -> u32 {
    128
}

/// Admin-editable channel fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    pub target: ObjectRef,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub max_listeners: u32,
    #[serde(default)]
    pub random: bool,
    #[serde(default, rename = "loop")]
    pub looping: bool,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

impl ChannelDraft {
    pub fn new(name: impl Into<String>, target: ObjectRef) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            url: String::new(),
            target,
            interface: String::new(),
            port: 0,
            admin_password: String::new(),
            is_private: false,
            max_listeners: 0,
            random: false,
            looping: false,
            stream_type: StreamType::default(),
            bitrate: default_bitrate(),
        }
    }

    pub fn fixed_endpoint(&self) -> bool {
        !self.interface.trim().is_empty() && self.port != 0
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.name.trim().is_empty() {
            return Err(ChannelError::Invalid("name must not be empty".to_string()));
        }
        if !self.target.object_type.can_feed_channel() {
            return Err(ChannelError::Invalid(format!(
                "{} cannot be the source of a channel",
                self.target.object_type
            )));
        }
        if self.bitrate == 0 {
            return Err(ChannelError::Invalid("bitrate must be positive".to_string()));
        }
        Ok(())
    }
}

/// Display state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Running,
    Stopped,
}

impl ChannelState {
    pub fn label(self) -> &'static str {
        match self {
            ChannelState::Running => "Running",
            ChannelState::Stopped => "Stopped",
        }
    }
}

/// Monitoring view of a channel, served on the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub state: ChannelState,
    pub listeners: u32,
    pub peak_listeners: u32,
    pub max_listeners: u32,
    pub start_date: i64,
    pub target: String,
    pub stream_type: StreamType,
    pub bitrate: u32,
    pub interface: String,
    pub port: u16,
    pub fixed_endpoint: bool,
    pub play_url: String,
    pub stream_types: Vec<String>,
}

impl ChannelStatus {
    pub fn new(channel: &Channel, state: ChannelState, web_path: &str, now: i64) -> Self {
        Self {
            id: channel.id,
            name: channel.name.clone(),
            description: channel.description.clone(),
            state,
            listeners: channel.runtime.listeners,
            peak_listeners: channel.runtime.peak_listeners,
            max_listeners: channel.max_listeners,
            start_date: channel.runtime.start_date,
            target: channel.target.to_string(),
            stream_type: channel.stream_type,
            bitrate: channel.bitrate,
            interface: channel.interface.clone(),
            port: channel.port,
            fixed_endpoint: channel.fixed_endpoint,
            play_url: channel.play_url(web_path, now),
            stream_types: channel.stream_types().iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_channel(id: i64, interface: &str, port: u16) -> Channel {
    Channel {
        id,
        name: format!("Channel {}", id),
        description: String::new(),
        url: String::new(),
        target: ObjectRef::new(crate::object::ObjectType::Playlist, 1),
        interface: interface.to_string(),
        port,
        admin_password: String::new(),
        is_private: false,
        max_listeners: 0,
        random: false,
        looping: true,
        stream_type: StreamType::Mp3,
        bitrate: 128,
        runtime: ChannelRuntime::default(),
        fixed_endpoint: !interface.is_empty() && port != 0,
    }
}
