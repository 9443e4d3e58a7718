//! Catalog object model.
//!
//! Every object a share or channel can point at is one of a closed set of
//! types. What each type can do (hold children, be downloaded directly,
//! feed a channel) lives in one capability table instead of being decided
//! by string comparisons at each call site.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Song,
    Video,
    Album,
    Playlist,
    Channel,
}

/// What a given object type supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Expands into an ordered list of child media.
    pub container: bool,
    /// Is a single playable file.
    pub media: bool,
    /// Can be handed to the plain download path as-is.
    pub direct_download: bool,
    /// Can be the source of a live channel.
    pub feeds_channel: bool,
}

impl ObjectType {
    pub const ALL: [ObjectType; 5] = [
        ObjectType::Song,
        ObjectType::Video,
        ObjectType::Album,
        ObjectType::Playlist,
        ObjectType::Channel,
    ];

    pub fn capabilities(self) -> Capabilities {
        match self {
            ObjectType::Song | ObjectType::Video => Capabilities {
                container: false,
                media: true,
                direct_download: true,
                feeds_channel: true,
            },
            ObjectType::Album | ObjectType::Playlist => Capabilities {
                container: true,
                media: false,
                direct_download: false,
                feeds_channel: true,
            },
            ObjectType::Channel => Capabilities {
                container: false,
                media: false,
                direct_download: false,
                feeds_channel: false,
            },
        }
    }

    pub fn is_container(self) -> bool {
        self.capabilities().container
    }

    pub fn is_media(self) -> bool {
        self.capabilities().media
    }

    pub fn is_direct_download(self) -> bool {
        self.capabilities().direct_download
    }

    pub fn can_feed_channel(self) -> bool {
        self.capabilities().feeds_channel
    }

    /// Persisted / wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Song => "song",
            ObjectType::Video => "video",
            ObjectType::Album => "album",
            ObjectType::Playlist => "playlist",
            ObjectType::Channel => "channel",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted or requested type name is not a known object type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown object type: {0}")]
pub struct UnknownObjectType(pub String);

impl FromStr for ObjectType {
    type Err = UnknownObjectType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownObjectType(s.to_string()))
    }
}

/// Reference to one catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub object_id: i64,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, object_id: i64) -> Self {
        Self {
            object_type,
            object_id,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}
