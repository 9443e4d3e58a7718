//! relaycast
//!
//! Media-server core: live broadcast channels fed by an external encoder,
//! share-gated delivery of catalog objects and the HTTP front end serving both.

pub mod catalog;
pub mod channel;
pub mod daemon;
pub mod encode;
pub mod gateway;
pub mod object;
pub mod playlist;
pub mod server;
pub mod share;
pub mod startup;
pub mod store;

pub use relaycast_config as config;
pub use relaycast_config::Config;
pub use catalog::{CatalogError, CatalogObject, ObjectCatalog};
pub use channel::{
    Channel, ChannelDraft, ChannelError, ChannelState, ChannelStatus, ChannelSupervisor,
    StreamType, SupervisorSettings,
};
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeParams, EncoderLauncher, FfmpegLauncher};
pub use gateway::{AccessPolicy, ConsumeOutcome, ConsumeRequest, DeliveryGateway, GatewayError};
pub use object::{ObjectRef, ObjectType};
pub use playlist::{assemble, Playlist, PlaylistEntry, PlaylistFormat, ShareCredentials};
pub use server::{create_router, serve, AppState, ServerError};
pub use share::{AccessDenied, DenyReason, InvalidShare, Share, ShareAction, ShareDraft};
pub use startup::{run_startup_checks, StartupError};
pub use store::{ChannelStore, ShareStore, SqliteStore, StoreError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
